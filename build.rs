fn registers_file(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("linux", "x86_64") => Some("src/registers/x64.S"),
        _ => None,
    }
}

fn main() {
    // cfg!() would describe the host; the assembly must match the target.
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if let Some(file) = registers_file(&os, &arch) {
        println!("cargo:rerun-if-changed={}", file);
        cc::Build::new().file(file).compile("registers");
    }
}
