use framewalk::{loaded_images, Context, Cursor, DwarfEngine, Register, StepEvent};

fn main() {
    // Get the current register context.
    let context = Context::current();

    // Do stack backtrace, printing what the cursor does along the way.
    let observer = |event: StepEvent| eprintln!("[{}]", event);
    let mut cursor = Cursor::new(context, DwarfEngine::new(), loaded_images())
        .unwrap()
        .with_observer(&observer);
    let mut pcs = vec![];
    while cursor.step().unwrap() {
        pcs.push(cursor.get_register(Register::Rip).unwrap());
    }

    // Resolve addresses into symbols and display.
    for pc in pcs {
        println!("{:#x}:", pc);
        backtrace::resolve(pc as _, |s| {
            println!("    {:?}", s.name());
        });
    }
}
