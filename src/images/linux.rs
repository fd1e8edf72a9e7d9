use super::{AsyncImageList, ImageRange};
use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::ffi::CStr;
use std::slice;

pub const MAX_OBJECTS_LEN: usize = 128;
const PF_X: u32 = 1;

lazy_static! {
    static ref LOADED_OBJECTS: SmallVec<[LoadedObject; MAX_OBJECTS_LEN]> = find_loaded_objects();
    static ref LOADED_IMAGES: AsyncImageList = find_loaded_images();
}

/// Real loaded addresses of one object's sections in virtual memory space.
#[derive(Default, Debug, Copy, Clone)]
pub struct LoadedObject {
    pub text: u64,
    pub text_len: u64,
    pub eh_frame_hdr: u64,
    pub eh_frame_hdr_len: u64,
    pub max_addr: u64,
    /// The object is the main executable (its `dlpi_name` is empty).
    pub is_main: bool,
    /// The object is the kernel-provided vDSO.
    pub is_vdso: bool,
}

impl LoadedObject {
    /// Determine whether the target address is in the object's text.
    #[inline]
    pub fn contains(&self, target: u64) -> bool {
        target >= self.text && target - self.text < self.text_len
    }

    #[inline]
    pub fn has_unwind_info(&self) -> bool {
        self.eh_frame_hdr != 0 && self.eh_frame_hdr_len != 0
    }
}

/// Returns every object with an executable segment loaded by the current
/// process, as seen on first use.
///
/// The first call walks the program headers and is not async-signal-safe;
/// call it once before installing a signal handler that unwinds.
#[inline]
pub fn loaded_objects() -> &'static [LoadedObject] {
    &LOADED_OBJECTS
}

/// Returns the process-wide image list, holding every executable segment of
/// every object loaded when it is first used.
///
/// Unlike [loaded_objects] this is not capped at [MAX_OBJECTS_LEN].
///
/// Hosts that track `dlopen`/`dlclose` can keep it current through
/// [AsyncImageList::append] and [AsyncImageList::remove].
#[inline]
pub fn loaded_images() -> &'static AsyncImageList {
    &LOADED_IMAGES
}

fn find_loaded_objects() -> SmallVec<[LoadedObject; MAX_OBJECTS_LEN]> {
    let mut data: SmallVec<[LoadedObject; MAX_OBJECTS_LEN]> = SmallVec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut data as *mut _ as *mut libc::c_void);
    }
    log::debug!("found {} loaded objects", data.len());
    data
}

fn find_loaded_images() -> AsyncImageList {
    let list = AsyncImageList::new();
    unsafe {
        libc::dl_iterate_phdr(Some(images_callback), &list as *const AsyncImageList as *mut libc::c_void);
    }
    log::debug!("registered {} loaded images", list.len());
    list
}

extern "C" fn images_callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
    unsafe {
        if (*info).dlpi_phnum == 0 {
            return 0;
        }
        let list = &*(data as *const AsyncImageList);
        let hdrs = slice::from_raw_parts((*info).dlpi_phdr, (*info).dlpi_phnum as usize);
        for hdr in hdrs {
            if hdr.p_type == libc::PT_LOAD && hdr.p_flags & PF_X != 0 {
                list.append(ImageRange::new((*info).dlpi_addr + hdr.p_vaddr, hdr.p_memsz));
            }
        }
    }
    0
}

extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
    unsafe {
        let data = data as *mut SmallVec<[LoadedObject; MAX_OBJECTS_LEN]>;
        if (*data).len() >= MAX_OBJECTS_LEN {
            log::warn!("more than {} loaded objects, ignoring the rest", MAX_OBJECTS_LEN);
            return 1;
        }
        if (*info).dlpi_phnum == 0 {
            return 0;
        }
        let mut object = LoadedObject::default();
        if (*info).dlpi_name.is_null() {
            object.is_main = true;
        } else {
            let name = CStr::from_ptr((*info).dlpi_name).to_bytes();
            object.is_main = name.is_empty();
            object.is_vdso = name.windows(b"linux-vdso.so".len()).any(|w| w == b"linux-vdso.so");
        }
        let hdrs = slice::from_raw_parts((*info).dlpi_phdr, (*info).dlpi_phnum as usize);
        let mut found_text = false;
        for hdr in hdrs {
            if hdr.p_type == libc::PT_LOAD {
                if hdr.p_flags & PF_X != 0 && !found_text {
                    object.text = (*info).dlpi_addr + hdr.p_vaddr;
                    object.text_len = hdr.p_memsz;
                    found_text = true;
                }
                let max_addr = (*info).dlpi_addr + hdr.p_vaddr + hdr.p_memsz;
                if object.max_addr < max_addr {
                    object.max_addr = max_addr;
                }
            }
        }
        // PT_GNU_EH_FRAME is usually near the end. Iterate backward.
        for hdr in hdrs.iter().rev() {
            if hdr.p_type == libc::PT_GNU_EH_FRAME {
                object.eh_frame_hdr = (*info).dlpi_addr + hdr.p_vaddr;
                object.eh_frame_hdr_len = hdr.p_memsz;
                break;
            }
        }
        if found_text {
            (*data).push(object);
        }
        0
    }
}
