//! Exports and imports that make this crate an httpwasm guest.

use std::alloc::{self, Layout};

use crate::validate::validate;

/// Bytes in front of every allocation, holding its size so `free` can
/// rebuild the layout from the pointer alone.
const HEADER: usize = 8;

#[link(wasm_import_module = "httpwasm")]
extern "C" {
    fn read_input() -> u64;
    fn write_output(ptr: u32, len: u32);
    fn write_diagnostic(ptr: u32, len: u32);
}

fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.checked_add(HEADER)?, HEADER).ok()
}

#[no_mangle]
pub extern "C" fn alloc(size: u32) -> u32 {
    let Some(layout) = layout_for(size as usize) else {
        return 0;
    };
    // SAFETY: the layout has a non-zero size (at least HEADER bytes).
    unsafe {
        let base = alloc::alloc(layout);
        if base.is_null() {
            return 0;
        }
        (base as *mut usize).write(size as usize);
        base.add(HEADER) as u32
    }
}

#[no_mangle]
pub extern "C" fn free(ptr: u32) {
    if ptr == 0 {
        return;
    }
    // SAFETY: `ptr` was returned by `alloc`, so a size header precedes it.
    unsafe {
        let base = (ptr as usize - HEADER) as *mut u8;
        let size = (base as *const usize).read();
        if let Some(layout) = layout_for(size) {
            alloc::dealloc(base, layout);
        }
    }
}

#[no_mangle]
pub extern "C" fn run() {
    let result = validate(&read_request());
    if let Some(note) = &result.diagnostic {
        // SAFETY: the host only reads the range for the duration of the call.
        unsafe { write_diagnostic(note.as_ptr() as u32, note.len() as u32) };
    }
    // SAFETY: as above.
    unsafe { write_output(result.output.as_ptr() as u32, result.output.len() as u32) };
}

fn read_request() -> String {
    // SAFETY: host import with no preconditions.
    let handle = unsafe { read_input() };
    if handle == 0 {
        return String::new();
    }
    let (ptr, len) = ((handle >> 32) as u32, handle as u32);
    // SAFETY: the host placed `len` bytes at `ptr` and frees them only after
    // `run` returns.
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
