//! `gestalt` opcode: capability queries the core answers directly, with
//! everything else forwarded to the host's `GlkDispatcher::gestalt`.

use crate::glk::GlkDispatcher;

pub const SEL_GLULX_VERSION: u32 = 0;
pub const SEL_TERP_VERSION: u32 = 1;
pub const SEL_RESIZE_MEM: u32 = 2;
pub const SEL_UNDO: u32 = 3;
pub const SEL_IO_SYSTEM: u32 = 4;
pub const SEL_UNICODE: u32 = 5;
pub const SEL_MEM_COPY: u32 = 6;
pub const SEL_MALLOC: u32 = 7;
pub const SEL_MALLOC_HEAP: u32 = 8;
pub const SEL_ACCELERATION: u32 = 9;
pub const SEL_ACCEL_FUNC: u32 = 10;
pub const SEL_FLOAT: u32 = 11;
pub const SEL_EXT_UNDO: u32 = 12;
pub const SEL_DOUBLE: u32 = 13;

const TERP_VERSION: u32 = 0x0001_0003;
const GLULX_VERSION: u32 = 0x0003_0001;

/// Answer a `gestalt` query. `heap_start` and `accel_func` let the core
/// answer `MallocHeap`/`AccelFunc` without the caller pre-computing them.
pub fn query(
    glk: &mut dyn GlkDispatcher,
    selector: u32,
    arg: u32,
    heap_start: u32,
    accel_func_installed: impl Fn(u32) -> bool,
) -> u32 {
    match selector {
        SEL_GLULX_VERSION => GLULX_VERSION,
        SEL_TERP_VERSION => TERP_VERSION,
        SEL_RESIZE_MEM | SEL_UNDO | SEL_MEM_COPY | SEL_MALLOC | SEL_ACCELERATION
        | SEL_EXT_UNDO => 1,
        SEL_MALLOC_HEAP => heap_start,
        SEL_ACCEL_FUNC => u32::from(accel_func_installed(arg)),
        SEL_FLOAT | SEL_DOUBLE => 1,
        _ => glk.gestalt(selector, arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glk::NullGlk;

    #[test]
    fn core_answers_known_selectors() {
        let mut glk = NullGlk;
        assert_eq!(query(&mut glk, SEL_RESIZE_MEM, 0, 0, |_| false), 1);
        assert_eq!(query(&mut glk, SEL_MALLOC_HEAP, 0, 0x1234, |_| false), 0x1234);
        assert_eq!(query(&mut glk, SEL_ACCEL_FUNC, 7, 0, |n| n == 7), 1);
        assert_eq!(query(&mut glk, SEL_ACCEL_FUNC, 8, 0, |n| n == 7), 0);
    }

    #[test]
    fn unknown_selector_forwards_to_host() {
        let mut glk = NullGlk;
        assert_eq!(query(&mut glk, 9999, 42, 0, |_| false), 0);
    }
}
