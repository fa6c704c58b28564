//! Test doubles for the Glk boundary, available to downstream crates via
//! the `testing` feature as well as this crate's own integration tests.

use crate::glk::{selector, GlkDispatcher, MemoryAccess};

/// A `GlkDispatcher` that records every call it receives and answers a
/// small, fixed subset of selectors well enough to drive `streamchar`/
/// `streamstr` output and `save`/`restore` through an in-memory byte
/// store, without needing a real Glk library.
#[derive(Debug, Default)]
pub struct RecordingGlk {
    pub calls: Vec<(u32, Vec<u32>)>,
    /// Characters received via `PUT_CHAR`/`PUT_CHAR_UNI`, in emission order.
    pub output: Vec<u32>,
    /// Named byte streams, keyed by the `stream_id` argument `save`/
    /// `restore` pass as their first argument.
    streams: std::collections::HashMap<u32, Vec<u8>>,
}

impl RecordingGlk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output_as_string(&self) -> String {
        self.output
            .iter()
            .filter_map(|&c| char::from_u32(c))
            .collect()
    }
}

impl GlkDispatcher for RecordingGlk {
    fn call(&mut self, sel: u32, args: &[u32], mut mem: MemoryAccess<'_>) -> u32 {
        self.calls.push((sel, args.to_vec()));
        match sel {
            selector::PUT_CHAR | selector::PUT_CHAR_UNI => {
                if let Some(&ch) = args.first() {
                    self.output.push(ch);
                }
                0
            }
            selector::SAVE_STREAM => {
                let (stream_id, addr, len) = (args[0], args[1], args[2]);
                let bytes = mem.read_bytes(addr, len);
                self.streams.insert(stream_id, bytes);
                0
            }
            selector::RESTORE_STREAM => {
                let (stream_id, addr, cap) = (args[0], args[1], args[2]);
                match self.streams.get(&stream_id) {
                    Some(bytes) => {
                        let take = bytes.len().min(cap as usize);
                        mem.write_bytes(addr, &bytes[..take]);
                        take as u32
                    }
                    None => 0,
                }
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    fn tiny_image() -> Vec<u8> {
        let mut img = vec![0u8; 256];
        img[0..4].copy_from_slice(&0x476C_756Cu32.to_be_bytes());
        img[16..20].copy_from_slice(&256u32.to_be_bytes());
        img[20..24].copy_from_slice(&1024u32.to_be_bytes());
        img
    }

    #[test]
    fn put_char_is_recorded_as_output() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        let mut glk = RecordingGlk::new();
        glk.call(selector::PUT_CHAR, &[b'h'.into()], MemoryAccess::new(&mut mem));
        glk.call(selector::PUT_CHAR, &[b'i'.into()], MemoryAccess::new(&mut mem));
        assert_eq!(glk.output_as_string(), "hi");
    }

    #[test]
    fn save_then_restore_stream_roundtrips_bytes() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        mem.write_word(64, 0xDEAD_BEEF);
        let mut glk = RecordingGlk::new();
        glk.call(selector::SAVE_STREAM, &[1, 64, 4], MemoryAccess::new(&mut mem));
        let read = glk.call(selector::RESTORE_STREAM, &[1, 128, 4], MemoryAccess::new(&mut mem));
        assert_eq!(read, 4);
        assert_eq!(mem.read_word(128), 0xDEAD_BEEF);
    }

    #[test]
    fn restore_from_unknown_stream_returns_zero() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        let mut glk = RecordingGlk::new();
        let read = glk.call(selector::RESTORE_STREAM, &[99, 64, 4], MemoryAccess::new(&mut mem));
        assert_eq!(read, 0);
    }
}
