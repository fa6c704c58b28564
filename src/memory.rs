//! The resizable byte-addressable memory image: ROM + RAM + heap.
//!
//! All multi-byte values are big-endian, per the story file format. Reads
//! past the end of memory return 0; writes past the end are silently
//! dropped (§4.1, §7) — these are not fatal conditions.

use log::{trace, warn};

use crate::error::{VmError, VmErrorKind, VmResult};

/// The 36-byte Glulx header, parsed once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub ram_start: u32,
    pub ext_start: u32,
    pub end_mem: u32,
    pub stack_size: u32,
    pub start_func: u32,
    pub decoding_tbl: u32,
    pub checksum: u32,
}

const MAGIC: u32 = 0x476C_756C; // "Glul"
const HEADER_LEN: usize = 36;

impl Header {
    fn parse(image: &[u8]) -> VmResult<Self> {
        if image.len() < HEADER_LEN {
            return Err(VmError::at_load(VmErrorKind::BadImage));
        }
        let magic = be32(image, 0);
        if magic != MAGIC {
            return Err(VmError::at_load(VmErrorKind::BadImage));
        }
        Ok(Header {
            version: be32(image, 4),
            ram_start: be32(image, 8),
            ext_start: be32(image, 12),
            end_mem: be32(image, 16),
            stack_size: be32(image, 20),
            start_func: be32(image, 24),
            decoding_tbl: be32(image, 28),
            checksum: be32(image, 32),
        })
    }
}

fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// A single free or allocated block in the heap extension beyond `endMem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapBlock {
    start: u32,
    len: u32,
}

/// The VM's memory image.
#[derive(Debug, Clone)]
pub struct Memory {
    pub header: Header,
    data: Vec<u8>,
    /// Bytes `[ram_start, initial_ram_end)` as loaded from the story file,
    /// kept around so `restart` can reload RAM and `saveundo`/`save` can
    /// XOR-diff against the pristine image.
    original_ram: Vec<u8>,
    /// Free blocks in `[endMem, data.len())`, sorted by `start`, coalesced
    /// on free. Allocated regions are simply the gaps between free blocks
    /// and past the last free block up to `data.len()`.
    free_list: Vec<HeapBlock>,
    heap_start: u32,
    protect_range: Option<(u32, u32)>,
}

impl Memory {
    /// Load a story file image, validating the header.
    pub fn load(image: &[u8]) -> VmResult<Self> {
        let header = Header::parse(image)?;
        if header.end_mem < header.ram_start
            || header.ext_start < header.ram_start
            || header.end_mem % 256 != 0
            || (image.len() as u32) < header.ext_start.min(image.len() as u32)
        {
            return Err(VmError::at_load(VmErrorKind::BadImage));
        }
        if header.stack_size % 256 != 0 {
            return Err(VmError::at_load(VmErrorKind::MemorySizeConstraint));
        }

        let mut data = vec![0u8; header.end_mem as usize];
        let copy_len = (image.len() as u32).min(header.end_mem) as usize;
        data[..copy_len].copy_from_slice(&image[..copy_len]);

        let original_ram = data[header.ram_start as usize..].to_vec();

        trace!(
            "loaded image: ram_start={:#x} ext_start={:#x} end_mem={:#x} stack_size={:#x}",
            header.ram_start, header.ext_start, header.end_mem, header.stack_size
        );

        Ok(Self {
            header,
            data,
            original_ram,
            free_list: Vec::new(),
            heap_start: header.end_mem,
            protect_range: None,
        })
    }

    /// Reload RAM from the pristine image and drop the heap extension, as
    /// `restart` requires. The protected range (if any) survives.
    pub fn restart(&mut self) {
        let ram_start = self.header.ram_start as usize;
        self.data.truncate(self.header.end_mem as usize);
        self.data.resize(self.header.end_mem as usize, 0);

        let protect = self.protect_range;
        let saved_protected = protect.map(|(start, len)| {
            let start = start as usize;
            let len = len as usize;
            self.data[start..start + len].to_vec()
        });

        self.data[ram_start..].copy_from_slice(&self.original_ram);

        if let (Some((start, len)), Some(saved)) = (protect, saved_protected) {
            self.data[start as usize..start as usize + len as usize].copy_from_slice(&saved);
        }

        self.free_list.clear();
        self.heap_start = self.header.end_mem;
        debug_assert_eq!(self.data.len(), self.header.end_mem as usize);
        log::debug!("restart: memory reset to {} bytes", self.data.len());
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    #[must_use]
    pub fn ram_start(&self) -> u32 {
        self.header.ram_start
    }

    pub fn read_byte(&self, addr: u32) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    pub fn read_short(&self, addr: u32) -> u16 {
        u16::from(self.read_byte(addr)) << 8 | u16::from(self.read_byte(addr.wrapping_add(1)))
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        u32::from(self.read_short(addr)) << 16 | u32::from(self.read_short(addr.wrapping_add(2)))
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) {
        if let Some(slot) = self.data.get_mut(addr as usize) {
            *slot = value;
        }
    }

    pub fn write_short(&mut self, addr: u32, value: u16) {
        self.write_byte(addr, (value >> 8) as u8);
        self.write_byte(addr.wrapping_add(1), value as u8);
    }

    pub fn write_word(&mut self, addr: u32, value: u32) {
        self.write_short(addr, (value >> 16) as u16);
        self.write_short(addr.wrapping_add(2), value as u16);
    }

    /// `setmemsize`: grow or shrink the trailing zero region. Rejects sizes
    /// that violate the alignment/lower-bound constraint; rejection is
    /// not fatal, it's reported in-band to the opcode caller.
    pub fn set_size(&mut self, new_size: u32) -> bool {
        if new_size < self.header.end_mem || new_size % 256 != 0 {
            warn!("setmemsize rejected: new_size={new_size:#x}");
            return false;
        }
        // Shrinking past live heap blocks is the caller's problem per the
        // spec; we simply truncate/extend with zero fill.
        self.data.resize(new_size as usize, 0);
        if self.heap_start > new_size {
            self.heap_start = new_size;
            self.free_list.clear();
        }
        true
    }

    pub fn protect(&mut self, start: u32, len: u32) {
        self.protect_range = if len == 0 { None } else { Some((start, len)) };
    }

    /// `mzero`: fill `[addr, addr+len)` with zero bytes.
    pub fn zero(&mut self, addr: u32, len: u32) {
        for i in 0..len {
            self.write_byte(addr.wrapping_add(i), 0);
        }
    }

    /// `mcopy`: copy `len` bytes from `src` to `dest`, handling overlap by
    /// copying backward when `dest > src` and the ranges overlap.
    pub fn copy(&mut self, src: u32, dest: u32, len: u32) {
        if src == dest || len == 0 {
            return;
        }
        if dest > src && dest < src.wrapping_add(len) {
            for i in (0..len).rev() {
                let b = self.read_byte(src.wrapping_add(i));
                self.write_byte(dest.wrapping_add(i), b);
            }
        } else {
            for i in 0..len {
                let b = self.read_byte(src.wrapping_add(i));
                self.write_byte(dest.wrapping_add(i), b);
            }
        }
    }

    /// First-fit `malloc`. Extends memory (growing in 256-byte-aligned
    /// steps) if no free block is large enough. Returns 0 on failure.
    pub fn malloc(&mut self, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }
        if let Some(idx) = self
            .free_list
            .iter()
            .position(|block| block.len >= len)
        {
            let block = self.free_list[idx];
            if block.len == len {
                self.free_list.remove(idx);
            } else {
                self.free_list[idx] = HeapBlock {
                    start: block.start + len,
                    len: block.len - len,
                };
            }
            self.zero(block.start, len);
            return block.start;
        }

        // No room: extend memory to fit, rounded up to a multiple of 256.
        let current_end = self.data.len() as u32;
        let needed_end = current_end.saturating_add(len);
        let new_size = needed_end.div_ceil(256).saturating_mul(256);
        if new_size <= current_end {
            warn!("malloc({len}) overflowed address space");
            return 0;
        }
        self.data.resize(new_size as usize, 0);
        let start = current_end;
        let leftover = new_size - current_end - len;
        if leftover > 0 {
            self.free_list.push(HeapBlock {
                start: start + len,
                len: leftover,
            });
        }
        start
    }

    /// `mfree`: release a previously-allocated block, coalescing with
    /// adjacent free blocks. The block length is inferred from the gap
    /// between `addr` and the next free block or the end of memory — the
    /// spec does not require tracking allocation sizes separately because
    /// `mfree` receives the address, not a length, and adjacent allocated
    /// blocks are opaque to this free-list (matching the reference
    /// first-fit allocator, which keeps only a free list).
    pub fn free(&mut self, addr: u32) {
        if addr < self.heap_start || addr >= self.data.len() as u32 {
            return;
        }
        // Determine the length of the allocated block at `addr`: the gap
        // up to the next free block (or end of memory) that isn't already
        // covered by another free block starting exactly at `addr`.
        if self.free_list.iter().any(|b| b.start == addr) {
            return; // double free; ignore
        }
        let end = self
            .free_list
            .iter()
            .map(|b| b.start)
            .filter(|&s| s > addr)
            .min()
            .unwrap_or(self.data.len() as u32);
        self.free_list.push(HeapBlock {
            start: addr,
            len: end - addr,
        });
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.free_list.sort_by_key(|b| b.start);
        let mut merged: Vec<HeapBlock> = Vec::with_capacity(self.free_list.len());
        for block in self.free_list.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.start + last.len == block.start {
                    last.len += block.len;
                    continue;
                }
            }
            merged.push(block);
        }
        self.free_list = merged;
    }

    #[must_use]
    pub fn heap_start(&self) -> u32 {
        self.heap_start
    }

    /// A compact summary of the heap's free list, used by `saveundo`/`save`
    /// (`heapLength` × 4-byte words per the ZART container format).
    pub(crate) fn heap_summary(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.free_list.len() * 2 + 1);
        words.push(self.heap_start);
        for block in &self.free_list {
            words.push(block.start);
            words.push(block.len);
        }
        words
    }

    pub(crate) fn restore_heap_summary(&mut self, words: &[u32]) {
        self.free_list.clear();
        if words.is_empty() {
            self.heap_start = self.data.len() as u32;
            return;
        }
        self.heap_start = words[0];
        let mut i = 1;
        while i + 1 < words.len() {
            self.free_list.push(HeapBlock {
                start: words[i],
                len: words[i + 1],
            });
            i += 2;
        }
    }

    pub(crate) fn ram_slice(&self) -> &[u8] {
        &self.data[self.header.ram_start as usize..]
    }

    pub(crate) fn original_ram(&self) -> &[u8] {
        &self.original_ram
    }

    /// Replace RAM wholesale, as `restore`/`restoreundo` do from a
    /// snapshot. A `protect`ed range survives untouched, same as `restart`.
    pub(crate) fn replace_ram(&mut self, bytes: &[u8]) {
        let ram_start = self.header.ram_start as usize;
        let saved_protected = self.protect_range.map(|(start, len)| {
            let start = start as usize;
            let len = len as usize;
            self.data[start..start + len].to_vec()
        });

        let new_len = ram_start + bytes.len();
        self.data.resize(new_len, 0);
        self.data[ram_start..].copy_from_slice(bytes);

        if let (Some((start, len)), Some(saved)) = (self.protect_range, saved_protected) {
            self.data[start as usize..start as usize + len as usize].copy_from_slice(&saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_image() -> Vec<u8> {
        let mut img = vec![0u8; 256];
        img[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        img[4..8].copy_from_slice(&3u32.to_be_bytes()); // version
        img[8..12].copy_from_slice(&64u32.to_be_bytes()); // ram_start
        img[12..16].copy_from_slice(&128u32.to_be_bytes()); // ext_start
        img[16..20].copy_from_slice(&256u32.to_be_bytes()); // end_mem
        img[20..24].copy_from_slice(&1024u32.to_be_bytes()); // stack_size
        img[24..28].copy_from_slice(&64u32.to_be_bytes()); // start_func
        img[28..32].copy_from_slice(&0u32.to_be_bytes()); // decoding_tbl
        img
    }

    #[test]
    fn rejects_bad_magic() {
        let mut img = tiny_image();
        img[0] = 0;
        assert_eq!(
            Memory::load(&img).unwrap_err().kind,
            VmErrorKind::BadImage
        );
    }

    #[test]
    fn rejects_stack_size_not_a_multiple_of_256() {
        let mut img = tiny_image();
        img[20..24].copy_from_slice(&1000u32.to_be_bytes());
        assert_eq!(
            Memory::load(&img).unwrap_err().kind,
            VmErrorKind::MemorySizeConstraint
        );
    }

    #[test]
    fn rw_roundtrip_big_endian() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        mem.write_word(64, 0x0102_0304);
        assert_eq!(mem.read_byte(64), 0x01);
        assert_eq!(mem.read_byte(65), 0x02);
        assert_eq!(mem.read_word(64), 0x0102_0304);
        assert_eq!(mem.read_short(64), 0x0102);
    }

    #[test]
    fn out_of_range_read_is_zero_write_is_dropped() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        assert_eq!(mem.read_byte(10_000), 0);
        mem.write_byte(10_000, 0xFF); // must not panic
        assert_eq!(mem.read_byte(10_000), 0);
    }

    #[test]
    fn setmemsize_rejects_misaligned_or_too_small() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        assert!(!mem.set_size(300)); // not a multiple of 256
        assert!(!mem.set_size(0)); // below end_mem
        assert!(mem.set_size(512));
        assert_eq!(mem.size(), 512);
    }

    #[test]
    fn malloc_first_fit_and_free_coalesces() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        let a = mem.malloc(16);
        let b = mem.malloc(16);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(a >= mem.header.end_mem);
        mem.free(a);
        mem.free(b);
        // After freeing both, a subsequent malloc of the combined size
        // should succeed without growing memory further.
        let before = mem.size();
        let c = mem.malloc(32);
        assert_ne!(c, 0);
        assert_eq!(mem.size(), before);
    }

    #[test]
    fn malloc_zero_is_zero_filled() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        let addr = mem.malloc(8);
        for i in 0..8 {
            assert_eq!(mem.read_byte(addr + i), 0);
        }
    }

    #[test]
    fn mcopy_handles_forward_overlap() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        for i in 0..8 {
            mem.write_byte(64 + i, i as u8 + 1);
        }
        // Overlapping copy shifted right by 2 must not corrupt the tail.
        mem.copy(64, 66, 8);
        let out: Vec<u8> = (0..8).map(|i| mem.read_byte(66 + i)).collect();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn replace_ram_preserves_protected_range() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        let stale_ram = mem.ram_slice().to_vec(); // all zeros, pre-mutation
        mem.protect(64, 4);
        mem.write_word(64, 0xDEAD_BEEF);
        mem.write_word(68, 0x1111_1111);
        // Restoring an older RAM image (as `restore`/`restoreundo` would)
        // must not clobber the protected word.
        mem.replace_ram(&stale_ram);
        assert_eq!(mem.read_word(64), 0xDEAD_BEEF);
        assert_eq!(mem.read_word(68), 0);
    }

    #[test]
    fn restart_reloads_ram_and_preserves_protected_range() {
        let mut mem = Memory::load(&tiny_image()).unwrap();
        mem.protect(64, 4);
        mem.write_word(64, 0xDEAD_BEEF);
        mem.write_word(68, 0x1111_1111);
        mem.restart();
        assert_eq!(mem.read_word(64), 0xDEAD_BEEF);
        assert_eq!(mem.read_word(68), 0);
    }
}
