//! `linearsearch`, `binarysearch`, and `linkedsearch` (§4.4 array ops).
//!
//! All three share an options bitfield: bit 0 selects key-indirect mode
//! (the key argument is itself an address to read `key_size` bytes from,
//! rather than a literal value already in a register), bit 1 requests a
//! zero-key terminator (linear/linked only), bit 2 asks for the matching
//! *index* rather than the matching *address* (linear/binary only).

use crate::memory::Memory;

pub const OPT_KEY_INDIRECT: u32 = 0x01;
pub const OPT_ZERO_KEY_TERMINATES: u32 = 0x02;
pub const OPT_RETURN_INDEX: u32 = 0x04;

fn read_sized(mem: &Memory, addr: u32, size: u8) -> u32 {
    match size {
        1 => u32::from(mem.read_byte(addr)),
        2 => u32::from(mem.read_short(addr)),
        _ => mem.read_word(addr),
    }
}

/// Compare the `key_size` bytes at `addr` against `key`. When
/// `OPT_KEY_INDIRECT` is set, `key` is itself an address; otherwise it's
/// compared as a right-justified numeric value truncated to `key_size`.
fn matches(mem: &Memory, addr: u32, key: u32, key_size: u8, options: u32) -> bool {
    if options & OPT_KEY_INDIRECT != 0 {
        (0..u32::from(key_size)).all(|i| mem.read_byte(addr + i) == mem.read_byte(key + i))
    } else {
        read_sized(mem, addr, key_size) == truncate_key(key, key_size)
    }
}

fn truncate_key(key: u32, key_size: u8) -> u32 {
    match key_size {
        1 => key & 0xFF,
        2 => key & 0xFFFF,
        _ => key,
    }
}

fn is_zero_key(mem: &Memory, addr: u32, key_size: u8, options: u32) -> bool {
    if options & OPT_KEY_INDIRECT != 0 {
        (0..u32::from(key_size)).all(|i| mem.read_byte(addr + i) == 0)
    } else {
        false
    }
}

/// `linearsearch`: scan `structure[0..num_structs)` (each `struct_size`
/// bytes, key at `key_offset`) for a matching key. Returns `None` on
/// failure (callers store 0); `Some` wraps either the found address or
/// the index, depending on `OPT_RETURN_INDEX`.
#[must_use]
pub fn linear_search(
    mem: &Memory,
    key: u32,
    key_size: u8,
    structure: u32,
    struct_size: u32,
    num_structs: u32,
    key_offset: u32,
    options: u32,
) -> Option<u32> {
    let terminate_on_zero = options & OPT_ZERO_KEY_TERMINATES != 0;
    let mut i = 0u32;
    loop {
        if num_structs != u32::MAX && i >= num_structs {
            return None;
        }
        let base = structure + i * struct_size;
        let key_addr = base + key_offset;
        if terminate_on_zero && is_zero_key(mem, key_addr, key_size, options) {
            return None;
        }
        if matches(mem, key_addr, key, key_size, options) {
            return Some(result(i, base, options));
        }
        i += 1;
    }
}

/// `binarysearch`: structures must be sorted ascending by key. Unlike
/// linear search, there is no zero-key terminator option — `num_structs`
/// is always exact.
#[must_use]
pub fn binary_search(
    mem: &Memory,
    key: u32,
    key_size: u8,
    structure: u32,
    struct_size: u32,
    num_structs: u32,
    key_offset: u32,
    options: u32,
) -> Option<u32> {
    let mut lo = 0i64;
    let mut hi = i64::from(num_structs) - 1;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let base = structure + mid as u32 * struct_size;
        let key_addr = base + key_offset;
        let candidate = if options & OPT_KEY_INDIRECT != 0 {
            None
        } else {
            Some(read_sized(mem, key_addr, key_size))
        };
        let ordering = if let Some(c) = candidate {
            c.cmp(&truncate_key(key, key_size))
        } else {
            compare_indirect(mem, key_addr, key, key_size)
        };
        match ordering {
            std::cmp::Ordering::Equal => return Some(result(mid as u32, base, options)),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid - 1,
        }
    }
    None
}

fn compare_indirect(mem: &Memory, addr: u32, key: u32, key_size: u8) -> std::cmp::Ordering {
    for i in 0..u32::from(key_size) {
        let a = mem.read_byte(addr + i);
        let b = mem.read_byte(key + i);
        match a.cmp(&b) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// `linkedsearch`: walk a singly-linked list of structures via a
/// `next_offset` field (itself `key_size`... no — next-pointer width is
/// always 4 bytes per the format). `start` is the first structure's
/// address; `0` in the next-pointer field ends the list (this linked
/// form always terminates on a zero *pointer*, independent of the
/// zero-key option, which governs zero *keys* instead).
#[must_use]
pub fn linked_search(
    mem: &Memory,
    key: u32,
    key_size: u8,
    start: u32,
    key_offset: u32,
    next_offset: u32,
    options: u32,
) -> Option<u32> {
    let mut addr = start;
    while addr != 0 {
        let key_addr = addr + key_offset;
        if options & OPT_ZERO_KEY_TERMINATES != 0 && is_zero_key(mem, key_addr, key_size, options)
        {
            return None;
        }
        if matches(mem, key_addr, key, key_size, options) {
            return Some(addr);
        }
        addr = mem.read_word(addr + next_offset);
    }
    None
}

fn result(index: u32, addr: u32, options: u32) -> u32 {
    if options & OPT_RETURN_INDEX != 0 {
        index
    } else {
        addr
    }
}
