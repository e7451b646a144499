//! DMA buffer allocation and the write/verify block layout
//! (`spec.md` §3 "Write payload shape", §4.1).
//!
//! This module is deliberately dumb: it only knows how to lay bytes out in
//! a block and compute the normalized CRC32C of one. Table bookkeeping
//! (what the last-written CRC for an LBA *should* be) lives in
//! [`crate::oracle`].

use crate::error::Result;
use crate::transport::{DmaAllocator, DmaBuffer};

/// Normalize a raw CRC32C into the oracle's value space, folding the two
/// sentinel values (`0` unmapped, `0xFFFFFFFF` uncorrectable) into their
/// neighbors so a real checksum can never collide with a sentinel
/// (`spec.md` §4.1 "CRC normalization").
pub fn normalize_crc(raw: u32) -> u32 {
    match raw {
        0 => 1,
        0xFFFF_FFFF => 0xFFFF_FFFE,
        other => other,
    }
}

/// Compute the normalized CRC32C of a single block.
pub fn block_crc32c(block: &[u8]) -> u32 {
    normalize_crc(crc32c::crc32c(block))
}

/// Write the starting LBA into the first 8 bytes of a block and a token
/// value into its last 8 bytes, leaving the remainder untouched
/// (`spec.md` §3 "Write payload shape").
pub fn stamp_block(block: &mut [u8], lba: u64, token: u64) {
    debug_assert!(block.len() >= 16, "block too small to stamp");
    block[0..8].copy_from_slice(&lba.to_le_bytes());
    let last = block.len() - 8;
    block[last..].copy_from_slice(&token.to_le_bytes());
}

/// Read the LBA stamped at the start of a block by [`stamp_block`].
pub fn stamped_lba(block: &[u8]) -> u64 {
    u64::from_le_bytes(block[0..8].try_into().expect("8-byte slice"))
}

/// Fill a multi-block write payload with per-block LBA/token stamps,
/// returning the normalized CRC32C computed for each block in order.
///
/// `token_base` is the first token value; block `i` is stamped with
/// `token_base + i`, matching `spec.md` §3: "the 8-byte token
/// (`token_base + i`)".
pub fn fill_write_payload(
    buf: &mut [u8],
    lba_start: u64,
    lba_count: u32,
    block_size: usize,
    token_base: u64,
) -> Vec<u32> {
    let mut crcs = Vec::with_capacity(lba_count as usize);
    for i in 0..lba_count as usize {
        let block = &mut buf[i * block_size..(i + 1) * block_size];
        stamp_block(block, lba_start + i as u64, token_base + i as u64);
        crcs.push(block_crc32c(block));
    }
    crcs
}

/// Allocate a zeroed DMA-suitable buffer sized for `lba_count` blocks of
/// `block_size` bytes, 4096-byte aligned per `spec.md` §6.
pub fn alloc_io_buffer(
    allocator: &dyn DmaAllocator,
    lba_count: u32,
    block_size: usize,
) -> Result<DmaBuffer> {
    allocator.alloc(lba_count as usize * block_size, 4096)
}
