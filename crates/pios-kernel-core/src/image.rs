//! Fixed-format executable images
//!
//! A statically linked image is a 48-byte little-endian header followed by
//! the text bytes and then the data bytes:
//!
//! ```text
//! offset  size  field
//! 0       4     magic (0x50494f53, "PIOS")
//! 4       4     flags (bit 0: text writable)
//! 8       8     entry point
//! 16      8     text virtual address (page aligned)
//! 24      8     text size
//! 32      8     data size
//! 40      8     bss size
//! ```
//!
//! Data and bss start at the first page boundary after text. One stack
//! page is mapped directly below `USTACKTOP`.

use alloc::vec::Vec;

use crate::env::Env;
use crate::error::{KernelError, KernelResult};
use crate::pmap::map_fresh;
use crate::pmem::PhysicalMemory;
use crate::types::{page_aligned, round_up, PteFlags, PGSIZE, USTACKTOP};

pub const IMAGE_MAGIC: u32 = 0x5049_4f53;

pub const HEADER_SIZE: usize = 48;

/// Map the text segment writable
pub const FLAG_TEXT_WRITABLE: u32 = 0x1;

/// Parsed image header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub flags: u32,
    pub entry: u64,
    pub text_vaddr: u64,
    pub text_size: u64,
    pub data_size: u64,
    pub bss_size: u64,
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(w)
}

fn u64_at(b: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(w)
}

impl ImageHeader {
    /// First address of the data segment
    pub fn data_vaddr(&self) -> u64 {
        round_up(self.text_vaddr + self.text_size)
    }

    /// One past the last byte of bss
    pub fn end_vaddr(&self) -> u64 {
        self.data_vaddr() + self.data_size + self.bss_size
    }

    /// Parse and validate the header of `image`.
    pub fn parse(image: &[u8]) -> KernelResult<Self> {
        if image.len() < HEADER_SIZE || u32_at(image, 0) != IMAGE_MAGIC {
            return Err(KernelError::InvalidImage);
        }
        let header = Self {
            flags: u32_at(image, 4),
            entry: u64_at(image, 8),
            text_vaddr: u64_at(image, 16),
            text_size: u64_at(image, 24),
            data_size: u64_at(image, 32),
            bss_size: u64_at(image, 40),
        };

        let body = (image.len() - HEADER_SIZE) as u64;
        let file_bytes = header
            .text_size
            .checked_add(header.data_size)
            .ok_or(KernelError::InvalidImage)?;
        if file_bytes > body {
            return Err(KernelError::InvalidImage);
        }
        // Page 0 stays unmapped; everything must end below the stack page.
        if header.text_vaddr < PGSIZE || !page_aligned(header.text_vaddr) {
            return Err(KernelError::InvalidImage);
        }
        let limit = USTACKTOP - PGSIZE;
        let end = header
            .text_vaddr
            .checked_add(header.text_size)
            .and_then(|t| t.checked_add(PGSIZE))
            .and_then(|t| t.checked_add(header.data_size))
            .and_then(|t| t.checked_add(header.bss_size))
            .ok_or(KernelError::InvalidImage)?;
        if end > limit || header.end_vaddr() > limit {
            return Err(KernelError::InvalidImage);
        }
        if header.entry < header.text_vaddr || header.entry >= header.text_vaddr + header.text_size
        {
            return Err(KernelError::InvalidImage);
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.entry.to_le_bytes());
        out[16..24].copy_from_slice(&self.text_vaddr.to_le_bytes());
        out[24..32].copy_from_slice(&self.text_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.data_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.bss_size.to_le_bytes());
        out
    }
}

/// Assemble an image from its parts.
pub fn build_image(entry: u64, text_vaddr: u64, text: &[u8], data: &[u8], bss: u64) -> Vec<u8> {
    let header = ImageHeader {
        flags: 0,
        entry,
        text_vaddr,
        text_size: text.len() as u64,
        data_size: data.len() as u64,
        bss_size: bss,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + text.len() + data.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(text);
    out.extend_from_slice(data);
    out
}

/// Map `bytes` at `[start, start + len)` into fresh zeroed pages.
fn load_segment(
    env: &mut Env,
    mem: &PhysicalMemory,
    start: u64,
    len: u64,
    bytes: &[u8],
    flags: PteFlags,
) -> KernelResult<()> {
    let space = env.space_mut()?;
    let mut va = start;
    while va < start + len {
        let frame = map_fresh(space, mem, va, flags)?;
        let offset = (va - start) as usize;
        if offset < bytes.len() {
            let n = (PGSIZE as usize).min(bytes.len() - offset);
            mem.write(frame, 0, &bytes[offset..offset + n]);
        }
        va += PGSIZE;
    }
    Ok(())
}

/// Load `image` into `env`'s address space and point its frame at the entry.
///
/// On failure the pages mapped so far stay in the space; the caller
/// destroys the environment.
pub fn load_image(env: &mut Env, mem: &PhysicalMemory, image: &[u8]) -> KernelResult<ImageHeader> {
    let header = ImageHeader::parse(image)?;
    let text_end = HEADER_SIZE + header.text_size as usize;
    let text = &image[HEADER_SIZE..text_end];
    let data = &image[text_end..text_end + header.data_size as usize];

    let user = PteFlags::PRESENT | PteFlags::USER;
    let text_flags = if header.flags & FLAG_TEXT_WRITABLE != 0 {
        user | PteFlags::WRITABLE
    } else {
        user
    };
    load_segment(env, mem, header.text_vaddr, header.text_size, text, text_flags)?;
    load_segment(
        env,
        mem,
        header.data_vaddr(),
        header.data_size + header.bss_size,
        data,
        user | PteFlags::WRITABLE,
    )?;
    load_segment(
        env,
        mem,
        USTACKTOP - PGSIZE,
        PGSIZE,
        &[],
        user | PteFlags::WRITABLE,
    )?;

    env.tf.rip = header.entry;
    env.tf.rsp = USTACKTOP;
    Ok(header)
}
