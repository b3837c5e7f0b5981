//! Executable-memory management.
//!
//! Each finalized program maps into its own page-aligned allocation: bytes
//! are copied in while the pages are read-write, absolute relocations are
//! rebased against the final address, then protection flips to
//! read-execute. The allocation stays writable-never-executable or
//! executable-never-writable at every point.

use anyhow::{anyhow, Context, Result};
use dropforge_codegen::FinalizedCode;

/// One live executable mapping.
pub struct Mapping {
    alloc: region::Allocation,
    len: usize,
}

impl Mapping {
    /// Map `code` into fresh executable pages.
    pub fn new(code: &FinalizedCode) -> Result<Self> {
        if code.sections.iter().any(|s| s.writable) {
            // Writable data sections would need their own pages; the
            // contiguous layout keeps everything read-execute.
            return Err(anyhow!("writable sections are not supported by this runtime"));
        }
        let len = code.bytes.len().max(1);
        let mut alloc = region::alloc(round_up_to_page(len), region::Protection::READ_WRITE)
            .context("allocating jit pages")?;

        let base = alloc.as_mut_ptr::<u8>();
        unsafe {
            std::ptr::copy_nonoverlapping(code.bytes.as_ptr(), base, code.bytes.len());
        }

        // Rebase absolute fields now that the final address is known.
        for reloc in &code.base_relocs {
            unsafe {
                let at = base.add(reloc.offset as usize);
                match reloc.width {
                    4 => {
                        let old = std::ptr::read_unaligned(at as *const u32);
                        let new = (base as u64).wrapping_add(u64::from(old)) as u32;
                        std::ptr::write_unaligned(at as *mut u32, new);
                    }
                    8 => {
                        let old = std::ptr::read_unaligned(at as *const u64);
                        std::ptr::write_unaligned(at as *mut u64, (base as u64).wrapping_add(old));
                    }
                    _ => return Err(anyhow!("unexpected relocation width {}", reloc.width)),
                }
            }
        }

        unsafe {
            region::protect(base, alloc.len(), region::Protection::READ_EXECUTE)
                .context("protecting jit pages")?;
        }
        log::debug!("mapped {len} bytes of code at {base:p}");
        Ok(Self { alloc, len })
    }

    /// The entry pointer of the mapped code.
    pub fn ptr(&self) -> *const u8 {
        self.alloc.as_ptr::<u8>()
    }

    /// Mapped length in bytes (before page rounding).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing was mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn round_up_to_page(len: usize) -> usize {
    let page = region::page::size();
    (len + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let page = region::page::size();
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(page + 1), 2 * page);
    }
}
