//! Instruction fetch for translators.
//!
//! Decoders read guest code only through the `translator_ld*` accessors.
//! They lock each code page the block touches and, for instrumented
//! blocks, record every fetched byte for the instruction being decoded.
//! Mirrors QEMU's `translator_ld*` in `accel/tcg/translator.c`.

use thiserror::Error;

use crate::DisasContextBase;

/// Reason guest code could not be fetched.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FetchFault {
    #[error("no code mapped at {addr:#x}")]
    Unmapped { addr: u64 },
    #[error("code at {addr:#x} is not executable")]
    NotExecutable { addr: u64 },
}

impl FetchFault {
    pub fn addr(&self) -> u64 {
        match *self {
            FetchFault::Unmapped { addr } | FetchFault::NotExecutable { addr } => addr,
        }
    }
}

/// Guest code pages as seen by the translator.
pub trait CodeSource: Sync {
    /// Page size in bytes; a power of two.
    fn page_size(&self) -> u64 {
        4096
    }

    /// Fill `buf` from `addr`. The range never crosses a page boundary.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), FetchFault>;

    /// Pin the page at `page` against modification while a block that
    /// covers it is translated.
    fn lock_page(&self, page: u64) -> Result<(), FetchFault>;

    fn unlock_page(&self, page: u64);
}

fn fetch(
    db: &mut DisasContextBase,
    code: &dyn CodeSource,
    pc: u64,
    buf: &mut [u8],
) -> Result<(), FetchFault> {
    let page_size = code.page_size();
    debug_assert!(page_size.is_power_of_two());
    let mut done = 0;
    while done < buf.len() {
        let addr = pc.wrapping_add(done as u64);
        let page = addr & !(page_size - 1);
        if !db.locked_pages.contains(&page) {
            code.lock_page(page)?;
            db.locked_pages.push(page);
        }
        let in_page = (page_size - (addr - page)) as usize;
        let n = in_page.min(buf.len() - done);
        code.read(addr, &mut buf[done..done + n])?;
        done += n;
    }
    if db.plugin_enabled {
        db.record.extend_from_slice(buf);
    }
    Ok(())
}

/// Release every page locked during the current attempt.
pub(crate) fn unlock_pages(db: &mut DisasContextBase, code: &dyn CodeSource) {
    for page in db.locked_pages.drain(..) {
        code.unlock_page(page);
    }
}

pub fn translator_ldub(
    db: &mut DisasContextBase,
    code: &dyn CodeSource,
    pc: u64,
) -> Result<u8, FetchFault> {
    let mut b = [0u8; 1];
    fetch(db, code, pc, &mut b)?;
    Ok(b[0])
}

pub fn translator_lduw(
    db: &mut DisasContextBase,
    code: &dyn CodeSource,
    pc: u64,
) -> Result<u16, FetchFault> {
    let mut b = [0u8; 2];
    fetch(db, code, pc, &mut b)?;
    Ok(u16::from_le_bytes(b))
}

pub fn translator_ldl(
    db: &mut DisasContextBase,
    code: &dyn CodeSource,
    pc: u64,
) -> Result<u32, FetchFault> {
    let mut b = [0u8; 4];
    fetch(db, code, pc, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn translator_ldq(
    db: &mut DisasContextBase,
    code: &dyn CodeSource,
    pc: u64,
) -> Result<u64, FetchFault> {
    let mut b = [0u8; 8];
    fetch(db, code, pc, &mut b)?;
    Ok(u64::from_le_bytes(b))
}
