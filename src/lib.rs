//! An endian-aware parser for Apple Mach-O dynamic libraries (thin
//! binaries, fat/universal containers, and images inside a
//! dyld_shared_cache) that extracts the metadata describing a library's
//! public ABI and emits it as a text-based stub (`.tbd`) document, the
//! format linkers consume to link against a library without its binary.
//!
//! The pipeline:
//!
//! 1. [`mach::parse_from_file`] (or [`mach::parse_from_memory`]) classifies
//!    the input by magic, validates fat slices, and parses each slice's load
//!    commands and symbol table into a [`tbd::CreateInfo`] aggregator,
//!    merging per-architecture findings.
//! 2. [`dsc::DyldSharedCache`] resolves an image's address through the
//!    cache's mappings and drives the same Mach-O parser in map mode.
//! 3. [`tbd::CreateInfo::write_to`] groups exports by architecture set and
//!    renders the TBD text.
//!
//! ```no_run
//! use std::fs::File;
//! use tapioca::tbd::{write::WriteOptions, CreateInfo, ParseOptions, TbdVersion};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = File::open("/usr/lib/libSystem.B.dylib")?;
//! let mut info = CreateInfo::new(TbdVersion::V2);
//! tapioca::mach::parse_from_file(&mut info, &file, ParseOptions::empty())?;
//! info.write_to(&mut std::io::stdout().lock(), WriteOptions::empty())?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod dsc;
pub mod mach;
pub mod range;
pub mod tbd;

pub use crate::dsc::DyldSharedCache;
pub use crate::mach::{parse_from_file, parse_from_memory, parse_from_range, ParseError};
pub use crate::tbd::write::{WriteError, WriteOptions};
pub use crate::tbd::{CreateInfo, ParseOptions, TbdVersion};

use std::fs::File;
use std::io::{self, Read};

use scroll::{Endian, Pread};

/// What a file's first bytes say it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// A thin Mach-O.
    MachO { is_64: bool, is_big_endian: bool },
    /// A fat (universal) container.
    Fat { is_64: bool },
    /// A dyld_shared_cache.
    SharedCache,
    /// Something else; the magic is attached.
    Unknown(u32),
}

/// Classifies a 16-byte prefix without touching the rest of the input.
pub fn peek_bytes(bytes: &[u8; 16]) -> Hint {
    if bytes.starts_with(dsc::DSC_MAGIC_PREFIX) {
        return Hint::SharedCache;
    }
    // infallible: the buffer is long enough
    let magic: u32 = bytes.pread_with(0, Endian::Little).unwrap();
    if let Some(ctx) = mach::header::ctx_for_magic(magic) {
        return Hint::MachO {
            is_64: ctx.is_64(),
            is_big_endian: ctx.is_big_endian(),
        };
    }
    if let Some((_, is_64)) = mach::fat::fat_ctx_for_magic(magic) {
        return Hint::Fat { is_64 };
    }
    Hint::Unknown(magic)
}

/// Reads a file's first 16 bytes once and classifies them.
pub fn peek(file: &File) -> io::Result<Hint> {
    let mut buffer = [0u8; 16];
    let mut filled = 0;
    // fill as much of the prefix as the file has, without re-reading
    while filled < buffer.len() {
        let read = (&*file).read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    if filled < 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file is too small to classify",
        ));
    }
    Ok(peek_bytes(&buffer))
}
