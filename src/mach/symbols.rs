//! Nlist-style symbol tables: the raw 32/64-bit entry structs and the walker
//! that classifies external defined symbols into the aggregate.

use scroll::{Pread, Pwrite, SizeWith};

use crate::container::Ctx;
use crate::mach::arch::ArchSet;
use crate::mach::load_commands::SymtabCommand;
use crate::mach::ParseError;
use crate::range::Range;
use crate::tbd::{CreateInfo, ParseOptions, SymbolKind};

/// Mask for debugging (stab) entries in `n_type`.
pub const N_STAB: u8 = 0xe0;
/// Mask for the type bits of `n_type`.
pub const N_TYPE: u8 = 0x0e;
/// The symbol is external.
pub const N_EXT: u8 = 0x01;
/// Undefined symbol.
pub const N_UNDF: u8 = 0x0;
/// The symbol is defined in a section.
pub const N_SECT: u8 = 0xe;
/// `n_desc` bit: the defined symbol is weak.
pub const N_WEAK_DEF: u16 = 0x0080;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist32 {
    /// index into the string table
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    /// index into the string table
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

/// Classifies an external symbol by its name prefix, stripping the prefix
/// the TBD format leaves implicit. `None` means the symbol carries nothing
/// once the prefix is removed and should be skipped.
fn classify(name: &str, n_desc: u16) -> Option<(SymbolKind, &str)> {
    for (prefix, kind) in [
        ("_OBJC_CLASS_$", SymbolKind::ObjcClass),
        ("_OBJC_METACLASS_$", SymbolKind::ObjcClass),
        (".objc_class_name", SymbolKind::ObjcClass),
        ("_OBJC_IVAR_$", SymbolKind::ObjcIvar),
    ] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.is_empty() {
                return None;
            }
            return Some((kind, rest));
        }
    }
    if n_desc & N_WEAK_DEF != 0 {
        Some((SymbolKind::WeakDef, name))
    } else {
        Some((SymbolKind::Normal, name))
    }
}

/// Everything the walker needs besides the symtab command itself.
pub(crate) struct SymbolTableScan<'a> {
    /// The addressing base the symtab offsets are relative to: the slice for
    /// thin files, the whole cache map for shared-cache images.
    pub view: &'a [u8],
    /// The byte range of `view` that reads may touch.
    pub available: Range,
    pub ctx: Ctx,
    pub arch_bit: ArchSet,
    pub options: ParseOptions,
}

/// Walks `nsyms` nlist entries, resolving each name from the string blob and
/// folding external defined symbols (and, optionally, external undefined
/// ones) into `info` tagged with this slice's architecture.
pub(crate) fn parse_symbol_table(
    info: &mut CreateInfo,
    scan: &SymbolTableScan<'_>,
    symtab: &SymtabCommand,
) -> Result<(), ParseError> {
    let entry_size = if scan.ctx.is_64() {
        SIZEOF_NLIST_64
    } else {
        SIZEOF_NLIST_32
    };

    let entries_len = u64::from(symtab.nsyms)
        .checked_mul(entry_size as u64)
        .ok_or(ParseError::InvalidSymbolTable)?;
    let entries_range = Range::with_len(u64::from(symtab.symoff), entries_len)
        .ok_or(ParseError::InvalidSymbolTable)?;
    if !scan.available.contains_range(&entries_range) {
        return Err(ParseError::InvalidSymbolTable);
    }

    let strtab_range = Range::with_len(u64::from(symtab.stroff), u64::from(symtab.strsize))
        .ok_or(ParseError::InvalidStringTable)?;
    if !scan.available.contains_range(&strtab_range) {
        return Err(ParseError::InvalidStringTable);
    }
    let strtab = &scan.view[symtab.stroff as usize..][..symtab.strsize as usize];

    let parse_undefineds = scan.options.contains(ParseOptions::PARSE_UNDEFINEDS);

    for index in 0..symtab.nsyms as u64 {
        let at = (u64::from(symtab.symoff) + index * entry_size as u64) as usize;
        let (n_strx, n_type, n_desc) = if scan.ctx.is_64() {
            let nlist: Nlist64 = scan.view.pread_with(at, scan.ctx.le)?;
            (nlist.n_strx, nlist.n_type, nlist.n_desc)
        } else {
            let nlist: Nlist32 = scan.view.pread_with(at, scan.ctx.le)?;
            (nlist.n_strx, nlist.n_type, nlist.n_desc)
        };

        if n_strx >= symtab.strsize {
            return Err(ParseError::InvalidSymbolTable);
        }
        let tail = &strtab[n_strx as usize..];
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::InvalidStringTable)?;
        let name =
            core::str::from_utf8(&tail[..nul]).map_err(|_| ParseError::InvalidStringTable)?;
        if name.is_empty() {
            continue;
        }

        if n_type & N_STAB != 0 || n_type & N_EXT == 0 {
            continue;
        }
        let symbol_type = n_type & N_TYPE;
        if symbol_type == N_UNDF {
            if parse_undefineds {
                if let Some((kind, stored)) = classify(name, 0) {
                    info.add_undefined(kind, stored, scan.arch_bit);
                }
            }
            continue;
        }
        if symbol_type != N_SECT {
            continue;
        }

        if let Some((kind, stored)) = classify(name, n_desc) {
            info.add_symbol(kind, stored, scan.arch_bit);
        }
    }

    Ok(())
}
