//! The Mach-O parsing pipeline: magic dispatch, fat-slice validation,
//! per-slice parsing, and the cross-slice merge into a
//! [`CreateInfo`](crate::tbd::CreateInfo).

use std::fs::File;
use std::io;

use log::debug;
use memmap2::Mmap;
use scroll::{Endian, Pread};
use thiserror::Error;

use crate::container::Ctx;
use crate::range::Range;
use crate::tbd::{CreateInfo, ParseOptions, TbdFlags};

pub mod arch;
pub mod fat;
pub mod header;
pub mod load_commands;
pub mod symbols;

use arch::ArchInfo;
use fat::{FatArch, FatArch32, FatArch64, FatHeader, MAX_NFAT_ARCH, SIZEOF_FAT_HEADER};
use header::{Header, Header32, Header64, MH_APP_EXTENSION_SAFE, MH_TWOLEVEL};
use load_commands::{LoadCommandScan, SymtabCommand};
use symbols::SymbolTableScan;

/// Everything that can go wrong while turning a Mach-O into a `CreateInfo`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read input")]
    Io(#[from] io::Error),
    #[error("not a mach-o file (magic {0:#010x})")]
    NotAMacho(u32),
    #[error("file or slice is too small for its declared contents")]
    SizeTooSmall,
    #[error("provided range is invalid")]
    InvalidRange,

    #[error("unsupported cputype/cpusubtype pair ({cputype:#x}, {cpusubtype:#x})")]
    UnsupportedCputype { cputype: u32, cpusubtype: u32 },
    #[error("fat file has no architectures")]
    NoArchitectures,
    #[error("fat file has too many architectures")]
    TooManyArchitectures,
    #[error("fat architecture has an invalid offset/size")]
    InvalidArchitecture,
    #[error("fat architectures overlap")]
    OverlappingArchitectures,
    #[error("multiple fat architectures share one cputype")]
    MultipleArchsForCputype,

    #[error("no load commands")]
    NoLoadCommands,
    #[error("too many load commands for the declared area")]
    TooManyLoadCommands,
    #[error("load-commands area too small for its commands")]
    LoadCommandsAreaTooSmall,
    #[error("invalid load command")]
    InvalidLoadCommand,
    #[error("segment declares more sections than fit its command")]
    TooManySections,
    #[error("invalid section")]
    InvalidSection,

    #[error("invalid client string")]
    InvalidClient,
    #[error("invalid install-name")]
    InvalidInstallName,
    #[error("invalid parent-umbrella")]
    InvalidParentUmbrella,
    #[error("invalid platform")]
    InvalidPlatform,
    #[error("invalid re-export string")]
    InvalidReexport,
    #[error("invalid symbol table")]
    InvalidSymbolTable,
    #[error("invalid string table")]
    InvalidStringTable,
    #[error("invalid uuid command")]
    InvalidUuid,

    #[error("slices disagree on architecture info")]
    ConflictingArchInfo,
    #[error("slices disagree on header flags")]
    ConflictingFlags,
    #[error("slices disagree on identification")]
    ConflictingIdentification,
    #[error("slices disagree on objc-constraint")]
    ConflictingObjcConstraint,
    #[error("slices disagree on parent-umbrella")]
    ConflictingParentUmbrella,
    #[error("slices disagree on platform")]
    ConflictingPlatform,
    #[error("slices disagree on swift-version")]
    ConflictingSwiftVersion,
    #[error("duplicate or conflicting uuid")]
    ConflictingUuid,

    #[error("no identification (LC_ID_DYLIB) command")]
    NoIdentification,
    #[error("no platform command")]
    NoPlatform,
    #[error("no symbol table")]
    NoSymbolTable,
    #[error("no uuid")]
    NoUuid,
    #[error("library has no exports")]
    NoExports,
}

// Every scroll read happens after an explicit range check, so a residual
// scroll failure means the declared structure ran out of bytes.
impl From<scroll::Error> for ParseError {
    fn from(_: scroll::Error) -> Self {
        ParseError::SizeTooSmall
    }
}

/// Maps the whole file and parses it as a thin or fat Mach-O.
pub fn parse_from_file(
    info: &mut CreateInfo,
    file: &File,
    options: ParseOptions,
) -> Result<(), ParseError> {
    if file.metadata()?.len() == 0 {
        return Err(ParseError::SizeTooSmall);
    }
    // Safety: the map is read-only and dropped before returning; callers own
    // the file and must not truncate it mid-parse.
    let map = unsafe { Mmap::map(file)? };
    parse_from_memory(info, &map, options)
}

/// Like [`parse_from_file`], restricted to the `[begin, end)` byte range.
pub fn parse_from_range(
    info: &mut CreateInfo,
    file: &File,
    begin: u64,
    end: u64,
    options: ParseOptions,
) -> Result<(), ParseError> {
    let range = Range::new(begin, end).ok_or(ParseError::InvalidRange)?;
    if range.is_empty() {
        return Err(ParseError::SizeTooSmall);
    }
    let map = unsafe { Mmap::map(file)? };
    let file_range = Range::with_len(0, map.len() as u64).ok_or(ParseError::InvalidRange)?;
    if !file_range.contains_range(&range) {
        return Err(ParseError::InvalidRange);
    }
    parse_from_memory(info, &map[begin as usize..end as usize], options)
}

/// Parses an in-memory thin or fat Mach-O into `info`.
pub fn parse_from_memory(
    info: &mut CreateInfo,
    data: &[u8],
    options: ParseOptions,
) -> Result<(), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::SizeTooSmall);
    }
    let magic: u32 = data.pread_with(0, Endian::Little)?;
    if fat::is_fat_magic(magic) {
        parse_fat(info, data, options)?;
    } else if header::is_macho_magic(magic) {
        let mut slice = CreateInfo::new(info.version);
        let _ = parse_slice(
            &mut slice,
            &SliceArgs {
                view: data,
                available: Range::with_len(0, data.len() as u64).ok_or(ParseError::InvalidRange)?,
                header_offset: 0,
                macho_size: data.len() as u64,
                arch: None,
                options,
            },
        )?;
        merge_slice(info, slice, options)?;
    } else {
        return Err(ParseError::NotAMacho(magic));
    }

    info.sort_exports();
    if !options.contains(ParseOptions::IGNORE_MISSING_EXPORTS) && !info.has_exports() {
        return Err(ParseError::NoExports);
    }
    Ok(())
}

/// Validates a fat architecture table and parses every slice independently.
fn parse_fat(info: &mut CreateInfo, data: &[u8], options: ParseOptions) -> Result<(), ParseError> {
    let magic: u32 = data.pread_with(0, Endian::Little)?;
    let (endian, is_64) = fat::fat_ctx_for_magic(magic).ok_or(ParseError::NotAMacho(magic))?;
    if data.len() < SIZEOF_FAT_HEADER {
        return Err(ParseError::SizeTooSmall);
    }
    let fat_header: FatHeader = data.pread_with(0, endian)?;
    if fat_header.nfat_arch == 0 {
        return Err(ParseError::NoArchitectures);
    }
    if fat_header.nfat_arch > MAX_NFAT_ARCH {
        return Err(ParseError::TooManyArchitectures);
    }

    let entry_size = if is_64 {
        fat::SIZEOF_FAT_ARCH_64
    } else {
        fat::SIZEOF_FAT_ARCH_32
    };
    let table_len = fat_header.nfat_arch as usize * entry_size;
    if data.len() < SIZEOF_FAT_HEADER + table_len {
        return Err(ParseError::SizeTooSmall);
    }

    let file_range = Range::with_len(0, data.len() as u64).ok_or(ParseError::InvalidRange)?;
    let mut slices: Vec<(&'static ArchInfo, Range)> =
        Vec::with_capacity(fat_header.nfat_arch as usize);

    for index in 0..fat_header.nfat_arch as usize {
        let at = SIZEOF_FAT_HEADER + index * entry_size;
        let entry: FatArch = if is_64 {
            data.pread_with::<FatArch64>(at, endian)?.into()
        } else {
            data.pread_with::<FatArch32>(at, endian)?.into()
        };

        let arch = arch::arch_info_for_cputype(entry.cputype, entry.cpusubtype).ok_or(
            ParseError::UnsupportedCputype {
                cputype: entry.cputype,
                cpusubtype: entry.cpusubtype,
            },
        )?;
        let range = Range::with_len(entry.offset, entry.size)
            .filter(|range| !range.is_empty() && file_range.contains_range(range))
            .ok_or(ParseError::InvalidArchitecture)?;

        for (accepted_arch, accepted_range) in &slices {
            if accepted_range.overlaps(&range) {
                return Err(ParseError::OverlappingArchitectures);
            }
            if accepted_arch.index == arch.index {
                return Err(ParseError::MultipleArchsForCputype);
            }
        }
        slices.push((arch, range));
    }

    for (arch, range) in slices {
        debug!("parsing fat slice {} at {:#x}", arch.name, range.begin());
        let view = &data[range.begin() as usize..range.end() as usize];
        let mut slice = CreateInfo::new(info.version);
        let _ = parse_slice(
            &mut slice,
            &SliceArgs {
                view,
                available: Range::with_len(0, view.len() as u64)
                    .ok_or(ParseError::InvalidRange)?,
                header_offset: 0,
                macho_size: view.len() as u64,
                arch: Some(arch),
                options,
            },
        )?;
        merge_slice(info, slice, options)?;
    }
    Ok(())
}

/// One slice (or shared-cache image) to parse.
pub(crate) struct SliceArgs<'a> {
    /// The addressing base all offsets are relative to.
    pub view: &'a [u8],
    /// The byte range of `view` reads may touch.
    pub available: Range,
    /// Offset of the mach header within `view`.
    pub header_offset: u64,
    /// Bytes available to the image starting at `header_offset`.
    pub macho_size: u64,
    /// The architecture the container promised, if any; the header must
    /// agree with it.
    pub arch: Option<&'static ArchInfo>,
    pub options: ParseOptions,
}

/// Parses one thin image into `info` (scratch state for this slice alone)
/// and returns the symtab command with the slice's context, for callers
/// that walk the symbol table with their own addressing
/// (`DONT_PARSE_SYMBOL_TABLE`).
pub(crate) fn parse_slice(
    info: &mut CreateInfo,
    args: &SliceArgs<'_>,
) -> Result<Option<(SymtabCommand, Ctx)>, ParseError> {
    if args.macho_size < header::SIZEOF_HEADER_32 as u64 {
        return Err(ParseError::SizeTooSmall);
    }
    let header_at = args.header_offset as usize;
    let magic: u32 = args.view.pread_with(header_at, Endian::Little)?;
    let ctx = header::ctx_for_magic(magic).ok_or(ParseError::NotAMacho(magic))?;
    if ctx.is_64() && args.macho_size < header::SIZEOF_HEADER_64 as u64 {
        return Err(ParseError::SizeTooSmall);
    }

    let mach_header: Header = if ctx.is_64() {
        args.view.pread_with::<Header64>(header_at, ctx.le)?.into()
    } else {
        args.view.pread_with::<Header32>(header_at, ctx.le)?.into()
    };

    let arch = arch::arch_info_for_cputype(mach_header.cputype, mach_header.cpusubtype).ok_or(
        ParseError::UnsupportedCputype {
            cputype: mach_header.cputype,
            cpusubtype: mach_header.cpusubtype,
        },
    )?;
    if let Some(expected) = args.arch {
        if expected.index != arch.index {
            return Err(ParseError::ConflictingArchInfo);
        }
    }

    // a two-level image is not flat-namespace; a missing app-extension-safe
    // bit is worth recording
    if mach_header.flags & MH_TWOLEVEL == 0 {
        info.flags |= TbdFlags::FLAT_NAMESPACE;
    }
    if mach_header.flags & MH_APP_EXTENSION_SAFE == 0 {
        info.flags |= TbdFlags::NOT_APP_EXTENSION_SAFE;
    }

    let header_size = Header::size(&ctx) as u64;
    let sizeofcmds = u64::from(mach_header.sizeofcmds);
    if mach_header.ncmds == 0 {
        return Err(ParseError::NoLoadCommands);
    }
    if sizeofcmds
        .checked_add(header_size)
        .is_none_or(|total| total > args.macho_size)
    {
        return Err(ParseError::LoadCommandsAreaTooSmall);
    }
    let cmds_at = args.header_offset + header_size;
    let cmds_range =
        Range::with_len(cmds_at, sizeofcmds).ok_or(ParseError::LoadCommandsAreaTooSmall)?;
    if !args.available.contains_range(&cmds_range) {
        return Err(ParseError::LoadCommandsAreaTooSmall);
    }
    let cmds = &args.view[cmds_at as usize..(cmds_at + sizeofcmds) as usize];

    let symtab = load_commands::parse_load_commands(
        info,
        &LoadCommandScan {
            view: args.view,
            available: args.available,
            header_offset: args.header_offset,
            cmds,
            ncmds: mach_header.ncmds,
            ctx,
            arch,
            options: args.options,
        },
    )?;

    if info.install_name.is_none() {
        return Err(ParseError::NoIdentification);
    }
    if info.platform.is_none() {
        return Err(ParseError::NoPlatform);
    }
    if info.version == crate::tbd::TbdVersion::V2 && info.uuids.is_empty() {
        return Err(ParseError::NoUuid);
    }

    info.archs |= arch.bit();

    if args.options.contains(ParseOptions::DONT_PARSE_SYMBOL_TABLE) {
        return Ok(symtab.map(|symtab| (symtab, ctx)));
    }
    let Some(symtab) = symtab else {
        return Err(ParseError::NoSymbolTable);
    };
    symbols::parse_symbol_table(
        info,
        &SymbolTableScan {
            view: args.view,
            available: args.available,
            ctx,
            arch_bit: arch.bit(),
            options: args.options,
        },
        &symtab,
    )?;

    Ok(Some((symtab, ctx)))
}

/// Folds one slice's scratch aggregate into the cumulative one, enforcing
/// the cross-slice consistency rules.
pub(crate) fn merge_slice(
    info: &mut CreateInfo,
    slice: CreateInfo,
    options: ParseOptions,
) -> Result<(), ParseError> {
    let ignore = options.contains(ParseOptions::IGNORE_CONFLICTING_FIELDS);

    if info.install_name.is_none() {
        info.install_name = slice.install_name;
        info.current_version = slice.current_version;
        info.compatibility_version = slice.compatibility_version;
    } else if slice.install_name.is_some()
        && (info.install_name != slice.install_name
            || info.current_version != slice.current_version
            || info.compatibility_version != slice.compatibility_version)
    {
        keep_first(ignore, ParseError::ConflictingIdentification)?;
    }

    match (info.platform, slice.platform) {
        (None, platform) => info.platform = platform,
        (Some(existing), Some(new)) if existing != new => {
            keep_first(ignore, ParseError::ConflictingPlatform)?;
        }
        _ => {}
    }

    if info.archs.is_empty() {
        info.flags = slice.flags;
    } else if info.flags != slice.flags {
        keep_first(ignore, ParseError::ConflictingFlags)?;
    }

    match (info.objc_constraint, slice.objc_constraint) {
        (None, constraint) => info.objc_constraint = constraint,
        (Some(existing), Some(new)) if existing != new => {
            keep_first(ignore, ParseError::ConflictingObjcConstraint)?;
        }
        _ => {}
    }

    if info.swift_version == 0 {
        info.swift_version = slice.swift_version;
    } else if slice.swift_version != 0 && slice.swift_version != info.swift_version {
        keep_first(ignore, ParseError::ConflictingSwiftVersion)?;
    }

    if info.parent_umbrella.is_none() {
        info.parent_umbrella = slice.parent_umbrella;
    } else if slice.parent_umbrella.is_some() && info.parent_umbrella != slice.parent_umbrella {
        keep_first(ignore, ParseError::ConflictingParentUmbrella)?;
    }

    // both projections of the uuid set stay unique
    for pair in slice.uuids {
        if info
            .uuids
            .iter()
            .any(|existing| existing.uuid == pair.uuid || existing.arch.index == pair.arch.index)
        {
            keep_first(ignore, ParseError::ConflictingUuid)?;
        } else {
            info.uuids.push(pair);
        }
    }

    for symbol in &slice.symbols {
        info.add_symbol(symbol.kind, &symbol.name, symbol.archs);
    }
    for undefined in &slice.undefineds {
        info.add_undefined(undefined.kind, &undefined.name, undefined.archs);
    }
    for reexport in &slice.reexports {
        info.add_reexport(&reexport.name, reexport.archs);
    }
    for client in &slice.clients {
        info.add_client(&client.name, client.archs);
    }

    info.archs |= slice.archs;
    Ok(())
}

fn keep_first(ignore: bool, error: ParseError) -> Result<(), ParseError> {
    if ignore {
        log::warn!("{error}; keeping the first value seen");
        Ok(())
    } else {
        Err(error)
    }
}
