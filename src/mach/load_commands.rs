//! Load commands: the raw structs for the ABI-describing subset, a bounded
//! walker over a validated command area, and the semantic pass that folds
//! recognized commands into a [`CreateInfo`].

use log::warn;
use scroll::{Endian, Pread, Pwrite, SizeWith};

use crate::container::Ctx;
use crate::mach::arch::ArchInfo;
use crate::mach::ParseError;
use crate::range::Range;
use crate::tbd::{CreateInfo, ObjcConstraint, PackedVersion, ParseOptions, Platform, UuidPair};

pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
pub const LC_SUB_CLIENT: u32 = 0x14;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;

pub fn cmd_to_str(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
        LC_SUB_CLIENT => "LC_SUB_CLIENT",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_UUID => "LC_UUID",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
        LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        _ => "LC_UNKNOWN",
    }
}

/// Every load command begins with this pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

/// A dylib identification: path-name offset plus version numbers. The path
/// string follows the fixed part inside the same command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Dylib {
    /// Offset of the path string from the start of the command.
    pub name: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// `LC_ID_DYLIB` / `LC_REEXPORT_DYLIB` (and the other dylib-reference kinds).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dylib: Dylib,
}

pub const SIZEOF_DYLIB_COMMAND: usize = 24;

/// `LC_UUID`: the 128-bit build UUID.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub uuid: [u8; 16],
}

pub const SIZEOF_UUID_COMMAND: usize = 24;

/// `LC_VERSION_MIN_{MACOSX,IPHONEOS,TVOS,WATCHOS}`; the platform is implied
/// by the command kind.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz
    pub version: u32,
    pub sdk: u32,
}

pub const SIZEOF_VERSION_MIN_COMMAND: usize = 16;

/// `LC_BUILD_VERSION`: platform as an explicit field, optionally followed by
/// tool-version entries (which stubs do not care about).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct BuildVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub platform: u32,
    pub minos: u32,
    pub sdk: u32,
    pub ntools: u32,
}

pub const SIZEOF_BUILD_VERSION_COMMAND: usize = 24;

/// `LC_SUB_FRAMEWORK`: the umbrella framework this library belongs to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SubFrameworkCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// Offset of the umbrella name from the start of the command.
    pub umbrella: u32,
}

pub const SIZEOF_SUB_FRAMEWORK_COMMAND: usize = 12;

/// `LC_SUB_CLIENT`: a client allowed to link this sub-framework.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SubClientCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// Offset of the client name from the start of the command.
    pub client: u32,
}

pub const SIZEOF_SUB_CLIENT_COMMAND: usize = 12;

/// `LC_SYMTAB`: where the nlist table and the string blob live.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_32: usize = 56;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section32 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

pub const SIZEOF_SECTION_32: usize = 68;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

// __objc_imageinfo flag bits
const OBJC_IMAGE_SUPPORTS_GC: u32 = 1 << 1;
const OBJC_IMAGE_REQUIRES_GC: u32 = 1 << 2;
const OBJC_IMAGE_IS_SIMULATED: u32 = 1 << 5;
const OBJC_IMAGE_SWIFT_VERSION_MASK: u32 = 0xff00;
const SIZEOF_OBJC_IMAGE_INFO: usize = 8;

/// One bounds-checked command: its header plus all `cmdsize` bytes.
#[derive(Debug)]
pub struct LoadCommandView<'a> {
    /// Offset of the command within the command area.
    pub offset: usize,
    pub header: LoadCommandHeader,
    pub bytes: &'a [u8],
}

/// Iterates exactly `ncmds` commands over a command area, enforcing the
/// size invariants at each step. Yields an error (and then fuses) as soon
/// as the stream is inconsistent, including when the declared `sizeofcmds`
/// is not fully consumed by the declared `ncmds`.
pub struct LoadCommandIter<'a> {
    data: &'a [u8],
    le: Endian,
    offset: usize,
    index: u32,
    ncmds: u32,
    failed: bool,
}

impl<'a> LoadCommandIter<'a> {
    /// `data` must be exactly the `sizeofcmds` bytes of the command area.
    pub fn new(data: &'a [u8], ncmds: u32, le: Endian) -> Result<Self, ParseError> {
        if ncmds == 0 {
            return Err(ParseError::NoLoadCommands);
        }
        // a command header alone is 8 bytes, so the area bounds the count
        if u64::from(ncmds) > data.len() as u64 / SIZEOF_LOAD_COMMAND as u64 {
            return Err(ParseError::TooManyLoadCommands);
        }
        Ok(LoadCommandIter {
            data,
            le,
            offset: 0,
            index: 0,
            ncmds,
            failed: false,
        })
    }

    fn fail(&mut self, error: ParseError) -> Option<Result<LoadCommandView<'a>, ParseError>> {
        self.failed = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for LoadCommandIter<'a> {
    type Item = Result<LoadCommandView<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.index == self.ncmds {
            if self.offset != self.data.len() {
                return self.fail(ParseError::LoadCommandsAreaTooSmall);
            }
            return None;
        }

        let remaining = self.data.len() - self.offset;
        if remaining < SIZEOF_LOAD_COMMAND {
            return self.fail(ParseError::LoadCommandsAreaTooSmall);
        }
        let header: LoadCommandHeader = match self.data.pread_with(self.offset, self.le) {
            Ok(header) => header,
            Err(_) => return self.fail(ParseError::InvalidLoadCommand),
        };
        let cmdsize = header.cmdsize as usize;
        if cmdsize < SIZEOF_LOAD_COMMAND {
            return self.fail(ParseError::InvalidLoadCommand);
        }
        if cmdsize > remaining {
            return self.fail(ParseError::LoadCommandsAreaTooSmall);
        }
        // a command may only consume the rest of the area if it is the last
        if cmdsize == remaining && self.index != self.ncmds - 1 {
            return self.fail(ParseError::InvalidLoadCommand);
        }

        let offset = self.offset;
        let bytes = &self.data[offset..offset + cmdsize];
        self.offset += cmdsize;
        self.index += 1;
        Some(Ok(LoadCommandView {
            offset,
            header,
            bytes,
        }))
    }
}

/// Everything the semantic pass needs to interpret one slice's commands.
pub(crate) struct LoadCommandScan<'a> {
    /// The addressing base: the slice itself, or the whole cache map for
    /// shared-cache images.
    pub view: &'a [u8],
    /// The byte range of `view` that reads may touch.
    pub available: Range,
    /// Offset of the mach header within `view`.
    pub header_offset: u64,
    /// The command area (exactly `sizeofcmds` bytes).
    pub cmds: &'a [u8],
    pub ncmds: u32,
    pub ctx: Ctx,
    pub arch: &'static ArchInfo,
    pub options: ParseOptions,
}

/// Downgrades `error` to a warning when the matching ignore option is set.
fn downgrade(ignore: bool, error: ParseError) -> Result<(), ParseError> {
    if ignore {
        warn!("{error}; keeping the first value seen");
        Ok(())
    } else {
        Err(error)
    }
}

/// Extracts the NUL-terminated string a command embeds at `offset` within
/// its own bytes. Rejects an offset inside the fixed part, a missing
/// terminator, an empty string, embedded NULs (non-NUL bytes after the
/// terminator), and non-UTF-8.
fn command_string(bytes: &[u8], offset: usize, fixed_size: usize) -> Option<&str> {
    if offset < fixed_size {
        return None;
    }
    let tail = bytes.get(offset..)?;
    let nul = tail.iter().position(|&b| b == 0)?;
    if nul == 0 || tail[nul..].iter().any(|&b| b != 0) {
        return None;
    }
    core::str::from_utf8(&tail[..nul]).ok()
}

/// A 16-byte segment/section name, trimmed at its padding.
fn name_bytes(raw: &[u8; 16]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

/// Walks the command area, folding every recognized command into `info`
/// (which holds this slice's scratch state). Returns the symtab command if
/// one was seen; the caller decides whether its absence is fatal.
pub(crate) fn parse_load_commands(
    info: &mut CreateInfo,
    scan: &LoadCommandScan<'_>,
) -> Result<Option<SymtabCommand>, ParseError> {
    let le = scan.ctx.le;
    let ignore_invalid = scan.options.contains(ParseOptions::IGNORE_INVALID_FIELDS);
    let ignore_conflicts = scan
        .options
        .contains(ParseOptions::IGNORE_CONFLICTING_FIELDS);
    let arch_bit = scan.arch.bit();

    let mut symtab: Option<SymtabCommand> = None;

    for command in LoadCommandIter::new(scan.cmds, scan.ncmds, le)? {
        let command = command?;
        match command.header.cmd {
            LC_ID_DYLIB => {
                if command.bytes.len() < SIZEOF_DYLIB_COMMAND {
                    downgrade(ignore_invalid, ParseError::InvalidInstallName)?;
                    continue;
                }
                let dylib: DylibCommand = command.bytes.pread_with(0, le)?;
                let Some(name) =
                    command_string(command.bytes, dylib.dylib.name as usize, SIZEOF_DYLIB_COMMAND)
                else {
                    downgrade(ignore_invalid, ParseError::InvalidInstallName)?;
                    continue;
                };
                let current = PackedVersion::from_raw(dylib.dylib.current_version);
                let compatibility = PackedVersion::from_raw(dylib.dylib.compatibility_version);

                match &info.install_name {
                    Some(existing)
                        if existing != name
                            || info.current_version != current
                            || info.compatibility_version != compatibility =>
                    {
                        downgrade(ignore_conflicts, ParseError::ConflictingIdentification)?;
                    }
                    Some(_) => {}
                    None => {
                        info.install_name = Some(name.to_owned());
                        info.current_version = current;
                        info.compatibility_version = compatibility;
                    }
                }
            }
            LC_UUID => {
                if command.bytes.len() < SIZEOF_UUID_COMMAND {
                    downgrade(ignore_invalid, ParseError::InvalidUuid)?;
                    continue;
                }
                let uuid_command: UuidCommand = command.bytes.pread_with(0, le)?;
                match info.uuids.iter().find(|pair| pair.arch.index == scan.arch.index) {
                    Some(existing) if existing.uuid != uuid_command.uuid => {
                        downgrade(ignore_conflicts, ParseError::ConflictingUuid)?;
                    }
                    Some(_) => {}
                    None => info.uuids.push(UuidPair {
                        arch: scan.arch,
                        uuid: uuid_command.uuid,
                    }),
                }
            }
            LC_BUILD_VERSION => {
                if command.bytes.len() < SIZEOF_BUILD_VERSION_COMMAND {
                    return Err(ParseError::InvalidLoadCommand);
                }
                let build: BuildVersionCommand = command.bytes.pread_with(0, le)?;
                let Some(platform) = Platform::from_build_version(build.platform) else {
                    downgrade(ignore_invalid, ParseError::InvalidPlatform)?;
                    continue;
                };
                set_platform(info, platform, ignore_conflicts)?;
            }
            LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                if command.bytes.len() < SIZEOF_VERSION_MIN_COMMAND {
                    return Err(ParseError::InvalidLoadCommand);
                }
                let platform = match command.header.cmd {
                    LC_VERSION_MIN_MACOSX => Platform::Macosx,
                    LC_VERSION_MIN_IPHONEOS => Platform::Ios,
                    LC_VERSION_MIN_TVOS => Platform::Tvos,
                    _ => Platform::Watchos,
                };
                set_platform(info, platform, ignore_conflicts)?;
            }
            LC_SUB_FRAMEWORK => {
                if command.bytes.len() < SIZEOF_SUB_FRAMEWORK_COMMAND {
                    downgrade(ignore_invalid, ParseError::InvalidParentUmbrella)?;
                    continue;
                }
                let sub: SubFrameworkCommand = command.bytes.pread_with(0, le)?;
                let Some(umbrella) = command_string(
                    command.bytes,
                    sub.umbrella as usize,
                    SIZEOF_SUB_FRAMEWORK_COMMAND,
                ) else {
                    downgrade(ignore_invalid, ParseError::InvalidParentUmbrella)?;
                    continue;
                };
                match &info.parent_umbrella {
                    Some(existing) if existing != umbrella => {
                        downgrade(ignore_conflicts, ParseError::ConflictingParentUmbrella)?;
                    }
                    Some(_) => {}
                    None => info.parent_umbrella = Some(umbrella.to_owned()),
                }
            }
            LC_SUB_CLIENT => {
                if command.bytes.len() < SIZEOF_SUB_CLIENT_COMMAND {
                    downgrade(ignore_invalid, ParseError::InvalidClient)?;
                    continue;
                }
                let sub: SubClientCommand = command.bytes.pread_with(0, le)?;
                let Some(client) = command_string(
                    command.bytes,
                    sub.client as usize,
                    SIZEOF_SUB_CLIENT_COMMAND,
                ) else {
                    downgrade(ignore_invalid, ParseError::InvalidClient)?;
                    continue;
                };
                info.add_client(client, arch_bit);
            }
            LC_REEXPORT_DYLIB => {
                if command.bytes.len() < SIZEOF_DYLIB_COMMAND {
                    downgrade(ignore_invalid, ParseError::InvalidReexport)?;
                    continue;
                }
                let dylib: DylibCommand = command.bytes.pread_with(0, le)?;
                let Some(name) =
                    command_string(command.bytes, dylib.dylib.name as usize, SIZEOF_DYLIB_COMMAND)
                else {
                    downgrade(ignore_invalid, ParseError::InvalidReexport)?;
                    continue;
                };
                info.add_reexport(name, arch_bit);
            }
            LC_SYMTAB => {
                if command.bytes.len() < SIZEOF_SYMTAB_COMMAND || symtab.is_some() {
                    return Err(ParseError::InvalidSymbolTable);
                }
                symtab = Some(command.bytes.pread_with(0, le)?);
            }
            LC_SEGMENT => {
                let segment: SegmentCommand32 = command.bytes.pread_with(0, le)?;
                scan_segment_sections(
                    info,
                    scan,
                    &command,
                    name_bytes(&segment.segname).to_owned(),
                    segment.nsects,
                    false,
                )?;
            }
            LC_SEGMENT_64 => {
                let segment: SegmentCommand64 = command.bytes.pread_with(0, le)?;
                scan_segment_sections(
                    info,
                    scan,
                    &command,
                    name_bytes(&segment.segname).to_owned(),
                    segment.nsects,
                    true,
                )?;
            }
            _ => {}
        }
    }

    Ok(symtab)
}

fn set_platform(
    info: &mut CreateInfo,
    platform: Platform,
    ignore_conflicts: bool,
) -> Result<(), ParseError> {
    match info.platform {
        Some(existing) if existing != platform => {
            downgrade(ignore_conflicts, ParseError::ConflictingPlatform)
        }
        Some(_) => Ok(()),
        None => {
            info.platform = Some(platform);
            Ok(())
        }
    }
}

/// Scans a segment's sections for `__objc_imageinfo`, extracting the
/// Objective-C constraint and swift version.
fn scan_segment_sections(
    info: &mut CreateInfo,
    scan: &LoadCommandScan<'_>,
    command: &LoadCommandView<'_>,
    segname: Vec<u8>,
    nsects: u32,
    is_64: bool,
) -> Result<(), ParseError> {
    match segname.as_slice() {
        b"__DATA" | b"__DATA_CONST" | b"__DATA_DIRTY" | b"__OBJC" => {}
        _ => return Ok(()),
    }

    let (fixed_size, section_size) = if is_64 {
        (SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SECTION_64)
    } else {
        (SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SECTION_32)
    };
    let capacity = (command.bytes.len() - fixed_size) / section_size;
    if nsects as usize > capacity {
        return Err(ParseError::TooManySections);
    }

    let ignore_conflicts = scan
        .options
        .contains(ParseOptions::IGNORE_CONFLICTING_FIELDS);

    for index in 0..nsects as usize {
        let at = fixed_size + index * section_size;
        let (sectname, offset, size) = if is_64 {
            let section: Section64 = command.bytes.pread_with(at, scan.ctx.le)?;
            (section.sectname, section.offset, section.size)
        } else {
            let section: Section32 = command.bytes.pread_with(at, scan.ctx.le)?;
            (section.sectname, section.offset, u64::from(section.size))
        };
        match name_bytes(&sectname) {
            b"__objc_imageinfo" | b"__image_info" => {}
            _ => continue,
        }

        if size < SIZEOF_OBJC_IMAGE_INFO as u64 {
            return Err(ParseError::InvalidSection);
        }
        // shared-cache images carry map-absolute section offsets
        let base = if scan.options.contains(ParseOptions::SECT_OFF_ABSOLUTE) {
            0
        } else {
            scan.header_offset
        };
        let location = base
            .checked_add(u64::from(offset))
            .ok_or(ParseError::InvalidSection)?;
        let image_info_range = Range::with_len(location, SIZEOF_OBJC_IMAGE_INFO as u64)
            .ok_or(ParseError::InvalidSection)?;
        if !scan.available.contains_range(&image_info_range) {
            return Err(ParseError::InvalidSection);
        }

        // struct objc_image_info { uint32_t version; uint32_t flags; }
        let flags: u32 = scan.view.pread_with(location as usize + 4, scan.ctx.le)?;

        let constraint = if flags & OBJC_IMAGE_REQUIRES_GC != 0 {
            ObjcConstraint::Gc
        } else if flags & OBJC_IMAGE_SUPPORTS_GC != 0 {
            ObjcConstraint::RetainReleaseOrGc
        } else if flags & OBJC_IMAGE_IS_SIMULATED != 0 {
            ObjcConstraint::RetainReleaseForSimulator
        } else {
            ObjcConstraint::RetainRelease
        };
        match info.objc_constraint {
            Some(existing) if existing != constraint => {
                downgrade(ignore_conflicts, ParseError::ConflictingObjcConstraint)?;
            }
            _ => info.objc_constraint = Some(constraint),
        }

        let swift_version = (flags & OBJC_IMAGE_SWIFT_VERSION_MASK) >> 8;
        if info.swift_version != 0 && swift_version != info.swift_version {
            downgrade(ignore_conflicts, ParseError::ConflictingSwiftVersion)?;
        } else if info.swift_version == 0 {
            info.swift_version = swift_version;
        }
    }

    Ok(())
}
