//! Builders that assemble synthetic Mach-O containers byte by byte, so the
//! end-to-end tests control every field the parser sees.

// not every test binary uses every builder
#![allow(dead_code)]

use scroll::{Endian, Pwrite};

use tapioca::mach::arch::{arch_info_for_name, ArchInfo, CPU_ARCH_ABI64};
use tapioca::mach::fat::{FatArch32, FatHeader, FAT_MAGIC, SIZEOF_FAT_ARCH_32, SIZEOF_FAT_HEADER};
use tapioca::mach::header::{Header64, MH_APP_EXTENSION_SAFE, MH_DYLIB, MH_MAGIC_64, MH_TWOLEVEL};
use tapioca::mach::load_commands::{
    BuildVersionCommand, Dylib, DylibCommand, SubClientCommand, SymtabCommand, UuidCommand,
    LC_BUILD_VERSION, LC_ID_DYLIB, LC_REEXPORT_DYLIB, LC_SUB_CLIENT, LC_SYMTAB, LC_UUID,
    SIZEOF_DYLIB_COMMAND, SIZEOF_SUB_CLIENT_COMMAND,
};
use tapioca::mach::symbols::{Nlist64, N_EXT, N_SECT, SIZEOF_NLIST_64};

pub const SIZEOF_HEADER_64: usize = 32;

/// One symbol to place in the fixture's nlist table.
#[derive(Clone)]
pub struct FixtureSymbol {
    pub name: String,
    pub n_type: u8,
    pub n_desc: u16,
}

impl FixtureSymbol {
    pub fn external(name: &str) -> Self {
        FixtureSymbol {
            name: name.to_owned(),
            n_type: N_SECT | N_EXT,
            n_desc: 0,
        }
    }
}

/// A 64-bit dylib assembled field by field.
pub struct DylibFixture {
    pub arch: &'static ArchInfo,
    pub install_name: String,
    pub current_version: u32,
    pub compatibility_version: u32,
    /// `LC_BUILD_VERSION` platform value; 0 drops the command entirely.
    pub platform: u32,
    /// `None` drops the `LC_UUID` command.
    pub uuid: Option<[u8; 16]>,
    pub symbols: Vec<FixtureSymbol>,
    pub reexports: Vec<String>,
    pub clients: Vec<String>,
    pub header_flags: u32,
    /// Added to the symtab's symoff/stroff, for images whose table offsets
    /// are relative to a larger map (shared-cache style).
    pub symtab_bias: u32,
    /// `false` drops `LC_SYMTAB` and the tables.
    pub with_symtab: bool,
}

impl Default for DylibFixture {
    fn default() -> Self {
        DylibFixture {
            arch: arch_info_for_name("arm64").unwrap(),
            install_name: "/usr/lib/libSystem.B.dylib".to_owned(),
            current_version: 0x0001_0000,
            compatibility_version: 0x0001_0000,
            platform: 1, // macosx
            uuid: Some([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0f]),
            symbols: vec![FixtureSymbol::external("_foo")],
            reexports: Vec::new(),
            clients: Vec::new(),
            header_flags: MH_TWOLEVEL | MH_APP_EXTENSION_SAFE,
            symtab_bias: 0,
            with_symtab: true,
        }
    }
}

/// Appends a command that ends in a NUL-terminated string, padding the
/// command size to an 8-byte boundary the way real linkers do.
fn string_command_size(fixed: usize, string: &str) -> u32 {
    let unpadded = fixed + string.len() + 1;
    ((unpadded + 7) & !7) as u32
}

fn push_string(commands: &mut Vec<u8>, start: usize, cmdsize: u32, string: &str) {
    commands.extend_from_slice(string.as_bytes());
    commands.push(0);
    while commands.len() - start < cmdsize as usize {
        commands.push(0);
    }
}

impl DylibFixture {
    pub fn build(&self) -> Vec<u8> {
        assert!(
            self.arch.cputype & CPU_ARCH_ABI64 != 0,
            "fixture only assembles 64-bit images"
        );
        let le = Endian::Little;
        let mut commands: Vec<u8> = Vec::new();
        let mut ncmds = 0u32;

        // LC_ID_DYLIB
        {
            let start = commands.len();
            let cmdsize = string_command_size(SIZEOF_DYLIB_COMMAND, &self.install_name);
            let mut fixed = [0u8; SIZEOF_DYLIB_COMMAND];
            fixed
                .pwrite_with(
                    DylibCommand {
                        cmd: LC_ID_DYLIB,
                        cmdsize,
                        dylib: Dylib {
                            name: SIZEOF_DYLIB_COMMAND as u32,
                            timestamp: 2,
                            current_version: self.current_version,
                            compatibility_version: self.compatibility_version,
                        },
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            push_string(&mut commands, start, cmdsize, &self.install_name);
            ncmds += 1;
        }

        if self.platform != 0 {
            let mut fixed = [0u8; 24];
            fixed
                .pwrite_with(
                    BuildVersionCommand {
                        cmd: LC_BUILD_VERSION,
                        cmdsize: 24,
                        platform: self.platform,
                        minos: 0x000d_0000,
                        sdk: 0x000d_0000,
                        ntools: 0,
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            ncmds += 1;
        }

        if let Some(uuid) = self.uuid {
            let mut fixed = [0u8; 24];
            fixed
                .pwrite_with(
                    UuidCommand {
                        cmd: LC_UUID,
                        cmdsize: 24,
                        uuid,
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            ncmds += 1;
        }

        for client in &self.clients {
            let start = commands.len();
            let cmdsize = string_command_size(SIZEOF_SUB_CLIENT_COMMAND, client);
            let mut fixed = [0u8; SIZEOF_SUB_CLIENT_COMMAND];
            fixed
                .pwrite_with(
                    SubClientCommand {
                        cmd: LC_SUB_CLIENT,
                        cmdsize,
                        client: SIZEOF_SUB_CLIENT_COMMAND as u32,
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            push_string(&mut commands, start, cmdsize, client);
            ncmds += 1;
        }

        for reexport in &self.reexports {
            let start = commands.len();
            let cmdsize = string_command_size(SIZEOF_DYLIB_COMMAND, reexport);
            let mut fixed = [0u8; SIZEOF_DYLIB_COMMAND];
            fixed
                .pwrite_with(
                    DylibCommand {
                        cmd: LC_REEXPORT_DYLIB,
                        cmdsize,
                        dylib: Dylib {
                            name: SIZEOF_DYLIB_COMMAND as u32,
                            timestamp: 2,
                            current_version: 0x0001_0000,
                            compatibility_version: 0x0001_0000,
                        },
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            push_string(&mut commands, start, cmdsize, reexport);
            ncmds += 1;
        }

        // the tables land right after the load commands
        let sizeofcmds = (commands.len() + 24) as u32;
        let symoff = SIZEOF_HEADER_64 as u32 + sizeofcmds;
        let nsyms = self.symbols.len() as u32;
        let stroff = symoff + nsyms * SIZEOF_NLIST_64 as u32;

        let mut strtab: Vec<u8> = vec![0];
        let mut nlists: Vec<u8> = Vec::new();
        for symbol in &self.symbols {
            let n_strx = strtab.len() as u32;
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
            let mut entry = [0u8; SIZEOF_NLIST_64];
            entry
                .pwrite_with(
                    Nlist64 {
                        n_strx,
                        n_type: symbol.n_type,
                        n_sect: 1,
                        n_desc: symbol.n_desc,
                        n_value: 0x1000,
                    },
                    0,
                    le,
                )
                .unwrap();
            nlists.extend_from_slice(&entry);
        }

        let sizeofcmds = if self.with_symtab {
            let mut fixed = [0u8; 24];
            fixed
                .pwrite_with(
                    SymtabCommand {
                        cmd: LC_SYMTAB,
                        cmdsize: 24,
                        symoff: symoff + self.symtab_bias,
                        nsyms,
                        stroff: stroff + self.symtab_bias,
                        strsize: strtab.len() as u32,
                    },
                    0,
                    le,
                )
                .unwrap();
            commands.extend_from_slice(&fixed);
            ncmds += 1;
            sizeofcmds
        } else {
            commands.len() as u32
        };

        let mut out = Vec::new();
        let mut header = [0u8; SIZEOF_HEADER_64];
        header
            .pwrite_with(
                Header64 {
                    magic: MH_MAGIC_64,
                    cputype: self.arch.cputype,
                    cpusubtype: self.arch.cpusubtype,
                    filetype: MH_DYLIB,
                    ncmds,
                    sizeofcmds,
                    flags: self.header_flags,
                    reserved: 0,
                },
                0,
                le,
            )
            .unwrap();
        out.extend_from_slice(&header);
        out.extend_from_slice(&commands);
        if self.with_symtab {
            out.extend_from_slice(&nlists);
            out.extend_from_slice(&strtab);
        }
        out
    }
}

/// Wraps slices into a 32-bit fat container (table stored big-endian, as on
/// disk), placing each slice at a page-aligned offset.
pub fn build_fat(slices: &[(&'static ArchInfo, Vec<u8>)]) -> Vec<u8> {
    let be = Endian::Big;
    let mut out = vec![0u8; SIZEOF_FAT_HEADER + slices.len() * SIZEOF_FAT_ARCH_32];
    out.pwrite_with(
        FatHeader {
            magic: FAT_MAGIC,
            nfat_arch: slices.len() as u32,
        },
        0,
        be,
    )
    .unwrap();

    let mut offset = (out.len() + 0xfff) & !0xfff;
    for (index, (arch, bytes)) in slices.iter().enumerate() {
        out.pwrite_with(
            FatArch32 {
                cputype: arch.cputype,
                cpusubtype: arch.cpusubtype,
                offset: offset as u32,
                size: bytes.len() as u32,
                align: 12,
            },
            SIZEOF_FAT_HEADER + index * SIZEOF_FAT_ARCH_32,
            be,
        )
        .unwrap();
        offset = (offset + bytes.len() + 0xfff) & !0xfff;
    }

    for (index, (_, bytes)) in slices.iter().enumerate() {
        let entry_at = SIZEOF_FAT_HEADER + index * SIZEOF_FAT_ARCH_32;
        let slice_offset: u32 = {
            use scroll::Pread;
            let arch: FatArch32 = out.pread_with(entry_at, be).unwrap();
            arch.offset
        };
        let end = slice_offset as usize + bytes.len();
        if out.len() < end {
            out.resize(end, 0);
        }
        out[slice_offset as usize..end].copy_from_slice(bytes);
    }
    out
}
