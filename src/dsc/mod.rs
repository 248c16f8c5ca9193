//! dyld_shared_cache support: opening a cache, enumerating its images, and
//! parsing a single image through the Mach-O pipeline in map mode.
//!
//! A cache stores its libraries inside mapped regions addressed by virtual
//! address, and an image's symtab offsets are relative to the cache base
//! rather than the image's own header. The image parser therefore walks load
//! commands with `SECT_OFF_ABSOLUTE` and runs the symbol walker over the
//! whole map itself.

use std::fs::File;
use std::io;

use log::debug;
use memmap2::Mmap;
use scroll::{Endian, Pread, Pwrite, SizeWith};
use thiserror::Error;

use crate::mach::arch::{arch_info_for_name, ArchInfo};
use crate::mach::load_commands::SymtabCommand;
use crate::mach::symbols::SymbolTableScan;
use crate::mach::{self, ParseError, SliceArgs};
use crate::range::Range;
use crate::tbd::{CreateInfo, CreateInfoFlags, ParseOptions};

/// Every cache magic begins with this, followed by padding and an
/// architecture name.
pub const DSC_MAGIC_PREFIX: &[u8] = b"dyld_v1";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DscHeader {
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset: u32,
    pub images_count: u32,
    pub dyld_base_address: u64,
}

pub const SIZEOF_DSC_HEADER: usize = 40;

/// One mapped region: where it lands in memory and where it lives on file.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DscMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

pub const SIZEOF_DSC_MAPPING_INFO: usize = 32;

/// One image: its load address and the file offset of its path string.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DscImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

pub const SIZEOF_DSC_IMAGE_INFO: usize = 32;

/// Failures while opening a cache or reading its tables.
#[derive(Debug, Error)]
pub enum DscParseError {
    #[error("failed to read the shared cache")]
    Io(#[from] io::Error),
    #[error("not a dyld_shared_cache file")]
    NotACache,
    #[error("shared cache has an unrecognized architecture")]
    UnsupportedArch,
    #[error("shared cache is too small for its declared tables")]
    SizeTooSmall,
    #[error("shared cache table range is invalid")]
    InvalidRange,
    #[error("image path is invalid")]
    InvalidImagePath,
}

impl From<scroll::Error> for DscParseError {
    fn from(_: scroll::Error) -> Self {
        DscParseError::SizeTooSmall
    }
}

/// Failures while parsing a single cache image. The Mach-O error domain
/// translates into this one; codes that cannot occur for a cache image
/// (everything fat-related) collapse into [`FatNotSupported`]
/// (`DscImageError::FatNotSupported`).
#[derive(Debug, Error)]
pub enum DscImageError {
    #[error("failed to read the image")]
    Io(#[source] io::Error),
    #[error("image address is not covered by any mapping")]
    NoMapping,
    #[error("image is too small")]
    SizeTooSmall,
    #[error("image range is invalid")]
    InvalidRange,
    #[error("image is a fat container, which a cache cannot hold")]
    FatNotSupported,
    #[error("image is not a mach-o")]
    NotAMacho,

    #[error("image has no load commands")]
    NoLoadCommands,
    #[error("image has too many load commands")]
    TooManyLoadCommands,
    #[error("image load-commands area too small")]
    LoadCommandsAreaTooSmall,
    #[error("image has an invalid load command")]
    InvalidLoadCommand,
    #[error("image segment declares too many sections")]
    TooManySections,
    #[error("image has an invalid section")]
    InvalidSection,

    #[error("image has an invalid client string")]
    InvalidClient,
    #[error("image has an invalid install-name")]
    InvalidInstallName,
    #[error("image has an invalid parent-umbrella")]
    InvalidParentUmbrella,
    #[error("image has an invalid platform")]
    InvalidPlatform,
    #[error("image has an invalid re-export")]
    InvalidReexport,
    #[error("image has an invalid symbol table")]
    InvalidSymbolTable,
    #[error("image has an invalid string table")]
    InvalidStringTable,
    #[error("image has an invalid uuid")]
    InvalidUuid,

    #[error("image has no identification command")]
    NoIdentification,
    #[error("image has no platform")]
    NoPlatform,
    #[error("image has no symbol table")]
    NoSymbolTable,
    #[error("image has no uuid")]
    NoUuid,
    #[error("image has no exports")]
    NoExports,
}

impl From<ParseError> for DscImageError {
    fn from(error: ParseError) -> Self {
        use DscImageError as D;
        match error {
            ParseError::Io(source) => D::Io(source),
            ParseError::NotAMacho(_) => D::NotAMacho,
            // the header arch was already validated against the cache
            ParseError::UnsupportedCputype { .. } => D::NotAMacho,
            ParseError::SizeTooSmall => D::SizeTooSmall,
            ParseError::InvalidRange => D::InvalidRange,

            ParseError::NoArchitectures
            | ParseError::TooManyArchitectures
            | ParseError::InvalidArchitecture
            | ParseError::OverlappingArchitectures
            | ParseError::MultipleArchsForCputype
            | ParseError::ConflictingArchInfo
            | ParseError::ConflictingFlags
            | ParseError::ConflictingIdentification
            | ParseError::ConflictingObjcConstraint
            | ParseError::ConflictingParentUmbrella
            | ParseError::ConflictingPlatform
            | ParseError::ConflictingSwiftVersion
            | ParseError::ConflictingUuid => D::FatNotSupported,

            ParseError::NoLoadCommands => D::NoLoadCommands,
            ParseError::TooManyLoadCommands => D::TooManyLoadCommands,
            ParseError::LoadCommandsAreaTooSmall => D::LoadCommandsAreaTooSmall,
            ParseError::InvalidLoadCommand => D::InvalidLoadCommand,
            ParseError::TooManySections => D::TooManySections,
            ParseError::InvalidSection => D::InvalidSection,

            ParseError::InvalidClient => D::InvalidClient,
            ParseError::InvalidInstallName => D::InvalidInstallName,
            ParseError::InvalidParentUmbrella => D::InvalidParentUmbrella,
            ParseError::InvalidPlatform => D::InvalidPlatform,
            ParseError::InvalidReexport => D::InvalidReexport,
            ParseError::InvalidSymbolTable => D::InvalidSymbolTable,
            ParseError::InvalidStringTable => D::InvalidStringTable,
            ParseError::InvalidUuid => D::InvalidUuid,

            ParseError::NoIdentification => D::NoIdentification,
            ParseError::NoPlatform => D::NoPlatform,
            ParseError::NoSymbolTable => D::NoSymbolTable,
            ParseError::NoUuid => D::NoUuid,
            ParseError::NoExports => D::NoExports,
        }
    }
}

/// An opened dyld_shared_cache: the raw map plus its decoded tables.
#[derive(Debug)]
pub struct DyldSharedCache<D: AsRef<[u8]>> {
    data: D,
    arch: &'static ArchInfo,
    mappings: Vec<DscMappingInfo>,
    images: Vec<DscImageInfo>,
}

impl DyldSharedCache<Mmap> {
    /// Maps a cache file and decodes its tables.
    pub fn open(file: &File) -> Result<Self, DscParseError> {
        if file.metadata()?.len() == 0 {
            return Err(DscParseError::SizeTooSmall);
        }
        // Safety: read-only map; the caller owns the file.
        let map = unsafe { Mmap::map(file)? };
        Self::parse(map)
    }
}

impl<D: AsRef<[u8]>> DyldSharedCache<D> {
    /// Decodes the header, mappings, and images tables of an in-memory
    /// cache, keeping `data` as the backing view.
    pub fn parse(data: D) -> Result<Self, DscParseError> {
        let bytes = data.as_ref();
        if bytes.len() < SIZEOF_DSC_HEADER {
            return Err(DscParseError::SizeTooSmall);
        }
        let header: DscHeader = bytes.pread_with(0, Endian::Little)?;
        let arch = arch_for_magic(&header.magic)?;

        let file_range =
            Range::with_len(0, bytes.len() as u64).ok_or(DscParseError::InvalidRange)?;

        let mappings_len = u64::from(header.mapping_count)
            .checked_mul(SIZEOF_DSC_MAPPING_INFO as u64)
            .ok_or(DscParseError::InvalidRange)?;
        let mappings_range = Range::with_len(u64::from(header.mapping_offset), mappings_len)
            .ok_or(DscParseError::InvalidRange)?;
        if !file_range.contains_range(&mappings_range) {
            return Err(DscParseError::SizeTooSmall);
        }

        let images_len = u64::from(header.images_count)
            .checked_mul(SIZEOF_DSC_IMAGE_INFO as u64)
            .ok_or(DscParseError::InvalidRange)?;
        let images_range = Range::with_len(u64::from(header.images_offset), images_len)
            .ok_or(DscParseError::InvalidRange)?;
        if !file_range.contains_range(&images_range) {
            return Err(DscParseError::SizeTooSmall);
        }

        let mut mappings = Vec::with_capacity(header.mapping_count as usize);
        for index in 0..header.mapping_count as usize {
            let at = header.mapping_offset as usize + index * SIZEOF_DSC_MAPPING_INFO;
            mappings.push(bytes.pread_with::<DscMappingInfo>(at, Endian::Little)?);
        }

        let mut images = Vec::with_capacity(header.images_count as usize);
        for index in 0..header.images_count as usize {
            let at = header.images_offset as usize + index * SIZEOF_DSC_IMAGE_INFO;
            images.push(bytes.pread_with::<DscImageInfo>(at, Endian::Little)?);
        }

        debug!(
            "opened {} shared cache: {} mappings, {} images",
            arch.name,
            mappings.len(),
            images.len()
        );
        Ok(DyldSharedCache {
            data,
            arch,
            mappings,
            images,
        })
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// The cache's single architecture, from its magic.
    pub fn arch(&self) -> &'static ArchInfo {
        self.arch
    }

    pub fn mappings(&self) -> &[DscMappingInfo] {
        &self.mappings
    }

    pub fn images(&self) -> &[DscImageInfo] {
        &self.images
    }

    /// The image's install path, from the cache's path table.
    pub fn image_path(&self, image: &DscImageInfo) -> Result<&str, DscParseError> {
        let bytes = self.data.as_ref();
        let tail = bytes
            .get(image.path_file_offset as usize..)
            .ok_or(DscParseError::InvalidImagePath)?;
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(DscParseError::InvalidImagePath)?;
        if nul == 0 {
            return Err(DscParseError::InvalidImagePath);
        }
        core::str::from_utf8(&tail[..nul]).map_err(|_| DscParseError::InvalidImagePath)
    }

    /// Translates a virtual address to a file offset via the first mapping
    /// containing it, along with how many bytes of that mapping remain.
    fn offset_for_address(&self, address: u64) -> Option<(u64, u64)> {
        for mapping in &self.mappings {
            let range = Range::with_len(mapping.address, mapping.size)?;
            if !range.contains_location(address) {
                continue;
            }
            let delta = address - mapping.address;
            return Some((mapping.file_offset.checked_add(delta)?, mapping.size - delta));
        }
        None
    }

    /// Parses one image of the cache into `info`.
    ///
    /// The aggregator ends up tagged with the cache's single architecture
    /// and `EXPORTS_HAVE_FULL_ARCHS`; parse one image per aggregator (see
    /// [`CreateInfo::clear`]).
    pub fn image_parse(
        &self,
        info: &mut CreateInfo,
        image: &DscImageInfo,
        options: ParseOptions,
    ) -> Result<(), DscImageError> {
        let bytes = self.data.as_ref();
        let available =
            Range::with_len(0, bytes.len() as u64).ok_or(DscImageError::InvalidRange)?;

        let (file_offset, max_size) = self
            .offset_for_address(image.address)
            .ok_or(DscImageError::NoMapping)?;

        if max_size < crate::mach::header::SIZEOF_HEADER_32 as u64
            || !available.contains_location(file_offset)
        {
            return Err(DscImageError::SizeTooSmall);
        }
        let magic: u32 = bytes
            .pread_with(file_offset as usize, Endian::Little)
            .map_err(|_| DscImageError::SizeTooSmall)?;
        if crate::mach::fat::is_fat_magic(magic) {
            return Err(DscImageError::FatNotSupported);
        }
        if !crate::mach::header::is_macho_magic(magic) {
            return Err(DscImageError::NotAMacho);
        }

        // symtab offsets are cache-relative, so the walker must not chase
        // them with image-relative addressing
        let image_options =
            options | ParseOptions::SECT_OFF_ABSOLUTE | ParseOptions::DONT_PARSE_SYMBOL_TABLE;

        let symtab = mach::parse_slice(
            info,
            &SliceArgs {
                view: bytes,
                available,
                header_offset: file_offset,
                macho_size: max_size,
                arch: Some(self.arch),
                options: image_options,
            },
        )?;

        if let Some((symtab, ctx)) = symtab {
            if !options.contains(ParseOptions::DONT_PARSE_SYMBOL_TABLE) {
                self.parse_image_symbols(info, &symtab, ctx, options)?;
            }
        }

        if !options.contains(ParseOptions::IGNORE_MISSING_EXPORTS) && !info.has_exports() {
            return Err(DscImageError::NoExports);
        }

        info.sort_exports();
        info.archs = self.arch.bit();
        info.info_flags |= CreateInfoFlags::EXPORTS_HAVE_FULL_ARCHS;
        Ok(())
    }

    /// Runs the symbol walker over the whole map with cache-relative
    /// offsets.
    fn parse_image_symbols(
        &self,
        info: &mut CreateInfo,
        symtab: &SymtabCommand,
        ctx: crate::container::Ctx,
        options: ParseOptions,
    ) -> Result<(), DscImageError> {
        let bytes = self.data.as_ref();
        let available =
            Range::with_len(0, bytes.len() as u64).ok_or(DscImageError::InvalidRange)?;
        crate::mach::symbols::parse_symbol_table(
            info,
            &SymbolTableScan {
                view: bytes,
                available,
                ctx,
                arch_bit: self.arch.bit(),
                options,
            },
            symtab,
        )?;
        Ok(())
    }
}

/// Decodes a cache magic (`dyld_v1` + padding + arch name) into the
/// architecture it names.
fn arch_for_magic(magic: &[u8; 16]) -> Result<&'static ArchInfo, DscParseError> {
    if !magic.starts_with(DSC_MAGIC_PREFIX) {
        return Err(DscParseError::NotACache);
    }
    let tail = &magic[DSC_MAGIC_PREFIX.len()..];
    let name: Vec<u8> = tail
        .iter()
        .copied()
        .filter(|&b| b != b' ' && b != 0)
        .collect();
    let name = core::str::from_utf8(&name).map_err(|_| DscParseError::NotACache)?;
    arch_info_for_name(name).ok_or(DscParseError::UnsupportedArch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn magic_bytes(text: &str) -> [u8; 16] {
        let mut magic = [0u8; 16];
        magic[..text.len()].copy_from_slice(text.as_bytes());
        magic
    }

    #[test]
    fn magic_decodes_arch() {
        let arch = arch_for_magic(&magic_bytes("dyld_v1  x86_64")).unwrap();
        assert_eq!(arch.name, "x86_64");
        let arch = arch_for_magic(&magic_bytes("dyld_v1   arm64")).unwrap();
        assert_eq!(arch.name, "arm64");
        assert!(matches!(
            arch_for_magic(&magic_bytes("dyld_v2   arm64")),
            Err(DscParseError::NotACache)
        ));
        assert!(matches!(
            arch_for_magic(&magic_bytes("dyld_v1    mips")),
            Err(DscParseError::UnsupportedArch)
        ));
    }

    fn cache_with_tables(mappings: &[DscMappingInfo], images: &[DscImageInfo]) -> Vec<u8> {
        use scroll::Pwrite;
        let mapping_offset = SIZEOF_DSC_HEADER;
        let images_offset = mapping_offset + mappings.len() * SIZEOF_DSC_MAPPING_INFO;
        let total = images_offset + images.len() * SIZEOF_DSC_IMAGE_INFO;
        let mut bytes = vec![0u8; total];
        let header = DscHeader {
            magic: magic_bytes("dyld_v1   arm64"),
            mapping_offset: mapping_offset as u32,
            mapping_count: mappings.len() as u32,
            images_offset: images_offset as u32,
            images_count: images.len() as u32,
            dyld_base_address: 0x1_8000_0000,
        };
        bytes.pwrite_with(header, 0, Endian::Little).unwrap();
        for (index, mapping) in mappings.iter().enumerate() {
            bytes
                .pwrite_with(
                    *mapping,
                    mapping_offset + index * SIZEOF_DSC_MAPPING_INFO,
                    Endian::Little,
                )
                .unwrap();
        }
        for (index, image) in images.iter().enumerate() {
            bytes
                .pwrite_with(
                    *image,
                    images_offset + index * SIZEOF_DSC_IMAGE_INFO,
                    Endian::Little,
                )
                .unwrap();
        }
        bytes
    }

    #[test]
    fn tables_roundtrip() {
        let mapping = DscMappingInfo {
            address: 0x1_8000_0000,
            size: 0x4000,
            file_offset: 0,
            max_prot: 5,
            init_prot: 5,
        };
        let image = DscImageInfo {
            address: 0x1_8000_1000,
            path_file_offset: 0x100,
            ..Default::default()
        };
        let bytes = cache_with_tables(&[mapping], &[image]);
        let cache = DyldSharedCache::parse(bytes.as_slice()).unwrap();
        assert_eq!(cache.arch().name, "arm64");
        assert_eq!(cache.mappings().len(), 1);
        assert_eq!(cache.images().len(), 1);
        assert_eq!(cache.images()[0].address, 0x1_8000_1000);
    }

    #[test]
    fn address_resolution() {
        let mapping = DscMappingInfo {
            address: 0x1_8000_0000,
            size: 0x4000,
            file_offset: 0x1000,
            max_prot: 5,
            init_prot: 5,
        };
        let bytes = cache_with_tables(&[mapping], &[]);
        let cache = DyldSharedCache::parse(bytes.as_slice()).unwrap();

        let (offset, max_size) = cache.offset_for_address(0x1_8000_0800).unwrap();
        assert_eq!(offset, 0x1800);
        assert_eq!(max_size, 0x4000 - 0x800);

        // one past the mapping end
        assert!(cache.offset_for_address(0x1_8000_4000).is_none());
    }

    #[test]
    fn image_outside_every_mapping_is_no_mapping() {
        let mapping = DscMappingInfo {
            address: 0x1_8000_0000,
            size: 0x4000,
            file_offset: 0,
            max_prot: 5,
            init_prot: 5,
        };
        let image = DscImageInfo {
            address: 0x2_0000_0000,
            ..Default::default()
        };
        let bytes = cache_with_tables(&[mapping], &[image]);
        let cache = DyldSharedCache::parse(bytes.as_slice()).unwrap();
        let mut info = CreateInfo::default();
        assert!(matches!(
            cache.image_parse(&mut info, &image, ParseOptions::empty()),
            Err(DscImageError::NoMapping)
        ));
    }

    #[test]
    fn truncated_tables_are_rejected() {
        let mapping = DscMappingInfo::default();
        let mut bytes = cache_with_tables(&[mapping], &[]);
        bytes.truncate(SIZEOF_DSC_HEADER + 8);
        assert!(matches!(
            DyldSharedCache::parse(bytes.as_slice()),
            Err(DscParseError::SizeTooSmall)
        ));
    }
}
