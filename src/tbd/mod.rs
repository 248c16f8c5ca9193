//! The aggregation layer: `CreateInfo` collects the ABI-describing facts of
//! every parsed slice (identification, platform, versions, flags, UUIDs,
//! clients, re-exports, symbols), merged and arch-tagged, ready for the
//! writer in [`write`].

use core::cmp::Ordering;
use core::fmt;

use bitflags::bitflags;

use crate::mach::arch::{ArchInfo, ArchSet};

pub mod write;

/// Which revision of the text-based stub format to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TbdVersion {
    V1,
    #[default]
    V2,
}

/// A `major.minor.revision` version packed into 32 bits the way dylib
/// commands store it: `xxxx.yy.zz`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedVersion(u32);

impl PackedVersion {
    pub fn new(major: u16, minor: u8, revision: u8) -> Self {
        PackedVersion(
            (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(revision),
        )
    }

    pub fn from_raw(raw: u32) -> Self {
        PackedVersion(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn revision(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for PackedVersion {
    /// Zero minor and revision components are omitted, except that a zero
    /// minor is printed when a non-zero revision follows it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major())?;
        if self.minor() != 0 {
            write!(f, ".{}", self.minor())?;
        }
        if self.revision() != 0 {
            if self.minor() == 0 {
                write!(f, ".0")?;
            }
            write!(f, ".{}", self.revision())?;
        }
        Ok(())
    }
}

/// The platform a library was built for, from `LC_BUILD_VERSION` or one of
/// the `LC_VERSION_MIN_*` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Platform {
    Macosx = 1,
    Ios = 2,
    Tvos = 3,
    Watchos = 4,
    Bridgeos = 5,
    Iosmac = 6,
    IosSimulator = 7,
    TvosSimulator = 8,
    WatchosSimulator = 9,
    Driverkit = 10,
}

impl Platform {
    /// Maps an `LC_BUILD_VERSION` platform value; anything outside the
    /// enumerated set is invalid.
    pub fn from_build_version(raw: u32) -> Option<Platform> {
        Some(match raw {
            1 => Platform::Macosx,
            2 => Platform::Ios,
            3 => Platform::Tvos,
            4 => Platform::Watchos,
            5 => Platform::Bridgeos,
            6 => Platform::Iosmac,
            7 => Platform::IosSimulator,
            8 => Platform::TvosSimulator,
            9 => Platform::WatchosSimulator,
            10 => Platform::Driverkit,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Macosx => "macosx",
            Platform::Ios => "ios",
            Platform::Tvos => "tvos",
            Platform::Watchos => "watchos",
            Platform::Bridgeos => "bridgeos",
            Platform::Iosmac => "iosmac",
            Platform::IosSimulator => "ios-simulator",
            Platform::TvosSimulator => "tvos-simulator",
            Platform::WatchosSimulator => "watchos-simulator",
            Platform::Driverkit => "driverkit",
        }
    }
}

/// The Objective-C garbage-collection constraint recorded in a library's
/// `__objc_imageinfo` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjcConstraint {
    RetainRelease,
    RetainReleaseForSimulator,
    RetainReleaseOrGc,
    Gc,
}

impl ObjcConstraint {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjcConstraint::RetainRelease => "retain_release",
            ObjcConstraint::RetainReleaseForSimulator => "retain_release_for_simulator",
            ObjcConstraint::RetainReleaseOrGc => "retain_release_or_gc",
            ObjcConstraint::Gc => "gc",
        }
    }
}

bitflags! {
    /// The TBD `flags:` field, derived from the Mach-O header flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TbdFlags: u32 {
        const FLAT_NAMESPACE = 1 << 0;
        const NOT_APP_EXTENSION_SAFE = 1 << 1;
    }
}

bitflags! {
    /// Options accepted by the parse entry points.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParseOptions: u32 {
        /// Skip fields that fail validation instead of erroring.
        const IGNORE_INVALID_FIELDS = 1 << 0;
        /// Keep the first value when a later sighting disagrees.
        const IGNORE_CONFLICTING_FIELDS = 1 << 1;
        /// Accept libraries that export nothing.
        const IGNORE_MISSING_EXPORTS = 1 << 2;
        /// Do not walk the symbol table (and do not require one).
        const DONT_PARSE_SYMBOL_TABLE = 1 << 3;
        /// Section file offsets are relative to the whole map, not the
        /// image's own header (dyld_shared_cache images).
        const SECT_OFF_ABSOLUTE = 1 << 4;
        /// Record external undefined symbols in `undefineds`.
        const PARSE_UNDEFINEDS = 1 << 5;
    }
}

bitflags! {
    /// State bits on the aggregator itself.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CreateInfoFlags: u32 {
        /// Every export belongs to all of `archs`; the writer emits one
        /// group instead of consulting per-symbol sets.
        const EXPORTS_HAVE_FULL_ARCHS = 1 << 0;
        const UNDEFINEDS_HAVE_FULL_ARCHS = 1 << 1;
    }
}

/// How a symbol is listed in the output.
///
/// The discriminant order is the order the per-group lists are emitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolKind {
    Normal,
    ObjcClass,
    ObjcIvar,
    WeakDef,
}

/// An exported (or undefined) symbol and the architectures it appears in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub archs: ArchSet,
}

/// A re-exported library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reexport {
    pub name: String,
    pub archs: ArchSet,
}

/// An allowable client recorded by `LC_SUB_CLIENT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub name: String,
    pub archs: ArchSet,
}

/// One slice's UUID, tagged with its architecture.
#[derive(Debug, Clone)]
pub struct UuidPair {
    pub arch: &'static ArchInfo,
    pub uuid: [u8; 16],
}

/// Compares names byte-wise over the shorter length plus one, so the
/// implicit terminator participates and a prefix orders before its
/// extensions without ever ordering by length.
fn name_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let shorter = a.len().min(b.len());
    match a[..shorter].cmp(&b[..shorter]) {
        // the byte past `shorter` is the terminator of one side
        Ordering::Equal => a.len().cmp(&b.len()),
        order => order,
    }
}

/// The export ordering: arch-count, then the arch bitset, then kind, then
/// name. Entries present on more architectures sort greater, so equal
/// arch-sets cluster for grouping.
pub fn symbol_info_comparator(a: &Symbol, b: &Symbol) -> Ordering {
    a.archs
        .count()
        .cmp(&b.archs.count())
        .then_with(|| a.archs.cmp(&b.archs))
        .then_with(|| a.kind.cmp(&b.kind))
        .then_with(|| name_cmp(&a.name, &b.name))
}

fn reexport_comparator(a: &Reexport, b: &Reexport) -> Ordering {
    a.archs
        .count()
        .cmp(&b.archs.count())
        .then_with(|| a.archs.cmp(&b.archs))
        .then_with(|| name_cmp(&a.name, &b.name))
}

/// The merged ABI of one library, assembled slice by slice.
#[derive(Debug, Default)]
pub struct CreateInfo {
    pub version: TbdVersion,
    pub archs: ArchSet,
    pub platform: Option<Platform>,
    pub flags: TbdFlags,
    pub install_name: Option<String>,
    pub current_version: PackedVersion,
    pub compatibility_version: PackedVersion,
    pub swift_version: u32,
    pub objc_constraint: Option<ObjcConstraint>,
    pub parent_umbrella: Option<String>,
    pub uuids: Vec<UuidPair>,
    pub clients: Vec<Client>,
    pub reexports: Vec<Reexport>,
    pub symbols: Vec<Symbol>,
    pub undefineds: Vec<Symbol>,
    pub info_flags: CreateInfoFlags,
}

impl CreateInfo {
    pub fn new(version: TbdVersion) -> Self {
        CreateInfo {
            version,
            ..Default::default()
        }
    }

    /// `popcount(archs)`.
    pub fn archs_count(&self) -> u32 {
        self.archs.count()
    }

    pub fn has_exports(&self) -> bool {
        !self.symbols.is_empty() || !self.reexports.is_empty()
    }

    /// Resets every field while keeping the vector allocations, so one
    /// aggregator can be reused across many inputs. The configured
    /// [`version`](Self::version) survives.
    pub fn clear(&mut self) {
        self.archs = ArchSet::EMPTY;
        self.platform = None;
        self.flags = TbdFlags::empty();
        self.install_name = None;
        self.current_version = PackedVersion::default();
        self.compatibility_version = PackedVersion::default();
        self.swift_version = 0;
        self.objc_constraint = None;
        self.parent_umbrella = None;
        self.uuids.clear();
        self.clients.clear();
        self.reexports.clear();
        self.symbols.clear();
        self.undefineds.clear();
        self.info_flags = CreateInfoFlags::empty();
    }

    /// Inserts a symbol, or widens the arch-set of an existing `(kind,
    /// name)` entry. The list stays sorted under the `(kind, name)` key so
    /// the lookup is a binary search.
    pub fn add_symbol(&mut self, kind: SymbolKind, name: &str, archs: ArchSet) {
        Self::add_symbol_to(&mut self.symbols, kind, name, archs);
    }

    /// [`add_symbol`](Self::add_symbol), but into the undefineds list.
    pub fn add_undefined(&mut self, kind: SymbolKind, name: &str, archs: ArchSet) {
        Self::add_symbol_to(&mut self.undefineds, kind, name, archs);
    }

    fn add_symbol_to(list: &mut Vec<Symbol>, kind: SymbolKind, name: &str, archs: ArchSet) {
        match list.binary_search_by(|probe| {
            probe
                .kind
                .cmp(&kind)
                .then_with(|| name_cmp(&probe.name, name))
        }) {
            Ok(at) => list[at].archs |= archs,
            Err(at) => list.insert(
                at,
                Symbol {
                    kind,
                    name: name.to_owned(),
                    archs,
                },
            ),
        }
    }

    pub fn add_reexport(&mut self, name: &str, archs: ArchSet) {
        match self
            .reexports
            .binary_search_by(|probe| name_cmp(&probe.name, name))
        {
            Ok(at) => self.reexports[at].archs |= archs,
            Err(at) => self.reexports.insert(
                at,
                Reexport {
                    name: name.to_owned(),
                    archs,
                },
            ),
        }
    }

    pub fn add_client(&mut self, name: &str, archs: ArchSet) {
        match self
            .clients
            .binary_search_by(|probe| name_cmp(&probe.name, name))
        {
            Ok(at) => self.clients[at].archs |= archs,
            Err(at) => self.clients.insert(
                at,
                Client {
                    name: name.to_owned(),
                    archs,
                },
            ),
        }
    }

    /// Re-sorts symbols, undefineds, and re-exports under the full export
    /// ordering so equal arch-sets cluster into groups. Run once after the
    /// last slice merges.
    pub fn sort_exports(&mut self) {
        self.symbols.sort_by(symbol_info_comparator);
        self.undefineds.sort_by(symbol_info_comparator);
        self.reexports.sort_by(reexport_comparator);
        self.clients.sort_by(|a, b| {
            a.archs
                .count()
                .cmp(&b.archs.count())
                .then_with(|| a.archs.cmp(&b.archs))
                .then_with(|| name_cmp(&a.name, &b.name))
        });
    }
}
