//! The architecture registry: a fixed table mapping `(cputype, cpusubtype)`
//! pairs to named architectures, and `ArchSet`, the bitset of table indices
//! every arch-tagged fact in the aggregator is keyed by.

use core::fmt;

pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;
/// Capability bits or-ed into `cpusubtype`; never part of the identity.
pub const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;

pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
pub const CPU_TYPE_POWERPC: u32 = 18;
pub const CPU_TYPE_POWERPC64: u32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

pub const CPU_SUBTYPE_I386_ALL: u32 = 3;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;
pub const CPU_SUBTYPE_ARM_V4T: u32 = 5;
pub const CPU_SUBTYPE_ARM_V6: u32 = 6;
pub const CPU_SUBTYPE_ARM_V5TEJ: u32 = 7;
pub const CPU_SUBTYPE_ARM_XSCALE: u32 = 8;
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
pub const CPU_SUBTYPE_ARM_V7F: u32 = 10;
pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;
pub const CPU_SUBTYPE_ARM_V8: u32 = 13;
pub const CPU_SUBTYPE_ARM_V6M: u32 = 14;
pub const CPU_SUBTYPE_ARM_V7M: u32 = 15;
pub const CPU_SUBTYPE_ARM_V7EM: u32 = 16;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
pub const CPU_SUBTYPE_ARM64_V8: u32 = 1;
pub const CPU_SUBTYPE_ARM64E: u32 = 2;
pub const CPU_SUBTYPE_ARM64_32_V8: u32 = 1;
pub const CPU_SUBTYPE_POWERPC_ALL: u32 = 0;

/// One entry of the architecture table.
#[derive(Debug, PartialEq, Eq)]
pub struct ArchInfo {
    pub name: &'static str,
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Position in [`ARCH_INFOS`]; also this architecture's [`ArchSet`] bit.
    pub index: usize,
}

impl ArchInfo {
    const fn new(name: &'static str, cputype: u32, cpusubtype: u32, index: usize) -> Self {
        ArchInfo { name, cputype, cpusubtype, index }
    }

    pub fn bit(&self) -> ArchSet {
        ArchSet::single(self.index)
    }
}

/// The registry. Read-only, process lifetime; `ArchSet` indexes into it.
#[rustfmt::skip]
pub const ARCH_INFOS: &[ArchInfo] = &[
    ArchInfo::new("i386",     CPU_TYPE_X86,       CPU_SUBTYPE_I386_ALL,    0),
    ArchInfo::new("x86_64",   CPU_TYPE_X86_64,    CPU_SUBTYPE_X86_64_ALL,  1),
    ArchInfo::new("x86_64h",  CPU_TYPE_X86_64,    CPU_SUBTYPE_X86_64_H,    2),
    ArchInfo::new("armv4t",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V4T,     3),
    ArchInfo::new("armv6",    CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V6,      4),
    ArchInfo::new("armv5",    CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V5TEJ,   5),
    ArchInfo::new("xscale",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_XSCALE,  6),
    ArchInfo::new("armv7",    CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7,      7),
    ArchInfo::new("armv7f",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7F,     8),
    ArchInfo::new("armv7s",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7S,     9),
    ArchInfo::new("armv7k",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7K,    10),
    ArchInfo::new("armv8",    CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V8,     11),
    ArchInfo::new("armv6m",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V6M,    12),
    ArchInfo::new("armv7m",   CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7M,    13),
    ArchInfo::new("armv7em",  CPU_TYPE_ARM,       CPU_SUBTYPE_ARM_V7EM,   14),
    ArchInfo::new("arm64",    CPU_TYPE_ARM64,     CPU_SUBTYPE_ARM64_ALL,  15),
    ArchInfo::new("arm64v8",  CPU_TYPE_ARM64,     CPU_SUBTYPE_ARM64_V8,   16),
    ArchInfo::new("arm64e",   CPU_TYPE_ARM64,     CPU_SUBTYPE_ARM64E,     17),
    ArchInfo::new("arm64_32", CPU_TYPE_ARM64_32,  CPU_SUBTYPE_ARM64_32_V8, 18),
    ArchInfo::new("ppc",      CPU_TYPE_POWERPC,   CPU_SUBTYPE_POWERPC_ALL, 19),
    ArchInfo::new("ppc64",    CPU_TYPE_POWERPC64, CPU_SUBTYPE_POWERPC_ALL, 20),
];

// ArchSet is a u64 bitset of table indices.
const _: () = assert!(ARCH_INFOS.len() <= 64);

/// Looks up the architecture for a `(cputype, cpusubtype)` pair, ignoring
/// capability bits in the subtype.
pub fn arch_info_for_cputype(cputype: u32, cpusubtype: u32) -> Option<&'static ArchInfo> {
    let cpusubtype = cpusubtype & !CPU_SUBTYPE_MASK;
    ARCH_INFOS
        .iter()
        .find(|info| info.cputype == cputype && info.cpusubtype == cpusubtype)
}

/// Looks up an architecture by name, as spelled in a dyld_shared_cache magic.
pub fn arch_info_for_name(name: &str) -> Option<&'static ArchInfo> {
    ARCH_INFOS.iter().find(|info| info.name == name)
}

/// A set of architectures, encoded as a bitset of [`ARCH_INFOS`] indices.
///
/// The derived ordering compares the raw bit patterns, which is exactly the
/// tie-break the export comparator wants.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchSet(u64);

impl ArchSet {
    pub const EMPTY: ArchSet = ArchSet(0);

    pub fn single(index: usize) -> ArchSet {
        debug_assert!(index < ARCH_INFOS.len());
        ArchSet(1 << index)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn contains(self, index: usize) -> bool {
        index < 64 && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        debug_assert!(index < ARCH_INFOS.len());
        self.0 |= 1 << index;
    }

    pub fn is_subset_of(self, other: ArchSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// The set indices, ascending.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(index)
        })
    }

    /// The architectures in the set, in table order.
    pub fn infos(self) -> impl Iterator<Item = &'static ArchInfo> {
        self.indices().map(|index| &ARCH_INFOS[index])
    }
}

impl core::ops::BitOr for ArchSet {
    type Output = ArchSet;
    fn bitor(self, rhs: ArchSet) -> ArchSet {
        ArchSet(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ArchSet {
    fn bitor_assign(&mut self, rhs: ArchSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ArchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.infos().map(|info| info.name))
            .finish()
    }
}
