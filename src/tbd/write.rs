//! The TBD text serializer: export grouping, column alignment, line
//! wrapping, and the v1/v2 differences, over any [`io::Write`] sink.

use std::io::{self, Write};

use bitflags::bitflags;
use core::fmt;
use thiserror::Error;

use super::{CreateInfo, CreateInfoFlags, SymbolKind, TbdVersion, UuidPair};
use crate::mach::arch::ArchSet;

/// List lines wrap before they reach this column; a single item longer than
/// the limit stays on its own line as the sole exception.
const LINE_LENGTH_MAX: usize = 105;

bitflags! {
    /// Options accepted by the write entry points.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct WriteOptions: u32 {
        const IGNORE_HEADER = 1 << 0;
        const IGNORE_ARCHITECTURES = 1 << 1;
        const IGNORE_UUIDS = 1 << 2;
        const IGNORE_PLATFORM = 1 << 3;
        const IGNORE_FLAGS = 1 << 4;
        const IGNORE_INSTALL_NAME = 1 << 5;
        const IGNORE_CURRENT_VERSION = 1 << 6;
        const IGNORE_COMPATIBILITY_VERSION = 1 << 7;
        const IGNORE_SWIFT_VERSION = 1 << 8;
        const IGNORE_OBJC_CONSTRAINT = 1 << 9;
        const IGNORE_PARENT_UMBRELLA = 1 << 10;
        const IGNORE_EXPORTS = 1 << 11;
        const IGNORE_REEXPORTS = 1 << 12;
        const IGNORE_NORMAL_SYMBOLS = 1 << 13;
        const IGNORE_WEAK_SYMBOLS = 1 << 14;
        const IGNORE_OBJC_CLASS_SYMBOLS = 1 << 15;
        const IGNORE_OBJC_IVAR_SYMBOLS = 1 << 16;
        const IGNORE_ALLOWABLE_CLIENTS = 1 << 17;
        const IGNORE_UNDEFINEDS = 1 << 18;
        const IGNORE_FOOTER = 1 << 19;
        /// For v1 output, drop the fields v1 does not define instead of
        /// writing them anyway.
        const IGNORE_UNNEEDED_FIELDS_FOR_VERSION = 1 << 20;
        /// Fail with [`WriteError::HasNoExports`] when there is nothing to
        /// put under `exports:`.
        const ENFORCE_HAS_EXPORTS = 1 << 21;
        /// Emit uuids in ascending architecture-table order instead of
        /// discovery order.
        const ORDER_BY_ARCHITECTURE_INFO_TABLE = 1 << 22;
    }
}

/// The field a failed write was working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteField {
    Header,
    Architectures,
    Uuids,
    Platform,
    Flags,
    InstallName,
    CurrentVersion,
    CompatibilityVersion,
    SwiftVersion,
    ObjcConstraint,
    ParentUmbrella,
    Exports,
    AllowableClients,
    Reexports,
    NormalSymbols,
    ObjcClassSymbols,
    ObjcIvarSymbols,
    WeakDefSymbols,
    Undefineds,
    Footer,
}

impl fmt::Display for WriteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteField::Header => "header",
            WriteField::Architectures => "architectures",
            WriteField::Uuids => "uuids",
            WriteField::Platform => "platform",
            WriteField::Flags => "flags",
            WriteField::InstallName => "install-name",
            WriteField::CurrentVersion => "current-version",
            WriteField::CompatibilityVersion => "compatibility-version",
            WriteField::SwiftVersion => "swift-version",
            WriteField::ObjcConstraint => "objc-constraint",
            WriteField::ParentUmbrella => "parent-umbrella",
            WriteField::Exports => "exports",
            WriteField::AllowableClients => "allowable-clients",
            WriteField::Reexports => "re-exports",
            WriteField::NormalSymbols => "symbols",
            WriteField::ObjcClassSymbols => "objc-classes",
            WriteField::ObjcIvarSymbols => "objc-ivars",
            WriteField::WeakDefSymbols => "weak-def-symbols",
            WriteField::Undefineds => "undefineds",
            WriteField::Footer => "footer",
        };
        f.write_str(name)
    }
}

/// A write either failed at the sink (tagged with the field being written)
/// or was refused because there is nothing to export.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {0}")]
    Write(WriteField, #[source] io::Error),
    #[error("library has no exports to write")]
    HasNoExports,
}

fn at<T>(result: io::Result<T>, field: WriteField) -> Result<T, WriteError> {
    result.map_err(|source| WriteError::Write(field, source))
}

/// The unit of emission: one `- archs: […]` block. Derived from the
/// aggregator; the default policy collapses everything sharing an arch-set
/// into one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportGroup {
    pub archs: ArchSet,
}

impl CreateInfo {
    /// Derives the export groups: each distinct arch-set occurring in any
    /// re-export or symbol becomes one group, in sorted-export order.
    ///
    /// This is the grouping-policy seam; pass a different list to
    /// [`write_with_export_groups`](Self::write_with_export_groups) to
    /// substitute your own policy.
    pub fn export_groups(&self) -> Vec<ExportGroup> {
        let mut groups: Vec<ExportGroup> = Vec::new();
        let reexport_sets = self.reexports.iter().map(|reexport| reexport.archs);
        let symbol_sets = self.symbols.iter().map(|symbol| symbol.archs);
        for archs in reexport_sets.chain(symbol_sets) {
            if !groups.iter().any(|group| group.archs == archs) {
                groups.push(ExportGroup { archs });
            }
        }
        groups
    }

    /// Serializes the aggregator as a TBD document.
    pub fn write_to<W: Write>(&self, sink: &mut W, options: WriteOptions) -> Result<(), WriteError> {
        self.write_with_export_groups(sink, options, &self.export_groups())
    }

    /// [`write_to`](Self::write_to) with caller-supplied export groups.
    pub fn write_with_export_groups<W: Write>(
        &self,
        sink: &mut W,
        options: WriteOptions,
        groups: &[ExportGroup],
    ) -> Result<(), WriteError> {
        let v2 = self.version == TbdVersion::V2;

        if !options.contains(WriteOptions::IGNORE_HEADER) {
            at(write_header(sink, self.version), WriteField::Header)?;
        }
        if !options.contains(WriteOptions::IGNORE_ARCHITECTURES) {
            at(write_archs(sink, self.archs, false), WriteField::Architectures)?;
        }
        if v2 && !options.contains(WriteOptions::IGNORE_UUIDS) {
            at(write_uuids(sink, &self.uuids, options), WriteField::Uuids)?;
        }
        if !options.contains(WriteOptions::IGNORE_PLATFORM) {
            if let Some(platform) = self.platform {
                at(
                    writeln!(sink, "platform:{:14}{}", "", platform.as_str()),
                    WriteField::Platform,
                )?;
            }
        }
        if v2 && !options.contains(WriteOptions::IGNORE_FLAGS) {
            at(write_flags(sink, self), WriteField::Flags)?;
        }
        if !options.contains(WriteOptions::IGNORE_INSTALL_NAME) {
            if let Some(install_name) = &self.install_name {
                at(
                    writeln!(sink, "install-name:{:10}{}", "", install_name),
                    WriteField::InstallName,
                )?;
            }
        }
        if !options.contains(WriteOptions::IGNORE_CURRENT_VERSION) {
            at(
                writeln!(sink, "current-version:{:7}{}", "", self.current_version),
                WriteField::CurrentVersion,
            )?;
        }
        if !options.contains(WriteOptions::IGNORE_COMPATIBILITY_VERSION) {
            at(
                writeln!(sink, "compatibility-version: {}", self.compatibility_version),
                WriteField::CompatibilityVersion,
            )?;
        }

        // v1 does not define these; they are still written for v1 output
        // unless the caller asks for a strict rendition
        let unneeded = !v2 && options.contains(WriteOptions::IGNORE_UNNEEDED_FIELDS_FOR_VERSION);
        if !unneeded {
            if !options.contains(WriteOptions::IGNORE_SWIFT_VERSION) {
                at(write_swift_version(sink, self.swift_version), WriteField::SwiftVersion)?;
            }
            if !options.contains(WriteOptions::IGNORE_OBJC_CONSTRAINT) {
                if let Some(constraint) = self.objc_constraint {
                    at(
                        writeln!(sink, "objc-constraint:{:7}{}", "", constraint.as_str()),
                        WriteField::ObjcConstraint,
                    )?;
                }
            }
            if !options.contains(WriteOptions::IGNORE_PARENT_UMBRELLA) {
                if let Some(umbrella) = &self.parent_umbrella {
                    at(
                        writeln!(sink, "parent-umbrella:{:7}{}", "", umbrella),
                        WriteField::ParentUmbrella,
                    )?;
                }
            }
        }

        if !options.contains(WriteOptions::IGNORE_EXPORTS) {
            self.write_exports(sink, options, groups)?;
        }
        if v2 && !options.contains(WriteOptions::IGNORE_UNDEFINEDS) {
            self.write_undefineds(sink, options)?;
        }
        if !options.contains(WriteOptions::IGNORE_FOOTER) {
            at(sink.write_all(b"...\n"), WriteField::Footer)?;
        }
        Ok(())
    }

    fn write_exports<W: Write>(
        &self,
        sink: &mut W,
        options: WriteOptions,
        groups: &[ExportGroup],
    ) -> Result<(), WriteError> {
        const CONTENT: WriteOptions = WriteOptions::IGNORE_REEXPORTS
            .union(WriteOptions::IGNORE_NORMAL_SYMBOLS)
            .union(WriteOptions::IGNORE_WEAK_SYMBOLS)
            .union(WriteOptions::IGNORE_OBJC_CLASS_SYMBOLS)
            .union(WriteOptions::IGNORE_OBJC_IVAR_SYMBOLS);
        if options.contains(CONTENT) {
            return Ok(());
        }

        let full_archs = self
            .info_flags
            .contains(CreateInfoFlags::EXPORTS_HAVE_FULL_ARCHS);
        if !self.has_exports() || (!full_archs && groups.is_empty()) {
            if options.contains(WriteOptions::ENFORCE_HAS_EXPORTS) {
                return Err(WriteError::HasNoExports);
            }
            return Ok(());
        }

        at(sink.write_all(b"exports:\n"), WriteField::Exports)?;
        if full_archs {
            // every export belongs to the whole arch set; one group
            self.write_group(sink, options, self.archs, None)?;
        } else {
            for group in groups {
                self.write_group(sink, options, group.archs, Some(group.archs))?;
            }
        }
        Ok(())
    }

    /// Writes one `- archs:` block. `filter` of `None` takes every entry
    /// (the full-archs emission mode); otherwise only entries whose set
    /// matches exactly.
    fn write_group<W: Write>(
        &self,
        sink: &mut W,
        options: WriteOptions,
        heading: ArchSet,
        filter: Option<ArchSet>,
    ) -> Result<(), WriteError> {
        let selected = |archs: ArchSet| filter.is_none_or(|wanted| archs == wanted);

        let clients: Vec<&str> = if options.contains(WriteOptions::IGNORE_ALLOWABLE_CLIENTS) {
            Vec::new()
        } else {
            self.clients
                .iter()
                .filter(|client| selected(client.archs))
                .map(|client| client.name.as_str())
                .collect()
        };
        let reexports: Vec<&str> = if options.contains(WriteOptions::IGNORE_REEXPORTS) {
            Vec::new()
        } else {
            self.reexports
                .iter()
                .filter(|reexport| selected(reexport.archs))
                .map(|reexport| reexport.name.as_str())
                .collect()
        };
        let of_kind = |kind: SymbolKind, ignored: WriteOptions| -> Vec<&str> {
            if options.contains(ignored) {
                return Vec::new();
            }
            self.symbols
                .iter()
                .filter(|symbol| symbol.kind == kind && selected(symbol.archs))
                .map(|symbol| symbol.name.as_str())
                .collect()
        };
        let normal = of_kind(SymbolKind::Normal, WriteOptions::IGNORE_NORMAL_SYMBOLS);
        let objc_classes = of_kind(SymbolKind::ObjcClass, WriteOptions::IGNORE_OBJC_CLASS_SYMBOLS);
        let objc_ivars = of_kind(SymbolKind::ObjcIvar, WriteOptions::IGNORE_OBJC_IVAR_SYMBOLS);
        let weak = of_kind(SymbolKind::WeakDef, WriteOptions::IGNORE_WEAK_SYMBOLS);

        // the archs heading cannot stand alone
        if clients.is_empty()
            && reexports.is_empty()
            && normal.is_empty()
            && objc_classes.is_empty()
            && objc_ivars.is_empty()
            && weak.is_empty()
        {
            return Ok(());
        }

        at(write_archs(sink, heading, true), WriteField::Architectures)?;
        if !clients.is_empty() {
            at(
                write_list(sink, "    allowable-clients:", 2, &clients),
                WriteField::AllowableClients,
            )?;
        }
        if !reexports.is_empty() {
            at(
                write_list(sink, "    re-exports:", 9, &reexports),
                WriteField::Reexports,
            )?;
        }
        if !normal.is_empty() {
            at(
                write_list(sink, "    symbols:", 12, &normal),
                WriteField::NormalSymbols,
            )?;
        }
        if !objc_classes.is_empty() {
            at(
                write_list(sink, "    objc-classes:", 7, &objc_classes),
                WriteField::ObjcClassSymbols,
            )?;
        }
        if !objc_ivars.is_empty() {
            at(
                write_list(sink, "    objc-ivars:", 9, &objc_ivars),
                WriteField::ObjcIvarSymbols,
            )?;
        }
        if !weak.is_empty() {
            at(
                write_list(sink, "    weak-def-symbols:", 3, &weak),
                WriteField::WeakDefSymbols,
            )?;
        }
        Ok(())
    }

    fn write_undefineds<W: Write>(
        &self,
        sink: &mut W,
        options: WriteOptions,
    ) -> Result<(), WriteError> {
        if self.undefineds.is_empty() {
            return Ok(());
        }
        at(sink.write_all(b"undefineds:\n"), WriteField::Undefineds)?;

        let groups: Vec<ArchSet> = if self
            .info_flags
            .contains(CreateInfoFlags::UNDEFINEDS_HAVE_FULL_ARCHS)
        {
            vec![self.archs]
        } else {
            let mut sets = Vec::new();
            for symbol in &self.undefineds {
                if !sets.contains(&symbol.archs) {
                    sets.push(symbol.archs);
                }
            }
            sets
        };
        let full = self
            .info_flags
            .contains(CreateInfoFlags::UNDEFINEDS_HAVE_FULL_ARCHS);

        for archs in groups {
            at(write_archs(sink, archs, true), WriteField::Architectures)?;
            let of_kind = |kind: SymbolKind| -> Vec<&str> {
                self.undefineds
                    .iter()
                    .filter(|symbol| symbol.kind == kind && (full || symbol.archs == archs))
                    .map(|symbol| symbol.name.as_str())
                    .collect()
            };
            for (kind, key, pad) in [
                (SymbolKind::Normal, "    symbols:", 12),
                (SymbolKind::ObjcClass, "    objc-classes:", 7),
                (SymbolKind::ObjcIvar, "    objc-ivars:", 9),
                (SymbolKind::WeakDef, "    weak-def-symbols:", 3),
            ] {
                let names = of_kind(kind);
                if !names.is_empty() {
                    at(write_list(sink, key, pad, &names), WriteField::Undefineds)?;
                }
            }
        }
        Ok(())
    }
}

fn write_header<W: Write>(sink: &mut W, version: TbdVersion) -> io::Result<()> {
    sink.write_all(b"---")?;
    if version == TbdVersion::V2 {
        sink.write_all(b" !tapi-tbd-v2")?;
    }
    sink.write_all(b"\n")
}

/// Writes an `archs:` flow list, either at the top level or as a group
/// heading. An empty set has nothing to write and is a failure.
fn write_archs<W: Write>(sink: &mut W, archs: ArchSet, dash: bool) -> io::Result<()> {
    let mut infos = archs.infos();
    let first = infos
        .next()
        .ok_or_else(|| io::Error::other("no architectures to write"))?;
    if dash {
        write!(sink, "  - archs:{:14}[ {}", "", first.name)?;
    } else {
        write!(sink, "archs:{:17}[ {}", "", first.name)?;
    }
    for info in infos {
        write!(sink, ", {}", info.name)?;
    }
    sink.write_all(b" ]\n")
}

fn write_flags<W: Write>(sink: &mut W, info: &CreateInfo) -> io::Result<()> {
    use super::TbdFlags;
    if info.flags.is_empty() {
        return Ok(());
    }
    write!(sink, "flags:{:17}[ ", "")?;
    let mut first = true;
    for (flag, name) in [
        (TbdFlags::FLAT_NAMESPACE, "flat_namespace"),
        (TbdFlags::NOT_APP_EXTENSION_SAFE, "not_app_extension_safe"),
    ] {
        if info.flags.contains(flag) {
            if !first {
                sink.write_all(b", ")?;
            }
            sink.write_all(name.as_bytes())?;
            first = false;
        }
    }
    sink.write_all(b" ]\n")
}

fn write_swift_version<W: Write>(sink: &mut W, version: u32) -> io::Result<()> {
    if version == 0 {
        return Ok(());
    }
    write!(sink, "swift-version:{:9}", "")?;
    // the stored value is the ABI encoding: 1 => 1, 2 => 1.2, else n - 1
    match version {
        1 => sink.write_all(b"1\n"),
        2 => sink.write_all(b"1.2\n"),
        _ => writeln!(sink, "{}", version - 1),
    }
}

fn uuid_string(uuid: &[u8; 16]) -> String {
    use core::fmt::Write as _;
    let mut out = String::with_capacity(36);
    for (index, byte) in uuid.iter().enumerate() {
        if matches!(index, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

fn write_uuids<W: Write>(
    sink: &mut W,
    uuids: &[UuidPair],
    options: WriteOptions,
) -> io::Result<()> {
    if uuids.is_empty() {
        return Ok(());
    }
    write!(sink, "uuids:{:17}[ ", "")?;

    let mut ordered: Vec<&UuidPair> = uuids.iter().collect();
    if options.contains(WriteOptions::ORDER_BY_ARCHITECTURE_INFO_TABLE) {
        ordered.sort_by_key(|pair| pair.arch.index);
    }

    for (index, pair) in ordered.iter().enumerate() {
        write!(sink, "'{}: {}'", pair.arch.name, uuid_string(&pair.uuid))?;
        if index + 1 != ordered.len() {
            sink.write_all(b", ")?;
            // two entries per line
            if (index + 1) % 2 == 0 {
                write!(sink, "\n{:25}", "")?;
            }
        }
    }
    sink.write_all(b" ]\n")
}

/// Writes one flow list, wrapping per the line-length rule and quoting
/// `$ld`-prefixed entries.
fn write_list<W: Write>(sink: &mut W, key: &str, pad: usize, items: &[&str]) -> io::Result<()> {
    write!(sink, "{key}{:pad$}[ ", "")?;
    let mut line_length = 0usize;
    for item in items {
        // the item plus its ", " separator
        let total = item.len() + 2;
        if line_length != 0 {
            if line_length + total >= LINE_LENGTH_MAX {
                write!(sink, ",\n{:26}", "")?;
                line_length = total;
            } else {
                sink.write_all(b", ")?;
                line_length += total;
            }
        } else {
            line_length = total;
        }
        if item.as_bytes().starts_with(b"$ld") {
            write!(sink, "'{item}'")?;
        } else {
            sink.write_all(item.as_bytes())?;
        }
    }
    sink.write_all(b" ]\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::arch::arch_info_for_name;
    use crate::tbd::{PackedVersion, Platform, TbdFlags};

    fn arch(name: &str) -> ArchSet {
        arch_info_for_name(name).unwrap().bit()
    }

    fn sample_info() -> CreateInfo {
        let mut info = CreateInfo::new(TbdVersion::V2);
        info.archs = arch("arm64");
        info.platform = Some(Platform::Macosx);
        info.install_name = Some("/usr/lib/libSystem.B.dylib".into());
        info.current_version = PackedVersion::new(1, 0, 0);
        info.compatibility_version = PackedVersion::new(1, 0, 0);
        info.uuids.push(UuidPair {
            arch: arch_info_for_name("arm64").unwrap(),
            uuid: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0f],
        });
        info.add_symbol(SymbolKind::Normal, "_foo", arch("arm64"));
        info.sort_exports();
        info
    }

    fn render(info: &CreateInfo, options: WriteOptions) -> String {
        let mut out = Vec::new();
        info.write_to(&mut out, options).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn full_v2_document() {
        let text = render(&sample_info(), WriteOptions::empty());
        let expected = "--- !tapi-tbd-v2\n\
                        archs:                 [ arm64 ]\n\
                        uuids:                 [ 'arm64: 00000000-0000-0000-0000-00000000000F' ]\n\
                        platform:              macosx\n\
                        install-name:          /usr/lib/libSystem.B.dylib\n\
                        current-version:       1\n\
                        compatibility-version: 1\n\
                        exports:\n\
                        \x20 - archs:              [ arm64 ]\n\
                        \x20   symbols:            [ _foo ]\n\
                        ...\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn v1_has_no_tag_uuids_or_flags() {
        let mut info = sample_info();
        info.version = TbdVersion::V1;
        info.flags = TbdFlags::FLAT_NAMESPACE;
        let text = render(&info, WriteOptions::empty());
        assert!(text.starts_with("---\n"));
        assert!(!text.contains("uuids:"));
        assert!(!text.contains("flags:"));
    }

    #[test]
    fn flags_line() {
        let mut info = sample_info();
        info.flags = TbdFlags::FLAT_NAMESPACE | TbdFlags::NOT_APP_EXTENSION_SAFE;
        let text = render(&info, WriteOptions::empty());
        assert!(text.contains("flags:                 [ flat_namespace, not_app_extension_safe ]\n"));
    }

    #[test]
    fn swift_version_encoding() {
        for (stored, written) in [(1u32, "1"), (2, "1.2"), (3, "2"), (6, "5")] {
            let mut info = sample_info();
            info.swift_version = stored;
            let text = render(&info, WriteOptions::empty());
            assert!(
                text.contains(&format!("swift-version:         {written}\n")),
                "{stored} => {text}"
            );
        }
    }

    #[test]
    fn ld_symbols_are_quoted() {
        let mut info = sample_info();
        info.add_symbol(SymbolKind::Normal, "$ld$hide$os10.5$_foo", arch("arm64"));
        info.sort_exports();
        let text = render(&info, WriteOptions::empty());
        assert!(text.contains("'$ld$hide$os10.5$_foo'"));
    }

    #[test]
    fn long_lists_wrap_at_the_limit() {
        let mut info = sample_info();
        for index in 0..40 {
            info.add_symbol(
                SymbolKind::Normal,
                &format!("_symbol_with_some_length_{index:02}"),
                arch("arm64"),
            );
        }
        info.sort_exports();
        let text = render(&info, WriteOptions::empty());
        for line in text.lines() {
            assert!(
                line.len() < LINE_LENGTH_MAX + 26,
                "overlong line: {line:?}"
            );
        }
        // continuation lines align under the opening bracket
        assert!(text.contains(",\n                          _symbol"));
    }

    #[test]
    fn single_overlong_item_is_its_own_line() {
        let mut info = sample_info();
        let giant = format!("_{}", "x".repeat(140));
        info.add_symbol(SymbolKind::Normal, &giant, arch("arm64"));
        info.sort_exports();
        let text = render(&info, WriteOptions::empty());
        assert!(text.contains(&giant));
    }

    #[test]
    fn uuids_break_every_two_entries() {
        let mut info = sample_info();
        info.archs |= arch("x86_64") | arch("i386");
        info.uuids.push(UuidPair {
            arch: arch_info_for_name("x86_64").unwrap(),
            uuid: [1; 16],
        });
        info.uuids.push(UuidPair {
            arch: arch_info_for_name("i386").unwrap(),
            uuid: [2; 16],
        });
        let text = render(&info, WriteOptions::empty());
        let uuid_lines: Vec<&str> = text
            .lines()
            .skip_while(|line| !line.starts_with("uuids:"))
            .take_while(|line| line.starts_with("uuids:") || line.starts_with(' '))
            .collect();
        assert_eq!(uuid_lines.len(), 2, "{text}");
        assert!(uuid_lines[1].starts_with(&" ".repeat(25)));
    }

    #[test]
    fn uuid_table_ordering() {
        let mut info = sample_info();
        // discovery order: arm64 first, then i386
        info.uuids.push(UuidPair {
            arch: arch_info_for_name("i386").unwrap(),
            uuid: [1; 16],
        });
        let ordered = render(&info, WriteOptions::ORDER_BY_ARCHITECTURE_INFO_TABLE);
        let i386_at = ordered.find("'i386:").unwrap();
        let arm64_at = ordered.find("'arm64:").unwrap();
        // i386 has the lower table index
        assert!(i386_at < arm64_at);

        let discovery = render(&info, WriteOptions::empty());
        let i386_at = discovery.find("'i386:").unwrap();
        let arm64_at = discovery.find("'arm64:").unwrap();
        assert!(arm64_at < i386_at);
    }

    #[test]
    fn groups_follow_arch_sets() {
        let mut info = sample_info();
        info.archs |= arch("x86_64");
        let both = arch("arm64") | arch("x86_64");
        info.add_symbol(SymbolKind::Normal, "_both", both);
        info.add_reexport("/usr/lib/libother.dylib", arch("x86_64"));
        info.sort_exports();
        let text = render(&info, WriteOptions::empty());

        // three groups: arm64-only, x86_64-only, and the pair
        assert!(text.contains("  - archs:              [ arm64 ]"));
        assert!(text.contains("  - archs:              [ x86_64 ]"));
        assert!(text.contains("  - archs:              [ x86_64, arm64 ]"));
        assert!(text.contains("    re-exports:         [ /usr/lib/libother.dylib ]"));
    }

    #[test]
    fn enforce_has_exports() {
        let mut info = sample_info();
        info.symbols.clear();
        assert!(matches!(
            info.write_to(&mut Vec::new(), WriteOptions::ENFORCE_HAS_EXPORTS),
            Err(WriteError::HasNoExports)
        ));
        // without enforcement the section is simply absent
        let text = render(&info, WriteOptions::empty());
        assert!(!text.contains("exports:"));
    }

    #[test]
    fn full_archs_emission_collapses_groups() {
        let mut info = sample_info();
        info.archs = arch("arm64");
        info.info_flags |= CreateInfoFlags::EXPORTS_HAVE_FULL_ARCHS;
        // symbol tagged with a stale arch-set still lands in the one group
        info.add_symbol(SymbolKind::Normal, "_stale", arch("x86_64"));
        info.sort_exports();
        let text = render(&info, WriteOptions::empty());
        assert_eq!(text.matches("  - archs:").count(), 1);
        assert!(text.contains("_stale"));
    }

    #[test]
    fn undefineds_section() {
        let mut info = sample_info();
        info.add_undefined(SymbolKind::Normal, "_missing", arch("arm64"));
        let text = render(&info, WriteOptions::empty());
        assert!(text.contains("undefineds:\n"));
        assert!(text.contains("    symbols:            [ _missing ]"));

        let suppressed = render(&info, WriteOptions::IGNORE_UNDEFINEDS);
        assert!(!suppressed.contains("undefineds:"));
    }

    #[test]
    fn write_failures_name_the_field() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let info = sample_info();
        match info.write_to(&mut FailingSink, WriteOptions::empty()) {
            Err(WriteError::Write(WriteField::Header, _)) => {}
            other => panic!("expected a header write failure, got {other:?}"),
        }
    }
}
