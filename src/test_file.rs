//! Builders that synthesize Mach-O images in memory for tests: relocatable
//! objects with sections, symbols and relocations; dylibs with export tries
//! and reexport commands; archives in the BSD flavor Apple tooling produces.

use crate::bail;
use crate::dylib::StubParser;
use crate::dylib::TextStub;
use crate::error::Result;
use crate::macho::DyldInfoCommand;
use crate::macho::DylibCommand;
use crate::macho::LinkerOptionCommand;
use crate::macho::MachHeader;
use crate::macho::MachSym;
use crate::macho::SectionHeader;
use crate::macho::SegmentCommand;
use crate::macho::SymtabCommand;
use object::BigEndian;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64;
use object::U64Bytes;
use object::macho::RelocationInfo;
use object::pod::bytes_of;

fn fixed16(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

pub(crate) fn section_header(
    seg: &[u8],
    sect: &[u8],
    addr: u64,
    size: u64,
    p2align: u8,
) -> SectionHeader {
    let e = LittleEndian;
    SectionHeader {
        sectname: fixed16(sect),
        segname: fixed16(seg),
        addr: U64::new(e, addr),
        size: U64::new(e, size),
        offset: U32::new(e, 0),
        align: U32::new(e, u32::from(p2align)),
        reloff: U32::new(e, 0),
        nreloc: U32::new(e, 0),
        flags: U32::new(e, 0),
        reserved1: U32::new(e, 0),
        reserved2: U32::new(e, 0),
        reserved3: U32::new(e, 0),
    }
}

pub(crate) fn nlist(n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> MachSym {
    let e = LittleEndian;
    MachSym {
        n_strx: U32::new(e, 0),
        n_type,
        n_sect,
        n_desc: U16::new(e, n_desc),
        n_value: U64Bytes::new(e, n_value),
    }
}

struct SectionSpec {
    segname: Vec<u8>,
    sectname: Vec<u8>,
    addr: u64,
    p2align: u8,
    flags: u32,
    data: Vec<u8>,
    relocs: Vec<RelocationInfo>,
}

struct SymSpec {
    name: Vec<u8>,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

pub(crate) struct ObjBuilder {
    flags: u32,
    sections: Vec<SectionSpec>,
    syms: Vec<SymSpec>,
    linker_options: Vec<Vec<u8>>,
}

pub(crate) fn obj() -> ObjBuilder {
    ObjBuilder {
        flags: object::macho::MH_SUBSECTIONS_VIA_SYMBOLS,
        sections: Vec::new(),
        syms: Vec::new(),
        linker_options: Vec::new(),
    }
}

impl ObjBuilder {
    pub(crate) fn without_subsections_via_symbols(mut self) -> Self {
        self.flags = 0;
        self
    }

    pub(crate) fn section(self, seg: &[u8], sect: &[u8], addr: u64, data: &[u8]) -> Self {
        self.section_full(seg, sect, addr, data, 0, Vec::new())
    }

    pub(crate) fn section_full(
        mut self,
        seg: &[u8],
        sect: &[u8],
        addr: u64,
        data: &[u8],
        p2align: u8,
        relocs: Vec<RelocationInfo>,
    ) -> Self {
        self.sections.push(SectionSpec {
            segname: seg.to_vec(),
            sectname: sect.to_vec(),
            addr,
            p2align,
            flags: 0,
            data: data.to_vec(),
            relocs,
        });
        self
    }

    pub(crate) fn debug_section(mut self, seg: &[u8], sect: &[u8], addr: u64, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            segname: seg.to_vec(),
            sectname: sect.to_vec(),
            addr,
            p2align: 0,
            flags: object::macho::S_ATTR_DEBUG,
            data: data.to_vec(),
            relocs: Vec::new(),
        });
        self
    }

    pub(crate) fn sym(mut self, name: &[u8], n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> Self {
        self.syms.push(SymSpec {
            name: name.to_vec(),
            n_type,
            n_sect,
            n_desc,
            n_value,
        });
        self
    }

    /// An extern symbol defined in section `n_sect` (1-based) at `value`.
    pub(crate) fn global(self, name: &[u8], n_sect: u8, value: u64) -> Self {
        self.sym(name, object::macho::N_SECT | object::macho::N_EXT, n_sect, 0, value)
    }

    pub(crate) fn undefined(self, name: &[u8]) -> Self {
        self.sym(name, object::macho::N_UNDF | object::macho::N_EXT, 0, 0, 0)
    }

    /// A tentative definition: undefined type with a nonzero value carrying
    /// the size, alignment in the upper desc bits.
    pub(crate) fn common(self, name: &[u8], size: u64, p2align: u16) -> Self {
        self.sym(
            name,
            object::macho::N_UNDF | object::macho::N_EXT,
            0,
            p2align << 8,
            size,
        )
    }

    pub(crate) fn linker_option(mut self, options: &[&str]) -> Self {
        let mut payload = Vec::new();
        for option in options {
            payload.extend_from_slice(option.as_bytes());
            payload.push(0);
        }
        self.linker_options.push(payload);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let e = LittleEndian;
        let nsects = self.sections.len();
        let seg_cmd_size = size_of::<SegmentCommand>() + nsects * size_of::<SectionHeader>();
        let symtab_cmd_size = size_of::<SymtabCommand>();

        let option_cmds: Vec<Vec<u8>> = self
            .linker_options
            .iter()
            .map(|payload| {
                let count = payload.iter().filter(|&&b| b == 0).count() as u32;
                let cmdsize =
                    (size_of::<LinkerOptionCommand>() + payload.len()).next_multiple_of(8);
                let mut cmd = bytes_of(&LinkerOptionCommand {
                    cmd: U32::new(e, object::macho::LC_LINKER_OPTION),
                    cmdsize: U32::new(e, cmdsize as u32),
                    count: U32::new(e, count),
                })
                .to_vec();
                cmd.extend_from_slice(payload);
                cmd.resize(cmdsize, 0);
                cmd
            })
            .collect();

        let sizeofcmds =
            seg_cmd_size + symtab_cmd_size + option_cmds.iter().map(Vec::len).sum::<usize>();
        let ncmds = 2 + option_cmds.len() as u32;
        let header_end = size_of::<MachHeader>() + sizeofcmds;

        // Lay out the data area: section contents, relocation tables, symbol
        // table, string table. Keep everything 8-aligned so typed views work
        // at any mmap base.
        let mut cursor = header_end.next_multiple_of(8);
        let mut section_offsets = Vec::with_capacity(nsects);
        for spec in &self.sections {
            section_offsets.push(cursor);
            cursor = (cursor + spec.data.len()).next_multiple_of(8);
        }
        let mut reloc_offsets = Vec::with_capacity(nsects);
        for spec in &self.sections {
            reloc_offsets.push(cursor);
            cursor = (cursor + spec.relocs.len() * 8).next_multiple_of(8);
        }
        let symoff = cursor;
        cursor += self.syms.len() * size_of::<MachSym>();

        let stroff = cursor;
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.syms.len());
        for sym in &self.syms {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(&sym.name);
            strtab.push(0);
        }

        let mut out = Vec::with_capacity(stroff + strtab.len());
        out.extend_from_slice(bytes_of(&MachHeader {
            magic: U32::new(BigEndian, object::macho::MH_CIGAM_64),
            cputype: U32::new(e, object::macho::CPU_TYPE_X86_64),
            cpusubtype: U32::new(e, 0),
            filetype: U32::new(e, object::macho::MH_OBJECT),
            ncmds: U32::new(e, ncmds),
            sizeofcmds: U32::new(e, sizeofcmds as u32),
            flags: U32::new(e, self.flags),
            reserved: U32::new(e, 0),
        }));

        out.extend_from_slice(bytes_of(&SegmentCommand {
            cmd: U32::new(e, object::macho::LC_SEGMENT_64),
            cmdsize: U32::new(e, seg_cmd_size as u32),
            segname: fixed16(b""),
            vmaddr: U64::new(e, 0),
            vmsize: U64::new(e, 0),
            fileoff: U64::new(e, 0),
            filesize: U64::new(e, 0),
            maxprot: U32::new(e, 7),
            initprot: U32::new(e, 7),
            nsects: U32::new(e, nsects as u32),
            flags: U32::new(e, 0),
        }));
        for (i, spec) in self.sections.iter().enumerate() {
            let mut hdr = section_header(
                &spec.segname,
                &spec.sectname,
                spec.addr,
                spec.data.len() as u64,
                spec.p2align,
            );
            hdr.offset = U32::new(e, section_offsets[i] as u32);
            hdr.reloff = U32::new(e, if spec.relocs.is_empty() { 0 } else { reloc_offsets[i] as u32 });
            hdr.nreloc = U32::new(e, spec.relocs.len() as u32);
            hdr.flags = U32::new(e, spec.flags);
            out.extend_from_slice(bytes_of(&hdr));
        }

        out.extend_from_slice(bytes_of(&SymtabCommand {
            cmd: U32::new(e, object::macho::LC_SYMTAB),
            cmdsize: U32::new(e, symtab_cmd_size as u32),
            symoff: U32::new(e, symoff as u32),
            nsyms: U32::new(e, self.syms.len() as u32),
            stroff: U32::new(e, stroff as u32),
            strsize: U32::new(e, strtab.len() as u32),
        }));

        for cmd in &option_cmds {
            out.extend_from_slice(cmd);
        }

        for (i, spec) in self.sections.iter().enumerate() {
            out.resize(section_offsets[i], 0);
            out.extend_from_slice(&spec.data);
        }
        for (i, spec) in self.sections.iter().enumerate() {
            out.resize(reloc_offsets[i], 0);
            for reloc in &spec.relocs {
                out.extend_from_slice(bytes_of(&reloc.relocation(e)));
            }
        }

        out.resize(symoff, 0);
        for (sym, &strx) in self.syms.iter().zip(&name_offsets) {
            let mut record = nlist(sym.n_type, sym.n_sect, sym.n_desc, sym.n_value);
            record.n_strx = U32::new(e, strx);
            out.extend_from_slice(bytes_of(&record));
        }

        out.resize(stroff, 0);
        out.extend_from_slice(&strtab);
        out
    }
}

pub(crate) struct DylibBuilder {
    install_name: Vec<u8>,
    exports: Vec<(Vec<u8>, u64)>,
    reexports: Vec<Vec<u8>>,
}

pub(crate) fn dylib(install_name: &str) -> DylibBuilder {
    DylibBuilder {
        install_name: install_name.as_bytes().to_vec(),
        exports: Vec::new(),
        reexports: Vec::new(),
    }
}

impl DylibBuilder {
    pub(crate) fn export(mut self, name: &[u8]) -> Self {
        self.exports.push((name.to_vec(), 0));
        self
    }

    pub(crate) fn weak_export(mut self, name: &[u8]) -> Self {
        self.exports.push((
            name.to_vec(),
            u64::from(object::macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION),
        ));
        self
    }

    pub(crate) fn reexport(mut self, path: &str) -> Self {
        self.reexports.push(path.as_bytes().to_vec());
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let e = LittleEndian;

        let dylib_cmd = |cmd: u32, name: &[u8]| -> Vec<u8> {
            let cmdsize = (size_of::<DylibCommand>() + name.len() + 1).next_multiple_of(8);
            let mut out = bytes_of(&DylibCommand {
                cmd: U32::new(e, cmd),
                cmdsize: U32::new(e, cmdsize as u32),
                dylib: object::macho::Dylib {
                    name: object::macho::LcStr {
                        offset: U32::new(e, size_of::<DylibCommand>() as u32),
                    },
                    timestamp: U32::new(e, 0),
                    current_version: U32::new(e, 0),
                    compatibility_version: U32::new(e, 0),
                },
            })
            .to_vec();
            out.extend_from_slice(name);
            out.push(0);
            out.resize(cmdsize, 0);
            out
        };

        let mut commands = vec![dylib_cmd(object::macho::LC_ID_DYLIB, &self.install_name)];
        for path in &self.reexports {
            commands.push(dylib_cmd(object::macho::LC_REEXPORT_DYLIB, path));
        }

        let trie = self.build_trie();
        let sizeofcmds =
            commands.iter().map(Vec::len).sum::<usize>() + size_of::<DyldInfoCommand>();
        let export_off = (size_of::<MachHeader>() + sizeofcmds).next_multiple_of(8);

        let mut out = Vec::new();
        out.extend_from_slice(bytes_of(&MachHeader {
            magic: U32::new(BigEndian, object::macho::MH_CIGAM_64),
            cputype: U32::new(e, object::macho::CPU_TYPE_X86_64),
            cpusubtype: U32::new(e, 0),
            filetype: U32::new(e, object::macho::MH_DYLIB),
            ncmds: U32::new(e, commands.len() as u32 + 1),
            sizeofcmds: U32::new(e, sizeofcmds as u32),
            flags: U32::new(e, 0),
            reserved: U32::new(e, 0),
        }));
        for cmd in &commands {
            out.extend_from_slice(cmd);
        }

        let mut info = DyldInfoCommand {
            cmd: U32::new(e, object::macho::LC_DYLD_INFO_ONLY),
            cmdsize: U32::new(e, size_of::<DyldInfoCommand>() as u32),
            rebase_off: U32::new(e, 0),
            rebase_size: U32::new(e, 0),
            bind_off: U32::new(e, 0),
            bind_size: U32::new(e, 0),
            weak_bind_off: U32::new(e, 0),
            weak_bind_size: U32::new(e, 0),
            lazy_bind_off: U32::new(e, 0),
            lazy_bind_size: U32::new(e, 0),
            export_off: U32::new(e, export_off as u32),
            export_size: U32::new(e, trie.len() as u32),
        };
        if trie.is_empty() {
            info.export_off = U32::new(e, 0);
        }
        out.extend_from_slice(bytes_of(&info));

        out.resize(export_off, 0);
        out.extend_from_slice(&trie);
        out
    }

    /// A flat two-level trie: the root has one edge per export, each edge
    /// labelled with the full name and pointing at a terminal node.
    fn build_trie(&self) -> Vec<u8> {
        if self.exports.is_empty() {
            return Vec::new();
        }

        // Root: no terminal, then edges. Child offsets use a fixed two-byte
        // uleb so they can be computed in one pass.
        let root_size: usize = 2 + self
            .exports
            .iter()
            .map(|(name, _)| name.len() + 1 + 2)
            .sum::<usize>();

        let mut out = vec![0u8, self.exports.len() as u8];
        for (i, (name, _)) in self.exports.iter().enumerate() {
            out.extend_from_slice(name);
            out.push(0);
            let offset = root_size + i * 4;
            out.push(0x80 | (offset & 0x7f) as u8);
            out.push((offset >> 7) as u8);
        }
        assert_eq!(out.len(), root_size);

        // Terminals: size, flags, address, no children.
        for (_, flags) in &self.exports {
            assert!(*flags < 0x80);
            out.extend_from_slice(&[2, *flags as u8, 0, 0]);
        }
        out
    }
}

/// Builds a BSD-style archive whose member data is 8-aligned, as Apple's ar
/// does by padding the `#1/N` name field.
pub(crate) fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = object::archive::MAGIC.to_vec();
    for (name, data) in members {
        let header_start = out.len();
        let mut name_len = name.len() + 1;
        while (header_start + 60 + name_len) % 8 != 0 {
            name_len += 1;
        }

        let mut header = vec![b' '; 60];
        let ident = format!("#1/{name_len}");
        header[..ident.len()].copy_from_slice(ident.as_bytes());
        let size = (name_len + data.len()).to_string();
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58] = b'`';
        header[59] = b'\n';

        out.extend_from_slice(&header);
        out.extend_from_slice(name.as_bytes());
        out.resize(header_start + 60 + name_len, 0);
        out.extend_from_slice(data);
        if out.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    out
}

/// A stub parser for tests that don't involve text stubs.
pub(crate) struct NoStubs;

impl StubParser for NoStubs {
    fn parse(&self, _data: &[u8]) -> Result<TextStub> {
        bail!("no stub parser in this test");
    }
}

/// A stub parser that returns a fixed result regardless of input.
pub(crate) struct StaticStub {
    pub(crate) install_name: &'static str,
    pub(crate) exports: &'static [&'static str],
    pub(crate) weak_exports: &'static [&'static str],
    pub(crate) reexported_libs: &'static [&'static str],
}

impl StubParser for StaticStub {
    fn parse(&self, _data: &[u8]) -> Result<TextStub> {
        Ok(TextStub {
            install_name: self.install_name.as_bytes().to_vec(),
            reexported_libs: self
                .reexported_libs
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            exports: self.exports.iter().map(|s| s.as_bytes().to_vec()).collect(),
            weak_exports: self
                .weak_exports
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_kind::FileKind;

    #[test]
    fn test_built_object_identifies() {
        let bytes = obj()
            .section(b"__TEXT", b"__text", 0x1000, &[0x90; 8])
            .global(b"_main", 1, 0x1000)
            .build();
        assert_eq!(FileKind::identify_bytes(&bytes).unwrap(), FileKind::MachObject);
    }

    #[test]
    fn test_built_dylib_identifies() {
        let bytes = dylib("/usr/lib/libfoo.dylib").export(b"_foo").build();
        assert_eq!(FileKind::identify_bytes(&bytes).unwrap(), FileKind::Dylib);
    }

    #[test]
    fn test_built_archive_identifies() {
        let bytes = archive(&[("a.o", b"data")]);
        assert_eq!(FileKind::identify_bytes(&bytes).unwrap(), FileKind::Archive);
    }
}
