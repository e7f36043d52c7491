//! Typed, non-owning views over the parts of the Mach-O container that the
//! linker consumes. Everything here borrows from the mapped file; nothing is
//! copied. Offsets are validated against the file size before a view is handed
//! out, so later stages can index without further checks.

use crate::bail;
use crate::error::Result;
use memchr::memchr;
use object::LittleEndian;
use object::U32Bytes;
use object::U64Bytes;

pub(crate) type MachHeader = object::macho::MachHeader64<LittleEndian>;
pub(crate) type SegmentCommand = object::macho::SegmentCommand64<LittleEndian>;
pub(crate) type SectionHeader = object::macho::Section64<LittleEndian>;
pub(crate) type MachSym = object::macho::Nlist64<LittleEndian>;
pub(crate) type SymtabCommand = object::macho::SymtabCommand<LittleEndian>;
pub(crate) type DysymtabCommand = object::macho::DysymtabCommand<LittleEndian>;
pub(crate) type LinkEditDataCommand = object::macho::LinkeditDataCommand<LittleEndian>;
pub(crate) type DylibCommand = object::macho::DylibCommand<LittleEndian>;
pub(crate) type DyldInfoCommand = object::macho::DyldInfoCommand<LittleEndian>;
pub(crate) type LinkerOptionCommand = object::macho::LinkerOptionCommand<LittleEndian>;
pub(crate) type MachReloc = object::macho::Relocation<LittleEndian>;
pub(crate) type DataInCodeEntry = object::macho::DataInCodeEntry<LittleEndian>;

pub(crate) type LoadCommand = object::macho::LoadCommand<LittleEndian>;

/// One entry of `__LD,__compact_unwind`. `object` has no definition for this;
/// the layout is fixed by the unwind format. Byte-array fields because the
/// section is only guaranteed pointer alignment within the file.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct CompactUnwindEntry {
    pub(crate) code_start: U64Bytes<LittleEndian>,
    pub(crate) code_len: U32Bytes<LittleEndian>,
    pub(crate) encoding: U32Bytes<LittleEndian>,
    pub(crate) personality: U64Bytes<LittleEndian>,
    pub(crate) lsda: U64Bytes<LittleEndian>,
}

// Safety: repr(C), fields are plain byte arrays, so there's no padding and any
// bit pattern is valid.
unsafe impl object::pod::Pod for CompactUnwindEntry {}

const _ASSERTS: () = {
    assert!(size_of::<CompactUnwindEntry>() == 32);
};

pub(crate) fn parse_header(data: &[u8]) -> Result<&MachHeader> {
    if data.get(..4) != Some(object::macho::MH_MAGIC_64.to_le_bytes().as_slice()) {
        bail!("Not a 64-bit little-endian Mach-O file");
    }
    match object::from_bytes::<MachHeader>(data) {
        Ok((header, _)) => Ok(header),
        Err(()) => bail!("Truncated Mach-O header"),
    }
}

/// Returns `data[offset..offset + size]`, failing if the range escapes the
/// file.
pub(crate) fn file_range(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let range = offset
        .checked_add(size)
        .and_then(|end| data.get(offset as usize..end as usize));
    let Some(range) = range else {
        bail!("Range {offset:#x}+{size:#x} escapes the file (size {:#x})", data.len());
    };
    Ok(range)
}

pub(crate) fn slice_of<T: object::pod::Pod>(data: &[u8], count: usize) -> Result<&[T]> {
    match object::slice_from_bytes(data, count) {
        Ok((slice, _)) => Ok(slice),
        Err(()) => bail!(
            "Not enough bytes for {count} records of {}",
            core::any::type_name::<T>()
        ),
    }
}

/// Iterates load commands, advancing by each command's `cmdsize`.
pub(crate) struct LoadCommands<'data> {
    rest: &'data [u8],
    remaining: u32,
}

#[derive(Clone, Copy)]
pub(crate) struct RawCommand<'data> {
    pub(crate) cmd: u32,

    /// The whole command, including the 8-byte header.
    pub(crate) bytes: &'data [u8],
}

pub(crate) fn load_commands(data: &[u8]) -> Result<LoadCommands<'_>> {
    let header = parse_header(data)?;
    let sizeofcmds = u64::from(header.sizeofcmds.get(LittleEndian));
    let rest = file_range(data, size_of::<MachHeader>() as u64, sizeofcmds)?;
    Ok(LoadCommands {
        rest,
        remaining: header.ncmds.get(LittleEndian),
    })
}

pub(crate) fn find_load_command(data: &[u8], want: u32) -> Result<Option<RawCommand<'_>>> {
    for cmd in load_commands(data)? {
        let cmd = cmd?;
        if cmd.cmd == want {
            return Ok(Some(cmd));
        }
    }
    Ok(None)
}

impl<'data> LoadCommands<'data> {
    fn next_command(&mut self) -> Result<RawCommand<'data>> {
        let Ok((header, _)) = object::from_bytes::<LoadCommand>(self.rest) else {
            bail!("Truncated load command");
        };
        let cmdsize = header.cmdsize.get(LittleEndian) as usize;
        if cmdsize < size_of::<LoadCommand>() || cmdsize > self.rest.len() {
            bail!("Invalid load command size {cmdsize}");
        }
        let (bytes, rest) = self.rest.split_at(cmdsize);
        self.rest = rest;
        Ok(RawCommand {
            cmd: header.cmd.get(LittleEndian),
            bytes,
        })
    }
}

impl<'data> Iterator for LoadCommands<'data> {
    type Item = Result<RawCommand<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.remaining = self.remaining.checked_sub(1)?;
        Some(self.next_command())
    }
}

impl<'data> RawCommand<'data> {
    /// Views the command as a typed structure. The structure includes the
    /// `cmd`/`cmdsize` prefix.
    pub(crate) fn command<T: object::pod::Pod>(&self) -> Result<&'data T> {
        match object::from_bytes(self.bytes) {
            Ok((cmd, _)) => Ok(cmd),
            Err(()) => bail!("Load command 0x{:x} too short", self.cmd),
        }
    }

    /// Reads a NUL-terminated string stored in the command's trailing payload
    /// at `offset` from the start of the command (the `lc_str` convention).
    pub(crate) fn string_at(&self, offset: u32) -> Result<&'data [u8]> {
        let Some(bytes) = self.bytes.get(offset as usize..) else {
            bail!("lc_str offset {offset} outside load command");
        };
        let Some(len) = memchr(0, bytes) else {
            bail!("Unterminated string in load command");
        };
        Ok(&bytes[..len])
    }

    /// For LC_SEGMENT_64: the segment command and the section headers that
    /// follow it.
    pub(crate) fn segment_sections(&self) -> Result<(&'data SegmentCommand, &'data [SectionHeader])> {
        let (segment, rest) = match object::from_bytes::<SegmentCommand>(self.bytes) {
            Ok(r) => r,
            Err(()) => bail!("LC_SEGMENT_64 too short"),
        };
        let nsects = segment.nsects.get(LittleEndian) as usize;
        let sections = slice_of::<SectionHeader>(rest, nsects)?;
        Ok((segment, sections))
    }
}

/// The raw symbol table and its string table.
#[derive(Clone, Copy)]
pub(crate) struct Symtab<'data> {
    pub(crate) syms: &'data [MachSym],
    pub(crate) strings: StringTable<'data>,
}

pub(crate) fn symtab(data: &[u8]) -> Result<Option<Symtab<'_>>> {
    let Some(cmd) = find_load_command(data, object::macho::LC_SYMTAB)? else {
        return Ok(None);
    };
    let cmd: &SymtabCommand = cmd.command()?;
    let e = LittleEndian;
    let nsyms = cmd.nsyms.get(e) as usize;
    let sym_bytes = file_range(
        data,
        u64::from(cmd.symoff.get(e)),
        nsyms as u64 * size_of::<MachSym>() as u64,
    )?;
    let str_bytes = file_range(
        data,
        u64::from(cmd.stroff.get(e)),
        u64::from(cmd.strsize.get(e)),
    )?;
    Ok(Some(Symtab {
        syms: slice_of(sym_bytes, nsyms)?,
        strings: StringTable::new(str_bytes),
    }))
}

pub(crate) fn dysymtab(data: &[u8]) -> Result<Option<&DysymtabCommand>> {
    match find_load_command(data, object::macho::LC_DYSYMTAB)? {
        Some(cmd) => Ok(Some(cmd.command()?)),
        None => Ok(None),
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct StringTable<'data> {
    data: &'data [u8],
}

impl<'data> StringTable<'data> {
    pub(crate) fn new(data: &'data [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn get(&self, offset: u32) -> Result<&'data [u8]> {
        let Some(bytes) = self.data.get(offset as usize..) else {
            bail!("String table offset {offset} out of range");
        };
        let Some(len) = memchr(0, bytes) else {
            bail!("Unterminated string table entry");
        };
        Ok(&bytes[..len])
    }
}

/// Properties of an `nlist_64` entry, in the decoded form the rest of the
/// crate works with.
pub(crate) trait MachSymExt {
    fn is_extern(&self) -> bool;
    fn is_private_extern(&self) -> bool;
    fn sym_type(&self) -> u8;
    fn is_undef(&self) -> bool;
    fn is_common(&self) -> bool;
    fn desc(&self) -> u16;
    fn value(&self) -> u64;
    fn section(&self) -> usize;

    /// A common symbol's requested alignment lives in the alignment bits of
    /// `n_desc`.
    fn common_p2align(&self) -> u8;
}

impl MachSymExt for MachSym {
    fn is_extern(&self) -> bool {
        self.n_type & object::macho::N_EXT != 0
    }

    fn is_private_extern(&self) -> bool {
        self.n_type & object::macho::N_PEXT != 0
    }

    fn sym_type(&self) -> u8 {
        self.n_type & object::macho::N_TYPE
    }

    fn is_undef(&self) -> bool {
        self.sym_type() == object::macho::N_UNDF && self.value() == 0
    }

    fn is_common(&self) -> bool {
        self.is_extern() && self.sym_type() == object::macho::N_UNDF && self.value() != 0
    }

    fn desc(&self) -> u16 {
        self.n_desc.get(LittleEndian)
    }

    fn value(&self) -> u64 {
        self.n_value.get(LittleEndian)
    }

    fn section(&self) -> usize {
        usize::from(self.n_sect)
    }

    fn common_p2align(&self) -> u8 {
        ((self.desc() >> 8) & 0x0f) as u8
    }
}

/// Returns the name stored in a fixed 16-byte `segname`/`sectname` field.
pub(crate) fn fixed_name(bytes: &[u8; 16]) -> &[u8] {
    let len = memchr(0, bytes).unwrap_or(bytes.len());
    &bytes[..len]
}

pub(crate) fn section_matches(hdr: &SectionHeader, segname: &[u8], sectname: &[u8]) -> bool {
    fixed_name(&hdr.segname) == segname && fixed_name(&hdr.sectname) == sectname
}

pub(crate) fn section_type(hdr: &SectionHeader) -> u32 {
    hdr.flags.get(LittleEndian) & object::macho::SECTION_TYPE
}

pub(crate) fn is_debug_section(hdr: &SectionHeader) -> bool {
    hdr.flags.get(LittleEndian) & object::macho::S_ATTR_DEBUG != 0
}

pub(crate) fn is_zerofill(hdr: &SectionHeader) -> bool {
    section_type(hdr) == object::macho::S_ZEROFILL
}

pub(crate) fn read_uleb(buf: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            bail!("Truncated uleb128");
        };
        *buf = rest;
        if shift >= 64 {
            bail!("uleb128 value too large");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
