//! Code to read ar files. We don't use the ar crate because it provides access
//! to data only via the Read trait and we want to borrow the data of each
//! entry. Archives produced on Apple platforms use BSD conventions (`#1/N`
//! extended names stored in front of the member data, `__.SYMDEF` ranlib
//! members); archives produced by GNU ar use `//` name tables. We accept both.

use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use bytemuck::Pod;
use bytemuck::Zeroable;

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _mtime: [u8; 12],
    _uid: [u8; 6],
    _gid: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

/// An object (or bitcode) member carved out of an archive.
pub(crate) struct ArchiveMember<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) data: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    rest: &'data [u8],

    /// The GNU `//` extended-name table, once seen.
    filenames: Option<&'data [u8]>,
}

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of the whole archive, including the
    /// global header.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let Some(rest) = data.strip_prefix(&object::archive::MAGIC) else {
            bail!("Missing archive header");
        };
        Ok(Self {
            rest,
            filenames: None,
        })
    }

    fn next_member(&mut self) -> Result<Option<ArchiveMember<'data>>> {
        loop {
            if self.rest.is_empty() {
                return Ok(None);
            }
            if self.rest.len() < HEADER_SIZE {
                bail!("Short archive entry header");
            }
            let (header, rest) = self.rest.split_at(HEADER_SIZE);
            let header: &EntryHeader = bytemuck::from_bytes(header);
            let size = parse_decimal(&header.size).context("Invalid archive entry size")?;
            if rest.len() < size {
                bail!("Archive entry size is {size}, but only {} bytes left", rest.len());
            }
            let entry_data = &rest[..size];

            // Entries start on even offsets.
            let padded = size.next_multiple_of(2).min(rest.len());
            self.rest = &rest[padded..];

            let ident = trim_ident(&header.ident);

            let (name, data) = if let Some(digits) = strip_bsd_prefix(ident) {
                // BSD style: the real name occupies the first N bytes of the
                // data area, NUL padded.
                let name_len = parse_decimal(digits).context("Invalid BSD name length")?;
                if name_len > entry_data.len() {
                    bail!("BSD member name length {name_len} exceeds entry size {size}");
                }
                let (name, data) = entry_data.split_at(name_len);
                (trim_nuls(name), data)
            } else if ident == b"//" {
                self.filenames = Some(entry_data);
                continue;
            } else if ident == b"/" || ident == b"/SYM64/" {
                // GNU symbol table. We use the symbol tables of the members
                // themselves instead.
                continue;
            } else if let Some(digits) = ident.strip_prefix(b"/") {
                let offset = parse_decimal(digits).context("Invalid extended name offset")?;
                let Some(table) = self.filenames else {
                    bail!("Extended name used before name table");
                };
                let Some(name_bytes) = table.get(offset..) else {
                    bail!("Extended name offset {offset} out of range");
                };
                let end = memchr::memchr(b'\n', name_bytes).unwrap_or(name_bytes.len());
                let name = name_bytes[..end].strip_suffix(b"/").unwrap_or(&name_bytes[..end]);
                (name, entry_data)
            } else {
                (ident.strip_suffix(b"/").unwrap_or(ident), entry_data)
            };

            if is_symdef_name(name) {
                continue;
            }

            return Ok(Some(ArchiveMember { name, data }));
        }
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveMember<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_member().transpose()
    }
}

/// Ranlib index members written by Apple tooling.
fn is_symdef_name(name: &[u8]) -> bool {
    name == b"__.SYMDEF"
        || name == b"__.SYMDEF SORTED"
        || name == b"__.SYMDEF_64"
        || name == b"__.SYMDEF_64 SORTED"
}

fn strip_bsd_prefix(ident: &[u8]) -> Option<&[u8]> {
    ident.strip_prefix(b"#1/")
}

fn trim_ident(ident: &[u8; 16]) -> &[u8] {
    let end = ident
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |p| p + 1);
    &ident[..end]
}

fn trim_nuls(name: &[u8]) -> &[u8] {
    let end = name.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &name[..end]
}

fn parse_decimal(bytes: &[u8]) -> Result<usize> {
    let mut value: usize = 0;
    let mut seen_digit = false;
    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                seen_digit = true;
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(usize::from(b - b'0')))
                    .context("Decimal field overflow")?;
            }
            b' ' => break,
            _ => bail!("Unexpected byte {b:#x} in decimal field"),
        }
    }
    if !seen_digit {
        bail!("Empty decimal field");
    }
    Ok(value)
}
