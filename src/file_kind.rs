//! Code for identifying what sort of file we're dealing with based on the bytes
//! of the file.

use crate::bail;
use crate::error::Result;
use crate::macho;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    MachObject,
    Dylib,
    Tapi,
    Archive,
    LlvmBitcode,
}

/// Raw LLVM bitcode starts with 'BC' 0xC0 0xDE; on Apple platforms it's often
/// wrapped in a header whose magic is 0x0B17C0DE.
const BITCODE_MAGIC: &[u8] = b"BC\xc0\xde";
const BITCODE_WRAPPER_MAGIC: [u8; 4] = 0x0b17_c0de_u32.to_le_bytes();

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            return Ok(FileKind::Archive);
        }
        if bytes.starts_with(BITCODE_MAGIC) || bytes.starts_with(&BITCODE_WRAPPER_MAGIC) {
            return Ok(FileKind::LlvmBitcode);
        }
        if let Ok(header) = macho::parse_header(bytes) {
            return match header.filetype.get(LittleEndian) {
                object::macho::MH_OBJECT => Ok(FileKind::MachObject),
                object::macho::MH_DYLIB => Ok(FileKind::Dylib),
                t => bail!("Unsupported Mach-O file type {t}"),
            };
        }
        // Text-based stubs are YAML documents ("--- !tapi-tbd") or, in the v5
        // format, JSON.
        if bytes.starts_with(b"---") || bytes.starts_with(b"{") {
            return Ok(FileKind::Tapi);
        }
        bail!("Couldn't identify file type");
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::MachObject => "Mach-O object",
            FileKind::Dylib => "Mach-O dylib",
            FileKind::Tapi => "text-based stub",
            FileKind::Archive => "archive",
            FileKind::LlvmBitcode => "LLVM bitcode",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(b"BC\xc0\xde...").unwrap(),
            FileKind::LlvmBitcode
        );
        assert_eq!(
            FileKind::identify_bytes(b"--- !tapi-tbd\n").unwrap(),
            FileKind::Tapi
        );
        assert!(FileKind::identify_bytes(b"\x7fELF").is_err());
    }
}
