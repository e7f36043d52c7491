//! Code for opening input files and mapping them into memory. Mapped files are
//! placed into an arena so that views borrowed from them (`&'data [u8]`) live
//! for the whole link.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::Result;
use memmap2::Mmap;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;

/// The arena that owns every mapped input file. Created by the caller so that
/// `'data` outlives the link graph.
pub type InputArena = colosseum::sync::Arena<InputFile>;

/// Identifies a parsed input file by its index in the link graph's file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) fn from_usize(value: usize) -> FileId {
        FileId(u32::try_from(value).expect("File count overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

#[derive(Debug)]
pub struct InputFile {
    pub(crate) filename: PathBuf,

    data: Option<FileData>,
}

#[derive(Debug)]
pub(crate) struct FileData {
    bytes: Mmap,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        self.data.as_ref().map(|d| d.bytes.as_ref()).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn with_bytes(filename: PathBuf, bytes: &[u8]) -> InputFile {
        let mut mmap = memmap2::MmapOptions::new()
            .len(bytes.len().max(1))
            .map_anon()
            .unwrap();
        mmap[..bytes.len()].copy_from_slice(bytes);
        InputFile {
            filename,
            data: Some(FileData {
                bytes: mmap.make_read_only().unwrap(),
            }),
        }
    }
}

impl FileData {
    fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        // Safety: This is only safe if the input files aren't modified while
        // we've got them mapped. There's no way to protect against external
        // modification - the bytes could change without notice, or the file
        // could be truncated making accesses fault. mmap is still the right
        // trade-off here: large parts of most inputs are never read, and the
        // system can reclaim clean pages under memory pressure.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        Ok(FileData { bytes })
    }
}

/// Opens and maps `path`, storing the result in the arena.
pub(crate) fn open_file<'data>(arena: &'data InputArena, path: &Path) -> Result<&'data InputFile> {
    let data = FileData::new(path)?;
    Ok(arena.alloc(InputFile {
        filename: path.to_owned(),
        data: Some(data),
    }))
}

fn open_if_exists<'data>(arena: &'data InputArena, path: &Path) -> Result<Option<&'data InputFile>> {
    if !path.exists() {
        return Ok(None);
    }
    open_file(arena, path).map(Some)
}

/// Locates a dylib referenced by another dylib's reexport list. Relative paths
/// are opened directly. Absolute paths (install names) are tried under each
/// configured sysroot: a `.tbd` path as-is; a `.dylib` path first with its
/// extension swapped for `.tbd`; anything else with `.tbd` then `.dylib`
/// appended.
pub(crate) fn find_external_lib<'data>(
    args: &Args,
    arena: &'data InputArena,
    path: &str,
) -> Result<Option<&'data InputFile>> {
    if !path.starts_with('/') {
        return open_if_exists(arena, Path::new(path));
    }

    for root in &args.syslibroot {
        let rooted = |p: &str| -> PathBuf {
            let mut joined = root.clone().into_os_string();
            joined.push(p);
            PathBuf::from(joined)
        };

        if path.ends_with(".tbd") {
            if let Some(file) = open_if_exists(arena, &rooted(path))? {
                return Ok(Some(file));
            }
            continue;
        }

        if let Some(stem) = path.strip_suffix(".dylib") {
            if let Some(file) = open_if_exists(arena, &rooted(&format!("{stem}.tbd")))? {
                return Ok(Some(file));
            }
            if let Some(file) = open_if_exists(arena, &rooted(path))? {
                return Ok(Some(file));
            }
            continue;
        }

        for extension in [".tbd", ".dylib"] {
            if let Some(file) = open_if_exists(arena, &rooted(&format!("{path}{extension}")))? {
                return Ok(Some(file));
            }
        }
    }

    Ok(None)
}

/// Locates `-lname` on the library search path, preferring stubs to dylibs to
/// archives within each directory.
pub(crate) fn find_library<'data>(
    args: &Args,
    arena: &'data InputArena,
    name: &str,
) -> Result<&'data InputFile> {
    for dir in &args.lib_search_path {
        for filename in [
            format!("lib{name}.tbd"),
            format!("lib{name}.dylib"),
            format!("lib{name}.a"),
        ] {
            if let Some(file) = open_if_exists(arena, &dir.join(filename))? {
                return Ok(file);
            }
        }
    }
    crate::bail!("Couldn't find library `{name}` on library search path");
}

/// Identifies an input that may be an entry in an archive. Displays as
/// `path(member)`, the form used in all user-visible messages.
#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,

    /// The member name, when the input was carved out of an archive.
    pub(crate) member: Option<&'data [u8]>,
}

impl<'data> InputRef<'data> {
    pub(crate) fn whole_file(file: &'data InputFile) -> InputRef<'data> {
        InputRef { file, member: None }
    }
}

impl Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.file.filename.display(), f)?;
        if let Some(member) = self.member {
            write!(f, "({})", String::from_utf8_lossy(member))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
