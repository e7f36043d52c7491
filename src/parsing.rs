//! Turns command-line inputs into parsed files. Files are opened and archives
//! split serially so that priorities follow command-line order exactly, then
//! object parsing fans out across threads. Dylibs parse during loading because
//! their reexport closure may pull further files off disk.

use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::bail;
use crate::dylib::DylibFile;
use crate::dylib::StubParser;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::FileId;
use crate::input_data::InputArena;
use crate::input_data::InputRef;
use crate::input_data::find_library;
use crate::input_data::open_file;
use crate::lto::LtoPlugin;
use crate::object_file::ObjectFile;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolIntern;
use bumpalo_herd::Herd;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;

#[derive(Debug)]
pub(crate) enum ParsedFile<'data> {
    Object(Box<ObjectFile<'data>>),
    Dylib(Box<DylibFile<'data>>),
}

impl<'data> ParsedFile<'data> {
    pub(crate) fn input(&self) -> InputRef<'data> {
        match self {
            ParsedFile::Object(o) => o.input,
            ParsedFile::Dylib(d) => d.input,
        }
    }

    pub(crate) fn priority(&self) -> u32 {
        match self {
            ParsedFile::Object(o) => o.priority,
            ParsedFile::Dylib(d) => d.priority,
        }
    }

    pub(crate) fn is_alive(&self) -> &AtomicBool {
        match self {
            ParsedFile::Object(o) => &o.is_alive,
            ParsedFile::Dylib(d) => &d.is_alive,
        }
    }

    pub(crate) fn is_dylib(&self) -> bool {
        matches!(self, ParsedFile::Dylib(_))
    }

    pub(crate) fn file_id(&self) -> FileId {
        match self {
            ParsedFile::Object(o) => o.file_id,
            ParsedFile::Dylib(d) => d.file_id,
        }
    }

    pub(crate) fn set_file_id(&mut self, file_id: FileId) {
        match self {
            ParsedFile::Object(o) => o.file_id = file_id,
            ParsedFile::Dylib(d) => d.file_id = file_id,
        }
    }

    pub(crate) fn resolve_symbols(
        &self,
        files: &[ParsedFile<'data>],
        db: &SymbolDb<'data>,
    ) -> Result {
        match self {
            ParsedFile::Object(o) => o.resolve_symbols(files, db),
            ParsedFile::Dylib(d) => {
                d.resolve_symbols(files, db);
                Ok(())
            }
        }
    }

    pub(crate) fn clear_symbols(&self, db: &SymbolDb<'data>) {
        match self {
            ParsedFile::Object(o) => o.clear_symbols(db),
            ParsedFile::Dylib(d) => d.clear_symbols(db),
        }
    }

    pub(crate) fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            ParsedFile::Object(o) => Some(o.as_ref()),
            ParsedFile::Dylib(_) => None,
        }
    }
}

impl Display for ParsedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.input(), f)
    }
}

#[tracing::instrument(skip_all, name = "Load and parse input files")]
pub(crate) fn parse_input_files<'data>(
    args: &Args,
    arena: &'data InputArena,
    herd: &'data Herd,
    stub_parser: &dyn StubParser,
    lto_plugin: Option<&'data (dyn LtoPlugin + 'data)>,
    intern: &SymbolIntern<'data>,
) -> Result<Vec<ParsedFile<'data>>> {
    let mut files = Vec::new();
    let mut next_priority = 0u32;
    let mut take_priority = || {
        let p = next_priority;
        next_priority += 1;
        p
    };

    for input in &args.inputs {
        let file = match &input.spec {
            crate::args::InputSpec::File(path) => open_file(arena, path)?,
            crate::args::InputSpec::Lib(name) => find_library(args, arena, name)?,
        };
        let kind = FileKind::identify_bytes(file.data())
            .with_context(|| format!("Failed to identify `{}`", file.filename.display()))?;

        match kind {
            FileKind::MachObject | FileKind::LlvmBitcode => {
                files.push(ParsedFile::Object(Box::new(ObjectFile::new(
                    InputRef::whole_file(file),
                    file.data(),
                    kind,
                    take_priority(),
                    true,
                    input.modifiers.hidden,
                ))));
            }
            FileKind::Archive => {
                // The archive itself claims a priority slot, so members rank
                // strictly after the point where the archive was named.
                take_priority();

                for member in ArchiveIterator::from_archive_bytes(file.data())
                    .with_context(|| format!("Failed to parse archive `{}`", file.filename.display()))?
                {
                    let member = member?;
                    let input_ref = InputRef {
                        file,
                        member: Some(member.name),
                    };
                    let member_kind = FileKind::identify_bytes(member.data)
                        .with_context(|| format!("Failed to identify `{input_ref}`"))?;
                    if !matches!(member_kind, FileKind::MachObject | FileKind::LlvmBitcode) {
                        bail!("Archive member is not an object `{input_ref}`");
                    }
                    files.push(ParsedFile::Object(Box::new(ObjectFile::new(
                        input_ref,
                        member.data,
                        member_kind,
                        take_priority(),
                        args.all_load,
                        input.modifiers.hidden,
                    ))));
                }
            }
            FileKind::Dylib | FileKind::Tapi => {
                files.push(ParsedFile::Dylib(Box::new(DylibFile::create(
                    args,
                    arena,
                    herd,
                    stub_parser,
                    intern,
                    InputRef::whole_file(file),
                    kind,
                    take_priority(),
                    input.modifiers,
                )?)));
            }
        }
    }

    for (i, file) in files.iter_mut().enumerate() {
        file.set_file_id(FileId::from_usize(i));
    }

    files.par_iter_mut().try_for_each(|file| {
        if let ParsedFile::Object(obj) = file {
            obj.parse(intern, herd, lto_plugin)
                .with_context(|| format!("Failed to parse object file `{}`", obj.input))
        } else {
            Ok(())
        }
    })?;

    Ok(files)
}
