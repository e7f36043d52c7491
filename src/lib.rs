//! The input-file ingestion and symbol resolution core of a Mach-O linker.
//! Given relocatable objects, dylibs, text stubs, archives and bitcode
//! modules, this crate parses each input into a normalized form, slices
//! sections into independently relocatable subsections, attaches compact
//! unwind records, and settles the global symbol graph: one owner per name,
//! archive members extracted transitively. Layout, relocation and output
//! writing consume the resulting [`LinkGraph`].

pub(crate) use anyhow::bail;

pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod dylib;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod lto;
pub(crate) mod macho;
pub(crate) mod object_file;
pub(crate) mod parsing;
pub(crate) mod resolution;
pub(crate) mod subsection;
pub(crate) mod symbol_db;
#[cfg(test)]
pub(crate) mod test_file;
pub(crate) mod unwind;

pub use crate::arch::Architecture;
pub use crate::args::Args;
pub use crate::dylib::DylibFile;
pub use crate::dylib::StubParser;
pub use crate::dylib::TextStub;
pub use crate::error::LinkError;
pub use crate::error::Result;
pub use crate::input_data::InputArena;
pub use crate::input_data::InputFile;
pub use crate::lto::LtoModule;
pub use crate::lto::LtoPlugin;
pub use crate::object_file::ObjectFile;
pub use crate::symbol_db::SymbolDb;
pub use crate::symbol_db::SymbolId;
pub use bumpalo_herd::Herd;

use crate::parsing::ParsedFile;
use crate::symbol_db::SymbolIntern;

/// The settled result of ingestion and resolution, handed to the downstream
/// stages of the linker.
#[derive(Debug)]
pub struct LinkGraph<'data> {
    pub(crate) files: Vec<ParsedFile<'data>>,
    pub(crate) symbol_db: SymbolDb<'data>,
}

impl<'data> LinkGraph<'data> {
    pub fn symbol_db(&self) -> &SymbolDb<'data> {
        &self.symbol_db
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn files(&self) -> &[ParsedFile<'data>] {
        &self.files
    }
}

/// Parses all inputs and resolves the symbol graph.
///
/// The arena and herd own memory that parsed files borrow (mapped inputs,
/// names materialized from export tries, synthetic section headers), so both
/// must outlive the returned graph. The stub parser and LTO plugin are the
/// external collaborators for `.tbd` and bitcode inputs respectively.
#[tracing::instrument(skip_all, name = "Link inputs")]
pub fn link_inputs<'data>(
    args: &Args,
    arena: &'data InputArena,
    herd: &'data Herd,
    stub_parser: &dyn StubParser,
    lto_plugin: Option<&'data (dyn LtoPlugin + 'data)>,
) -> Result<LinkGraph<'data>> {
    let intern = SymbolIntern::new();

    let mut files = parsing::parse_input_files(args, arena, herd, stub_parser, lto_plugin, &intern)?;
    let symbol_db = intern.freeze();

    resolution::resolve_and_mark_live(&files, &symbol_db)?;
    resolution::convert_common_symbols(&mut files, &symbol_db, herd);
    resolution::check_duplicate_symbols(&files, &symbol_db)?;

    Ok(LinkGraph { files, symbol_db })
}
