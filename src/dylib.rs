//! Dynamic libraries, whether binary (`.dylib`, exports read from the export
//! trie) or text stubs (`.tbd`, delegated to the external stub parser). Either
//! way a dylib contributes an install name, a reexport list and a set of
//! exported symbol names; after the reexport closure is folded in, the names
//! are interned and the file takes part in resolution like any other.

use crate::args::Args;
use crate::args::Modifiers;
use crate::bail;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::FileId;
use crate::input_data::InputArena;
use crate::input_data::InputRef;
use crate::input_data::find_external_lib;
use crate::macho;
use crate::macho::DyldInfoCommand;
use crate::macho::DylibCommand;
use crate::macho::LinkEditDataCommand;
use crate::parsing::ParsedFile;
use crate::resolution::file_rank;
use crate::resolution::symbol_rank;
use crate::symbol_db::Scope;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolIntern;
use bumpalo_herd::Herd;
use hashbrown::HashSet;
use memchr::memchr;
use object::LittleEndian;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;

/// What the external TBD parser gives us for a text stub.
#[derive(Debug, Default)]
pub struct TextStub {
    pub install_name: Vec<u8>,
    pub reexported_libs: Vec<Vec<u8>>,
    pub exports: Vec<Vec<u8>>,
    pub weak_exports: Vec<Vec<u8>>,
}

/// The external `.tbd` parser. The core only consumes its output; parsing the
/// YAML/JSON formats lives with the driver.
pub trait StubParser: Sync {
    fn parse(&self, data: &[u8]) -> Result<TextStub>;
}

#[derive(Debug)]
pub struct DylibFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) data: &'data [u8],
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_weak: bool,
    pub(crate) is_reexported: bool,
    pub(crate) file_id: FileId,

    pub(crate) install_name: &'data [u8],
    pub(crate) reexported_libs: Vec<&'data [u8]>,
    pub(crate) exports: HashSet<&'data [u8]>,
    pub(crate) weak_exports: HashSet<&'data [u8]>,

    pub(crate) syms: Vec<SymbolId>,

    /// Parallel to `syms`: whether the export is only weakly defined.
    pub(crate) is_weak_symbol: Vec<bool>,
}

impl<'data> DylibFile<'data> {
    pub(crate) fn create(
        args: &Args,
        arena: &'data InputArena,
        herd: &'data Herd,
        stub_parser: &dyn StubParser,
        intern: &SymbolIntern<'data>,
        input: InputRef<'data>,
        kind: FileKind,
        priority: u32,
        modifiers: Modifiers,
    ) -> Result<DylibFile<'data>> {
        let is_alive = modifiers.needed || !args.dead_strip_dylibs;
        let mut dylib = DylibFile::new(input, priority, is_alive, modifiers);

        dylib.parse(kind, stub_parser, herd)?;
        dylib.merge_reexports(args, arena, herd, stub_parser)?;
        dylib.materialize_syms(intern);

        Ok(dylib)
    }

    fn new(
        input: InputRef<'data>,
        priority: u32,
        is_alive: bool,
        modifiers: Modifiers,
    ) -> DylibFile<'data> {
        DylibFile {
            input,
            data: input.file.data(),
            priority,
            is_alive: AtomicBool::new(is_alive),
            is_weak: modifiers.weak,
            is_reexported: modifiers.reexport,
            file_id: FileId::from_usize(0),
            install_name: &[],
            reexported_libs: Vec::new(),
            exports: HashSet::new(),
            weak_exports: HashSet::new(),
            syms: Vec::new(),
            is_weak_symbol: Vec::new(),
        }
    }

    fn parse(&mut self, kind: FileKind, stub_parser: &dyn StubParser, herd: &'data Herd) -> Result {
        match kind {
            FileKind::Tapi => self.parse_tapi(stub_parser, herd),
            FileKind::Dylib => self.parse_dylib(herd),
            _ => bail!("{}: is not a dylib", self.input),
        }
    }

    fn parse_tapi(&mut self, stub_parser: &dyn StubParser, herd: &'data Herd) -> Result {
        let stub = stub_parser.parse(self.data)?;
        let member = herd.get();

        self.install_name = member.alloc_slice_copy(&stub.install_name);
        self.reexported_libs = stub
            .reexported_libs
            .iter()
            .map(|lib| &*member.alloc_slice_copy(lib))
            .collect();
        self.exports = stub
            .exports
            .iter()
            .map(|name| &*member.alloc_slice_copy(name))
            .collect();
        self.weak_exports = stub
            .weak_exports
            .iter()
            .map(|name| &*member.alloc_slice_copy(name))
            .collect();
        Ok(())
    }

    fn parse_dylib(&mut self, herd: &'data Herd) -> Result {
        let e = LittleEndian;
        for cmd in macho::load_commands(self.data).map_err(|err| self.malformed(err))? {
            let cmd = cmd.map_err(|err| self.malformed(err))?;
            match cmd.cmd {
                object::macho::LC_ID_DYLIB => {
                    let c: &DylibCommand = cmd.command().map_err(|err| self.malformed(err))?;
                    self.install_name = cmd
                        .string_at(c.dylib.name.offset.get(e))
                        .map_err(|err| self.malformed(err))?;
                }
                object::macho::LC_DYLD_INFO | object::macho::LC_DYLD_INFO_ONLY => {
                    let c: &DyldInfoCommand = cmd.command().map_err(|err| self.malformed(err))?;
                    if c.export_off.get(e) != 0 {
                        let trie = macho::file_range(
                            self.data,
                            u64::from(c.export_off.get(e)),
                            u64::from(c.export_size.get(e)),
                        )
                        .map_err(|err| self.malformed(err))?;
                        self.read_trie(herd, trie, 0, &mut Vec::new())?;
                    }
                }
                object::macho::LC_DYLD_EXPORTS_TRIE => {
                    let c: &LinkEditDataCommand =
                        cmd.command().map_err(|err| self.malformed(err))?;
                    let trie = macho::file_range(
                        self.data,
                        u64::from(c.dataoff.get(e)),
                        u64::from(c.datasize.get(e)),
                    )
                    .map_err(|err| self.malformed(err))?;
                    self.read_trie(herd, trie, 0, &mut Vec::new())?;
                }
                object::macho::LC_REEXPORT_DYLIB => {
                    let c: &DylibCommand = cmd.command().map_err(|err| self.malformed(err))?;
                    let path = cmd
                        .string_at(c.dylib.name.offset.get(e))
                        .map_err(|err| self.malformed(err))?;
                    self.reexported_libs.push(path);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Walks one export-trie node. A node is a terminal payload (present when
    /// the first byte is nonzero) followed by a list of
    /// `(suffix, child offset)` edges; the accumulated prefix is the exported
    /// name.
    fn read_trie(
        &mut self,
        herd: &'data Herd,
        trie: &'data [u8],
        offset: usize,
        prefix: &mut Vec<u8>,
    ) -> Result {
        let Some(mut buf) = trie.get(offset..) else {
            bail!(self.malformed(format!("export trie offset {offset} out of range")));
        };
        if buf.is_empty() {
            bail!(self.malformed("truncated export trie node"));
        }

        if buf[0] != 0 {
            macho::read_uleb(&mut buf).map_err(|err| self.malformed(err))?; // terminal size
            let flags = macho::read_uleb(&mut buf).map_err(|err| self.malformed(err))?;
            macho::read_uleb(&mut buf).map_err(|err| self.malformed(err))?; // address

            let name = &*herd.get().alloc_slice_copy(prefix);
            if flags == u64::from(object::macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) {
                self.weak_exports.insert(name);
            } else {
                self.exports.insert(name);
            }
        } else {
            buf = &buf[1..];
        }

        let Some((&nchild, rest)) = buf.split_first() else {
            bail!(self.malformed("truncated export trie node"));
        };
        buf = rest;

        for _ in 0..nchild {
            let Some(len) = memchr(0, buf) else {
                bail!(self.malformed("unterminated edge label in export trie"));
            };
            let suffix = &buf[..len];
            buf = &buf[len + 1..];
            let child_offset = macho::read_uleb(&mut buf).map_err(|err| self.malformed(err))?;

            prefix.extend_from_slice(suffix);
            self.read_trie(herd, trie, child_offset as usize, prefix)?;
            prefix.truncate(prefix.len() - suffix.len());
        }
        Ok(())
    }

    /// Recursively opens every reexported child and folds its exports into
    /// ours, so that clients can resolve a child's symbols by naming only us.
    fn merge_reexports(
        &mut self,
        args: &Args,
        arena: &'data InputArena,
        herd: &'data Herd,
        stub_parser: &dyn StubParser,
    ) -> Result {
        for i in 0..self.reexported_libs.len() {
            let path = self.reexported_libs[i];
            let path_str = String::from_utf8_lossy(path).into_owned();

            let Some(file) = find_external_lib(args, arena, &path_str)? else {
                bail!(LinkError::UnresolvedReexport {
                    install_name: String::from_utf8_lossy(self.install_name).into_owned(),
                    path: path_str,
                });
            };

            let kind = FileKind::identify_bytes(file.data())?;
            let mut child = DylibFile::new(
                InputRef::whole_file(file),
                self.priority,
                false,
                Modifiers::default(),
            );
            child.parse(kind, stub_parser, herd)?;
            child.merge_reexports(args, arena, herd, stub_parser)?;

            self.exports.extend(child.exports);
            self.weak_exports.extend(child.weak_exports);
        }
        Ok(())
    }

    /// Interns the exported names. Weak-only exports go in flagged as weak;
    /// anything exported both ways counts as strong.
    fn materialize_syms(&mut self, intern: &SymbolIntern<'data>) {
        let mut names: Vec<&'data [u8]> = self.exports.iter().copied().collect();
        names.sort_unstable();
        for name in names {
            self.syms.push(intern.get_symbol(name));
            self.is_weak_symbol.push(false);
        }

        let mut weak_names: Vec<&'data [u8]> = self
            .weak_exports
            .iter()
            .copied()
            .filter(|name| !self.exports.contains(name))
            .collect();
        weak_names.sort_unstable();
        for name in weak_names {
            self.syms.push(intern.get_symbol(name));
            self.is_weak_symbol.push(true);
        }
    }

    pub(crate) fn resolve_symbols(&self, files: &[ParsedFile<'data>], db: &SymbolDb<'data>) {
        for (i, &id) in self.syms.iter().enumerate() {
            let symbol = db.symbol(id);
            let mut state = symbol.state.lock().unwrap();

            if file_rank(&files[self.file_id.as_usize()], false, false) < symbol_rank(&state, files)
            {
                state.file = Some(self.file_id);
                state.scope = Scope::Local;
                state.is_imported = true;
                state.is_weak = self.is_weak || self.is_weak_symbol[i];
                state.subsec = None;
                state.value = 0;
                state.is_common = false;
            }
        }
    }

    pub(crate) fn clear_symbols(&self, db: &SymbolDb<'data>) {
        for &id in &self.syms {
            let mut state = db.symbol(id).state.lock().unwrap();
            if state.file == Some(self.file_id) {
                *state = Default::default();
            }
        }
    }

    fn malformed(&self, reason: impl ToString) -> Error {
        LinkError::MalformedInput {
            file: self.input.to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

impl Display for DylibFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.input, f)
    }
}
