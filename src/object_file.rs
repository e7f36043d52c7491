//! Relocatable Mach-O object files (and bitcode files pretending to be them).
//! Parsing populates sections, the symbol table and subsections; the
//! resolution methods race against other files to claim each global symbol,
//! taking the symbol's lock for each update.

use crate::arch::Architecture;
use crate::bail;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::FileId;
use crate::input_data::InputRef;
use crate::lto::LtoModule;
use crate::macho;
use crate::macho::DataInCodeEntry;
use crate::macho::DysymtabCommand;
use crate::macho::LinkEditDataCommand;
use crate::macho::LinkerOptionCommand;
use crate::macho::MachSym;
use crate::macho::MachSymExt as _;
use crate::macho::SectionHeader;
use crate::parsing::ParsedFile;
use crate::resolution::file_rank;
use crate::resolution::symbol_rank;
use crate::subsection;
use crate::subsection::InputSection;
use crate::subsection::Subsection;
use crate::symbol_db::Scope;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolIntern;
use crate::unwind::UnwindRecord;
use bumpalo_herd::Herd;
use crossbeam_queue::SegQueue;
use memchr::memchr;
use object::LittleEndian;
use object::U32;
use object::U64;
use std::borrow::Cow;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// An entry of the file's symbol table: either a pointer into the global
/// interned table, or one of this file's own local symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolSlot {
    Global(SymbolId),
    Local(u32),
}

/// A symbol that isn't visible outside its file. Never interned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalSymbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) subsec: Option<u32>,
    pub(crate) value: u64,
}

pub struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) data: &'data [u8],
    pub(crate) kind: FileKind,
    pub(crate) arch: Architecture,

    /// Position in command-line order; breaks rank ties during resolution.
    pub(crate) priority: u32,

    /// Whether this file will be part of the output. Archive members start
    /// dead and are revived by the mark-live sweep.
    pub(crate) is_alive: AtomicBool,

    /// From `-hidden-l`: extern symbols resolve as private extern.
    pub(crate) is_hidden: bool,

    pub(crate) file_id: FileId,

    /// Parallel to the Mach-O section table. Empty slots for
    /// `__LD,__compact_unwind` and debug sections.
    pub(crate) sections: Vec<Option<InputSection<'data>>>,

    pub(crate) unwind_sec: Option<&'data SectionHeader>,

    /// Borrowed from the file for real objects; synthesized for bitcode.
    pub(crate) mach_syms: Cow<'data, [MachSym]>,

    pub(crate) syms: Vec<SymbolSlot>,
    pub(crate) local_syms: Vec<LocalSymbol<'data>>,

    /// Sorted by `input_addr` once parsing completes.
    pub(crate) subsections: Vec<Subsection>,

    /// Maps a symbol-table index to the subsection that contains it.
    pub(crate) sym_to_subsec: Vec<Option<u32>>,

    pub(crate) unwind_records: Vec<UnwindRecord>,

    pub(crate) dysymtab: Option<&'data DysymtabCommand>,

    pub(crate) data_in_code_entries: &'data [DataInCodeEntry],

    /// Lazily created `__DATA,__common` section, as an index into `sections`.
    common_sec: Option<u32>,

    pub(crate) lto_module: Option<Box<dyn LtoModule + Send + Sync + 'data>>,
}

impl<'data> std::fmt::Debug for ObjectFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFile")
            .field("kind", &self.kind)
            .field("arch", &self.arch)
            .field("file_id", &self.file_id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn new(
        input: InputRef<'data>,
        data: &'data [u8],
        kind: FileKind,
        priority: u32,
        is_alive: bool,
        is_hidden: bool,
    ) -> ObjectFile<'data> {
        ObjectFile {
            input,
            data,
            kind,
            arch: Architecture::X86_64,
            priority,
            is_alive: AtomicBool::new(is_alive),
            is_hidden,
            file_id: FileId::from_usize(0),
            sections: Vec::new(),
            unwind_sec: None,
            mach_syms: Cow::Borrowed(&[]),
            syms: Vec::new(),
            local_syms: Vec::new(),
            subsections: Vec::new(),
            sym_to_subsec: Vec::new(),
            unwind_records: Vec::new(),
            dysymtab: None,
            data_in_code_entries: &[],
            common_sec: None,
            lto_module: None,
        }
    }

    pub(crate) fn parse(
        &mut self,
        intern: &SymbolIntern<'data>,
        herd: &'data Herd,
        lto_plugin: Option<&'data (dyn crate::lto::LtoPlugin + 'data)>,
    ) -> Result {
        if self.kind == FileKind::LlvmBitcode {
            return self.parse_lto_symbols(intern, herd, lto_plugin);
        }

        let header = macho::parse_header(self.data).map_err(|e| self.malformed(e))?;
        self.arch = Architecture::from_cputype(header.cputype.get(LittleEndian))?;

        self.parse_sections()?;
        self.parse_symbols(intern)?;
        self.dysymtab = macho::dysymtab(self.data).map_err(|e| self.malformed(e))?;

        let flags = header.flags.get(LittleEndian);
        let mut split = if flags & object::macho::MH_SUBSECTIONS_VIA_SYMBOLS != 0 {
            subsection::split_via_symbols(self.input, &self.sections, &self.mach_syms)?
        } else {
            subsection::split_by_section(self.input, &self.sections, &self.mach_syms)?
        };
        split.sort_by_address();
        self.subsections = split.subsections;
        self.sym_to_subsec = split.sym_to_subsec;

        self.fix_local_symbols();

        if self.unwind_sec.is_some() {
            self.parse_compact_unwind()?;
        }

        self.parse_data_in_code()?;

        Ok(())
    }

    fn parse_sections(&mut self) -> Result {
        for cmd in macho::load_commands(self.data).map_err(|e| self.malformed(e))? {
            let cmd = cmd.map_err(|e| self.malformed(e))?;
            if cmd.cmd != object::macho::LC_SEGMENT_64 {
                continue;
            }
            let (_, section_headers) = cmd.segment_sections().map_err(|e| self.malformed(e))?;

            for hdr in section_headers {
                if macho::section_matches(hdr, b"__LD", b"__compact_unwind") {
                    self.unwind_sec = Some(hdr);
                    self.sections.push(None);
                    continue;
                }
                if macho::is_debug_section(hdr) {
                    self.sections.push(None);
                    continue;
                }
                let isec = InputSection::parse(self.data, hdr).map_err(|e| self.malformed(e))?;
                self.sections.push(Some(isec));
            }
        }
        Ok(())
    }

    fn parse_symbols(&mut self, intern: &SymbolIntern<'data>) -> Result {
        let Some(symtab) = macho::symtab(self.data).map_err(|e| self.malformed(e))? else {
            return Ok(());
        };
        self.mach_syms = Cow::Borrowed(symtab.syms);
        self.syms.reserve(symtab.syms.len());

        for msym in symtab.syms {
            let name = symtab
                .strings
                .get(msym.n_strx.get(LittleEndian))
                .map_err(|e| self.malformed(e))?;

            if msym.is_extern() {
                self.syms.push(SymbolSlot::Global(intern.get_symbol(name)));
                continue;
            }

            let value = match msym.sym_type() {
                object::macho::N_UNDF => {
                    bail!(LinkError::LocalUndefined {
                        file: self.input.to_string(),
                        symbol: String::from_utf8_lossy(name).into_owned(),
                    });
                }
                object::macho::N_ABS => msym.value(),
                // `value` and `subsec` get filled in by `fix_local_symbols`.
                object::macho::N_SECT => 0,
                _ => {
                    bail!(LinkError::UnknownSymbolType {
                        file: self.input.to_string(),
                        symbol: String::from_utf8_lossy(name).into_owned(),
                        n_type: msym.n_type,
                    });
                }
            };

            self.syms
                .push(SymbolSlot::Local(self.local_syms.len() as u32));
            self.local_syms.push(LocalSymbol {
                name,
                subsec: None,
                value,
            });
        }
        Ok(())
    }

    /// Fills in `subsec` and `value` for local section symbols. A symbol that
    /// no subsection covers (e.g. one inside `__compact_unwind`) keeps its raw
    /// address.
    fn fix_local_symbols(&mut self) {
        for i in 0..self.mach_syms.len() {
            let SymbolSlot::Local(local_index) = self.syms[i] else {
                continue;
            };
            let msym = self.mach_syms[i];
            if msym.sym_type() != object::macho::N_SECT {
                continue;
            }

            let subsec = self.sym_to_subsec[i].or_else(|| self.find_subsection(msym.value()));
            let local = &mut self.local_syms[local_index as usize];
            match subsec {
                Some(s) => {
                    local.subsec = Some(s);
                    local.value = msym.value() - self.subsections[s as usize].input_addr;
                }
                None => {
                    local.subsec = None;
                    local.value = msym.value();
                }
            }
        }
    }

    fn parse_data_in_code(&mut self) -> Result {
        let Some(cmd) = macho::find_load_command(self.data, object::macho::LC_DATA_IN_CODE)
            .map_err(|e| self.malformed(e))?
        else {
            return Ok(());
        };
        let cmd: &LinkEditDataCommand = cmd.command().map_err(|e| self.malformed(e))?;
        let e = LittleEndian;
        let count = cmd.datasize.get(e) as usize / size_of::<DataInCodeEntry>();
        let bytes = macho::file_range(
            self.data,
            u64::from(cmd.dataoff.get(e)),
            (count * size_of::<DataInCodeEntry>()) as u64,
        )
        .map_err(|e| self.malformed(e))?;
        self.data_in_code_entries = macho::slice_of(bytes, count).map_err(|e| self.malformed(e))?;
        Ok(())
    }

    /// The last subsection whose start address is <= `addr`, or None if `addr`
    /// precedes all of them.
    pub(crate) fn find_subsection(&self, addr: u64) -> Option<u32> {
        subsection::find_subsection(&self.subsections, addr)
    }

    /// The extern symbol defined at exactly `addr`, if any.
    pub(crate) fn find_symbol(&self, addr: u64) -> Option<SymbolId> {
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if msym.is_extern() && msym.value() == addr {
                let SymbolSlot::Global(id) = self.syms[i] else {
                    continue;
                };
                return Some(id);
            }
        }
        None
    }

    /// Strings passed to the linker via `LC_LINKER_OPTION` (e.g. from
    /// `#pragma comment(lib, ...)`). Bitcode files have none.
    pub(crate) fn get_linker_options(&self) -> Result<Vec<String>> {
        if self.kind == FileKind::LlvmBitcode {
            return Ok(Vec::new());
        }
        let Some(cmd) = macho::find_load_command(self.data, object::macho::LC_LINKER_OPTION)
            .map_err(|e| self.malformed(e))?
        else {
            return Ok(Vec::new());
        };
        let command: &LinkerOptionCommand = cmd.command().map_err(|e| self.malformed(e))?;
        let count = command.count.get(LittleEndian);

        let mut buf = &cmd.bytes[size_of::<LinkerOptionCommand>()..];
        let mut options = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(len) = memchr(0, buf) else {
                bail!(self.malformed("Unterminated linker option"));
            };
            options.push(String::from_utf8_lossy(&buf[..len]).into_owned());
            buf = &buf[len + 1..];
        }
        Ok(options)
    }

    /// Whether the file participates in Objective-C (or Swift) category
    /// merging, which forces archive members to be loaded.
    pub(crate) fn is_objc_object(&self, db: &SymbolDb<'data>) -> bool {
        for isec in self.sections.iter().flatten() {
            if isec.matches(b"__DATA", b"__objc_catlist") || isec.matches(b"__TEXT", b"__swift") {
                return true;
            }
        }

        for (i, slot) in self.syms.iter().enumerate() {
            let SymbolSlot::Global(id) = *slot else {
                continue;
            };
            let msym = &self.mach_syms[i];
            if !msym.is_undef()
                && msym.is_extern()
                && db.symbol(id).name.bytes().starts_with(b"_OBJC_CLASS_$_")
            {
                return true;
            }
        }
        false
    }

    fn merge_scope(&self, current: Scope, msym: &MachSym) -> Scope {
        // If at least one file defines the symbol as plain extern, it stays
        // exported.
        if current == Scope::Extern {
            return Scope::Extern;
        }
        let is_private = self.is_hidden
            || msym.is_private_extern()
            || (msym.desc() & object::macho::N_WEAK_REF != 0
                && msym.desc() & object::macho::N_WEAK_DEF != 0);
        if is_private {
            Scope::PrivateExtern
        } else {
            Scope::Extern
        }
    }

    pub(crate) fn resolve_symbols(
        &self,
        files: &[ParsedFile<'data>],
        db: &SymbolDb<'data>,
    ) -> Result {
        for (i, slot) in self.syms.iter().enumerate() {
            let SymbolSlot::Global(id) = *slot else {
                continue;
            };
            let msym = &self.mach_syms[i];
            if !msym.is_extern() || msym.is_undef() {
                continue;
            }

            let symbol = db.symbol(id);
            let mut state = symbol.state.lock().unwrap();
            let is_weak = msym.desc() & object::macho::N_WEAK_DEF != 0;

            state.scope = self.merge_scope(state.scope, msym);

            if file_rank(&files[self.file_id.as_usize()], msym.is_common(), is_weak)
                >= symbol_rank(&state, files)
            {
                continue;
            }

            state.file = Some(self.file_id);
            state.is_imported = false;
            state.is_weak = is_weak;

            match msym.sym_type() {
                object::macho::N_UNDF => {
                    debug_assert!(msym.is_common());
                    state.subsec = None;
                    state.value = msym.value();
                    state.is_common = true;
                }
                object::macho::N_ABS => {
                    state.subsec = None;
                    state.value = msym.value();
                    state.is_common = false;
                }
                object::macho::N_SECT => {
                    let subsec = self.sym_to_subsec[i].or_else(|| self.find_subsection(msym.value()));
                    let Some(subsec) = subsec else {
                        bail!(self.malformed(format!(
                            "no subsection covers symbol `{}`",
                            symbol.name
                        )));
                    };
                    state.subsec = Some(subsec);
                    state.value = msym.value() - self.subsections[subsec as usize].input_addr;
                    state.is_common = false;
                }
                _ => {
                    bail!(LinkError::UnknownSymbolType {
                        file: self.input.to_string(),
                        symbol: symbol.name.to_string(),
                        n_type: msym.n_type,
                    });
                }
            }
        }
        Ok(())
    }

    /// Activates the owners of symbols this file needs: files owning a
    /// definition for one of our undefined references, and files that could
    /// upgrade one of our common definitions to a real one. The winner of each
    /// dead-to-alive transition feeds the activated file back to the driver.
    pub(crate) fn mark_live_objects(
        &self,
        files: &[ParsedFile<'data>],
        db: &SymbolDb<'data>,
        feeder: &mut dyn FnMut(FileId),
    ) {
        debug_assert!(self.is_alive.load(Ordering::Relaxed));

        for (i, slot) in self.syms.iter().enumerate() {
            let SymbolSlot::Global(id) = *slot else {
                continue;
            };
            let msym = &self.mach_syms[i];
            if !msym.is_extern() {
                continue;
            }

            let state = db.symbol(id).state.lock().unwrap();
            let Some(owner) = state.file else {
                continue;
            };

            let keep = msym.is_undef() || (msym.is_common() && !state.is_common);
            if keep {
                let owner_file = &files[owner.as_usize()];
                if !owner_file.is_alive().swap(true, Ordering::SeqCst) && !owner_file.is_dylib() {
                    feeder(owner);
                }
            }
        }
    }

    /// Materializes the common symbols this file still owns after resolution
    /// as zerofill storage in a synthetic `__DATA,__common` section.
    pub(crate) fn convert_common_symbols(&mut self, db: &SymbolDb<'data>, herd: &'data Herd) {
        for i in 0..self.mach_syms.len() {
            let SymbolSlot::Global(id) = self.syms[i] else {
                continue;
            };
            let msym = self.mach_syms[i];

            let symbol = db.symbol(id);
            let mut state = symbol.state.lock().unwrap();
            if state.file != Some(self.file_id) || !state.is_common {
                continue;
            }

            let isec = self.get_common_sec(herd);
            let subsec_index = self.subsections.len() as u32;
            self.subsections.push(Subsection {
                isec,
                input_offset: 0,
                input_size: msym.value() as u32,
                input_addr: 0,
                p2align: msym.common_p2align(),
                unwind_offset: 0,
                nunwind: 0,
            });

            state.is_imported = false;
            state.is_weak = false;
            state.subsec = Some(subsec_index);
            state.value = 0;
            state.is_common = false;
        }
    }

    fn get_common_sec(&mut self, herd: &'data Herd) -> u32 {
        if let Some(index) = self.common_sec {
            return index;
        }
        let hdr: &'data SectionHeader = herd.get().alloc(common_section_header());
        let index = self.sections.len() as u32;
        self.sections.push(Some(InputSection::synthetic(hdr)));
        self.common_sec = Some(index);
        index
    }

    /// Reports symbols that this file defines strongly but lost to another
    /// strong definition. Weak and common definitions lose silently.
    pub(crate) fn check_duplicate_symbols(
        &self,
        files: &[ParsedFile<'data>],
        db: &SymbolDb<'data>,
        errors: &SegQueue<Error>,
    ) {
        for (i, slot) in self.syms.iter().enumerate() {
            let SymbolSlot::Global(id) = *slot else {
                continue;
            };
            let msym = &self.mach_syms[i];
            if msym.is_undef() || msym.is_common() || msym.desc() & object::macho::N_WEAK_DEF != 0 {
                continue;
            }

            let symbol = db.symbol(id);
            let state = symbol.state.lock().unwrap();
            if let Some(owner) = state.file
                && owner != self.file_id
            {
                errors.push(
                    LinkError::DuplicateSymbol {
                        name: symbol.name.to_string(),
                        first: files[owner.as_usize()].input().to_string(),
                        second: self.input.to_string(),
                    }
                    .into(),
                );
            }
        }
    }

    /// Releases every symbol this file owns. Called on files that lost the
    /// liveness sweep so that re-resolution sees a clean slate.
    pub(crate) fn clear_symbols(&self, db: &SymbolDb<'data>) {
        for slot in &self.syms {
            let SymbolSlot::Global(id) = *slot else {
                continue;
            };
            let mut state = db.symbol(id).state.lock().unwrap();
            if state.file == Some(self.file_id) {
                *state = Default::default();
            }
        }
    }

    pub(crate) fn malformed(&self, reason: impl ToString) -> Error {
        LinkError::MalformedInput {
            file: self.input.to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

fn common_section_header() -> SectionHeader {
    let e = LittleEndian;
    let mut sectname = [0u8; 16];
    sectname[..8].copy_from_slice(b"__common");
    let mut segname = [0u8; 16];
    segname[..6].copy_from_slice(b"__DATA");
    SectionHeader {
        sectname,
        segname,
        addr: U64::new(e, 0),
        size: U64::new(e, 0),
        offset: U32::new(e, 0),
        align: U32::new(e, 0),
        reloff: U32::new(e, 0),
        nreloc: U32::new(e, 0),
        flags: U32::new(e, object::macho::S_ZEROFILL),
        reserved1: U32::new(e, 0),
        reserved2: U32::new(e, 0),
        reserved3: U32::new(e, 0),
    }
}

impl Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.input, f)
    }
}
