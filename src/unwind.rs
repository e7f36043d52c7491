//! Attaches `__LD,__compact_unwind` records to the subsections whose code they
//! describe. The section contains fixed-size entries whose pointer fields are
//! filled in via ordinary section relocations; we resolve those relocations
//! here, at parse time, because the encoded targets are meaningless once
//! subsections move.

use crate::bail;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::macho;
use crate::macho::CompactUnwindEntry;
use crate::macho::MachReloc;
use crate::object_file::ObjectFile;
use crate::object_file::SymbolSlot;
use crate::symbol_db::SymbolId;
use object::LittleEndian;
use std::mem::offset_of;

/// One unwind entry, re-pointed at the subsection that contains its code
/// range. `offset`/`lsda_offset` are relative to the owning subsection's
/// start.
#[derive(Debug, Clone)]
pub(crate) struct UnwindRecord {
    pub(crate) subsec: Option<u32>,
    pub(crate) offset: u32,
    pub(crate) code_len: u32,
    pub(crate) encoding: u32,
    pub(crate) personality: Option<SymbolId>,
    pub(crate) lsda: Option<u32>,
    pub(crate) lsda_offset: u32,
}

const ENTRY_SIZE: usize = size_of::<CompactUnwindEntry>();
const CODE_START: usize = offset_of!(CompactUnwindEntry, code_start);
const PERSONALITY: usize = offset_of!(CompactUnwindEntry, personality);
const LSDA: usize = offset_of!(CompactUnwindEntry, lsda);

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse_compact_unwind(&mut self) -> Result {
        let hdr = self.unwind_sec.expect("only called when the section exists");
        let e = LittleEndian;

        let size = hdr.size.get(e);
        if size % ENTRY_SIZE as u64 != 0 {
            bail!(self.malformed("invalid __compact_unwind section size"));
        }
        let num_entries = (size / ENTRY_SIZE as u64) as usize;

        let contents = macho::file_range(self.data, u64::from(hdr.offset.get(e)), size)
            .map_err(|err| self.malformed(err))?;
        let entries: &[CompactUnwindEntry] =
            macho::slice_of(contents, num_entries).map_err(|err| self.malformed(err))?;

        let mut records: Vec<UnwindRecord> = entries
            .iter()
            .map(|src| UnwindRecord {
                subsec: None,
                offset: 0,
                code_len: src.code_len.get(e),
                encoding: src.encoding.get(e),
                personality: None,
                lsda: None,
                lsda_offset: 0,
            })
            .collect();

        let nreloc = hdr.nreloc.get(e) as usize;
        let reloc_bytes = macho::file_range(
            self.data,
            u64::from(hdr.reloff.get(e)),
            (nreloc * size_of::<MachReloc>()) as u64,
        )
        .map_err(|err| self.malformed(err))?;
        let relocs: &[MachReloc] =
            macho::slice_of(reloc_bytes, nreloc).map_err(|err| self.malformed(err))?;

        for (i, r) in relocs.iter().enumerate() {
            let info = r.info(e);
            if u64::from(info.r_address) >= size {
                bail!(self.malformed(format!("relocation offset too large: {i}")));
            }
            let idx = info.r_address as usize / ENTRY_SIZE;

            let unsupported = |reason: &str| -> Error {
                LinkError::UnsupportedRelocation {
                    file: self.input.to_string(),
                    index: i,
                    reason: reason.to_string(),
                }
                .into()
            };

            if info.r_pcrel || info.r_length != 3 || info.r_type != self.arch.unsigned_reloc_type()
            {
                bail!(unsupported("pc-relative, wrong size or wrong type"));
            }

            match info.r_address as usize % ENTRY_SIZE {
                CODE_START => {
                    if info.r_extern {
                        bail!(unsupported("extern relocation against code_start"));
                    }
                    let addr = entries[idx].code_start.get(e);
                    let Some(target) = self.find_subsection(addr) else {
                        bail!(unsupported("code_start points outside any subsection"));
                    };
                    records[idx].subsec = Some(target);
                    records[idx].offset =
                        (addr - self.subsections[target as usize].input_addr) as u32;
                }
                PERSONALITY => {
                    if info.r_extern {
                        let Some(SymbolSlot::Global(id)) =
                            self.syms.get(info.r_symbolnum as usize).copied()
                        else {
                            bail!(unsupported("personality symbol index out of range"));
                        };
                        records[idx].personality = Some(id);
                    } else {
                        let addr = read_u32(contents, info.r_address as usize)
                            .map_err(|err| self.malformed(err))?;
                        let Some(id) = self.find_symbol(u64::from(addr)) else {
                            bail!(unsupported("local personality reference"));
                        };
                        records[idx].personality = Some(id);
                    }
                }
                LSDA => {
                    if info.r_extern {
                        bail!(unsupported("extern relocation against lsda"));
                    }
                    let addr = u64::from(
                        read_u32(contents, info.r_address as usize)
                            .map_err(|err| self.malformed(err))?,
                    );
                    let Some(target) = self.find_subsection(addr) else {
                        bail!(unsupported("lsda points outside any subsection"));
                    };
                    records[idx].lsda = Some(target);
                    records[idx].lsda_offset =
                        (addr - self.subsections[target as usize].input_addr) as u32;
                }
                _ => bail!(unsupported("relocation against unexpected field")),
            }
        }

        for (i, record) in records.iter().enumerate() {
            if record.subsec.is_none() {
                bail!(self.malformed(format!("__compact_unwind: missing relocation at {i}")));
            }
        }

        records.sort_by_key(|r| {
            (
                self.subsections[r.subsec.unwrap() as usize].input_addr,
                r.offset,
            )
        });

        // Install each maximal run of records sharing a subsection.
        let mut i = 0;
        while i < records.len() {
            let subsec = records[i].subsec;
            let mut j = i + 1;
            while j < records.len() && records[j].subsec == subsec {
                j += 1;
            }
            let s = &mut self.subsections[subsec.unwrap() as usize];
            s.unwind_offset = i as u32;
            s.nunwind = (j - i) as u32;
            i = j;
        }

        self.unwind_records = records;
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let Some(bytes) = data.get(offset..offset + 4) else {
        bail!("literal addend at {offset:#x} out of range");
    };
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}
