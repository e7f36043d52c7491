//! Splits input sections into subsections, the units at which the linker
//! relocates and dead-strips. An object built with "subsections via symbols"
//! is cut at every symbol that points into a section; older objects get one
//! subsection per section. `__TEXT,__cstring` is special either way: it's cut
//! at NUL terminators so that identical strings can later be merged.

use crate::bail;
use crate::error::LinkError;
use crate::error::Result;
use crate::input_data::InputRef;
use crate::macho;
use crate::macho::MachReloc;
use crate::macho::MachSym;
use crate::macho::MachSymExt as _;
use crate::macho::SectionHeader;
use memchr::memchr;
use object::LittleEndian;

/// A parsed input section. Holds non-owning views of the section's bytes and
/// relocation entries.
#[derive(Debug)]
pub(crate) struct InputSection<'data> {
    pub(crate) hdr: &'data SectionHeader,
    pub(crate) contents: &'data [u8],
    pub(crate) relocs: &'data [MachReloc],
}

impl<'data> InputSection<'data> {
    pub(crate) fn parse(data: &'data [u8], hdr: &'data SectionHeader) -> Result<InputSection<'data>> {
        let e = LittleEndian;
        let contents = if macho::is_zerofill(hdr) {
            &[]
        } else {
            macho::file_range(data, u64::from(hdr.offset.get(e)), hdr.size.get(e))?
        };
        let nreloc = hdr.nreloc.get(e) as usize;
        let reloc_bytes = macho::file_range(
            data,
            u64::from(hdr.reloff.get(e)),
            nreloc as u64 * size_of::<MachReloc>() as u64,
        )?;
        Ok(InputSection {
            hdr,
            contents,
            relocs: macho::slice_of(reloc_bytes, nreloc)?,
        })
    }

    /// A section we created ourselves, e.g. `__DATA,__common`. There are no
    /// bytes behind it.
    pub(crate) fn synthetic(hdr: &'data SectionHeader) -> InputSection<'data> {
        InputSection {
            hdr,
            contents: &[],
            relocs: &[],
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self.hdr.addr.get(LittleEndian)
    }

    pub(crate) fn size(&self) -> u64 {
        self.hdr.size.get(LittleEndian)
    }

    pub(crate) fn p2align(&self) -> u8 {
        self.hdr.align.get(LittleEndian) as u8
    }

    pub(crate) fn matches(&self, segname: &[u8], sectname: &[u8]) -> bool {
        macho::section_matches(self.hdr, segname, sectname)
    }

    pub(crate) fn is_cstring(&self) -> bool {
        self.matches(b"__TEXT", b"__cstring")
    }

    pub(crate) fn display_name(&self) -> String {
        format!(
            "{},{}",
            String::from_utf8_lossy(macho::fixed_name(&self.hdr.segname)),
            String::from_utf8_lossy(macho::fixed_name(&self.hdr.sectname)),
        )
    }
}

/// A contiguous byte range inside one input section, relocated as a unit.
/// `unwind_offset`/`nunwind` delimit this subsection's run of unwind records
/// once `parse_compact_unwind` has attached them.
#[derive(Debug, Clone)]
pub(crate) struct Subsection {
    /// Index of the owning section in the file's section list.
    pub(crate) isec: u32,

    pub(crate) input_offset: u32,
    pub(crate) input_size: u32,
    pub(crate) input_addr: u64,
    pub(crate) p2align: u8,
    pub(crate) unwind_offset: u32,
    pub(crate) nunwind: u32,
}

impl Subsection {
    fn new(isec: u32, input_offset: u32, input_size: u32, input_addr: u64, p2align: u8) -> Self {
        Subsection {
            isec,
            input_offset,
            input_size,
            input_addr,
            p2align,
            unwind_offset: 0,
            nunwind: 0,
        }
    }
}

/// The subsections carved out of one object, plus the mapping from symbol
/// table index to owning subsection.
#[derive(Debug)]
pub(crate) struct SplitOutput {
    pub(crate) subsections: Vec<Subsection>,
    pub(crate) sym_to_subsec: Vec<Option<u32>>,
}

const NO_SYMBOL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct SplitRegion {
    offset: u32,
    size: u32,
    symidx: u32,
    is_alt_entry: bool,
}

struct SplitInfo {
    isec_index: u32,
    regions: Vec<SplitRegion>,
}

/// Symbol-directed splitting: each symbol of type N_SECT starts a region, and
/// regions are closed so that together they cover the whole section.
pub(crate) fn split_via_symbols<'data>(
    input: InputRef<'_>,
    sections: &[Option<InputSection<'data>>],
    mach_syms: &[MachSym],
) -> Result<SplitOutput> {
    let mut out = SplitOutput {
        subsections: Vec::new(),
        sym_to_subsec: vec![None; mach_syms.len()],
    };

    let mut split_infos = Vec::new();
    let mut section_to_info = vec![None; sections.len()];
    for (i, isec) in sections.iter().enumerate() {
        if let Some(isec) = isec
            && !isec.is_cstring()
        {
            if isec.size() > u64::from(u32::MAX) {
                bail!(malformed(input, format!("section {} too large", isec.display_name())));
            }
            section_to_info[i] = Some(split_infos.len());
            split_infos.push(SplitInfo {
                isec_index: i as u32,
                regions: Vec::new(),
            });
        }
    }

    for (i, msym) in mach_syms.iter().enumerate() {
        if msym.sym_type() != object::macho::N_SECT {
            continue;
        }
        let Some(&Some(info_index)) = section_to_info.get(msym.section().wrapping_sub(1)) else {
            continue;
        };
        let info = &mut split_infos[info_index];
        let isec = sections[info.isec_index as usize].as_ref().unwrap();
        if msym.value() < isec.addr() || msym.value() > isec.addr() + isec.size() {
            bail!(malformed(
                input,
                format!("symbol {i} address {:#x} outside its section", msym.value()),
            ));
        }
        info.regions.push(SplitRegion {
            offset: (msym.value() - isec.addr()) as u32,
            size: 0,
            symidx: i as u32,
            is_alt_entry: msym.desc() & object::macho::N_ALT_ENTRY != 0,
        });
    }

    split_infos.sort_by_key(|info| sections[info.isec_index as usize].as_ref().unwrap().addr());

    for info in &mut split_infos {
        let isec = sections[info.isec_index as usize].as_ref().unwrap();
        close_regions(&mut info.regions, isec.size() as u32);

        for r in &info.regions {
            if !r.is_alt_entry {
                out.subsections.push(Subsection::new(
                    info.isec_index,
                    r.offset,
                    r.size,
                    isec.addr() + u64::from(r.offset),
                    isec.p2align(),
                ));
            }
            // Alt entries attach to the subsection created for the region they
            // collide with.
            if r.symidx != NO_SYMBOL
                && let Some(last) = out.subsections.len().checked_sub(1)
            {
                out.sym_to_subsec[r.symidx as usize] = Some(last as u32);
            }
        }
    }

    for (i, isec) in sections.iter().enumerate() {
        if let Some(isec) = isec
            && isec.is_cstring()
        {
            split_cstrings(input, i as u32, isec, &mut out.subsections)?;
        }
    }

    Ok(out)
}

/// Fixes regions so that they cover the entire section without overlapping.
/// Alt-entry regions keep zero size.
fn close_regions(regions: &mut Vec<SplitRegion>, section_size: u32) {
    if regions.is_empty() {
        regions.push(SplitRegion {
            offset: 0,
            size: section_size,
            symidx: NO_SYMBOL,
            is_alt_entry: false,
        });
        return;
    }

    regions.sort_by_key(|r| r.offset);

    if regions[0].offset > 0 {
        regions.insert(
            0,
            SplitRegion {
                offset: 0,
                size: regions[0].offset,
                symidx: NO_SYMBOL,
                is_alt_entry: false,
            },
        );
    }

    // Promote the second region of each colliding pair to an alt entry. The
    // extra increment is deliberate: the region following a promoted pair is
    // not compared against the promoted member.
    let mut i = 1;
    while i < regions.len() {
        if regions[i - 1].offset == regions[i].offset {
            regions[i].is_alt_entry = true;
            i += 1;
        }
        i += 1;
    }

    let mut last: Option<usize> = None;
    for i in 0..regions.len() {
        if !regions[i].is_alt_entry {
            if let Some(last) = last {
                regions[last].size = regions[i].offset - regions[last].offset;
            }
            last = Some(i);
        }
    }
    if let Some(last) = last {
        regions[last].size = section_size - regions[last].offset;
    }
}

/// Section-directed splitting: one subsection per non-empty section, except
/// `__cstring` which is still cut at string boundaries.
pub(crate) fn split_by_section<'data>(
    input: InputRef<'_>,
    sections: &[Option<InputSection<'data>>],
    mach_syms: &[MachSym],
) -> Result<SplitOutput> {
    let mut out = SplitOutput {
        subsections: Vec::new(),
        sym_to_subsec: vec![None; mach_syms.len()],
    };

    let mut primary = vec![None; sections.len()];
    for (i, isec) in sections.iter().enumerate() {
        let Some(isec) = isec else {
            continue;
        };
        if isec.is_cstring() {
            split_cstrings(input, i as u32, isec, &mut out.subsections)?;
        } else if isec.size() > 0 {
            if isec.size() > u64::from(u32::MAX) {
                bail!(malformed(input, format!("section {} too large", isec.display_name())));
            }
            primary[i] = Some(out.subsections.len() as u32);
            out.subsections.push(Subsection::new(
                i as u32,
                0,
                isec.size() as u32,
                isec.addr(),
                isec.p2align(),
            ));
        }
    }

    for (i, msym) in mach_syms.iter().enumerate() {
        if msym.sym_type() == object::macho::N_SECT {
            out.sym_to_subsec[i] = primary
                .get(msym.section().wrapping_sub(1))
                .copied()
                .flatten();
        }
    }

    Ok(out)
}

/// Cuts `__TEXT,__cstring` at NUL terminators. A run of NULs belongs to the
/// string it terminates. Constant strings carry no alignment of their own, so
/// each piece gets the best alignment its starting offset happens to
/// guarantee.
fn split_cstrings(
    input: InputRef<'_>,
    isec_index: u32,
    isec: &InputSection,
    subsections: &mut Vec<Subsection>,
) -> Result {
    let bytes = isec.contents;
    let mut pos: usize = 0;

    while pos < bytes.len() {
        let Some(nul) = memchr(0, &bytes[pos..]) else {
            bail!(malformed(input, "corrupted __TEXT,__cstring".to_string()));
        };
        let mut end = pos + nul;
        while end < bytes.len() && bytes[end] == 0 {
            end += 1;
        }

        let p2align = isec.p2align().min(pos.trailing_zeros() as u8);
        subsections.push(Subsection::new(
            isec_index,
            pos as u32,
            (end - pos) as u32,
            isec.addr() + pos as u64,
            p2align,
        ));
        pos = end;
    }

    Ok(())
}

impl SplitOutput {
    /// Sorts subsections by input address and rewrites `sym_to_subsec` to
    /// match the new order.
    pub(crate) fn sort_by_address(&mut self) {
        let mut order: Vec<u32> = (0..self.subsections.len() as u32).collect();
        order.sort_by_key(|&i| self.subsections[i as usize].input_addr);

        let mut remap = vec![0u32; order.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old as usize] = new as u32;
        }

        self.subsections = order
            .iter()
            .map(|&old| self.subsections[old as usize].clone())
            .collect();

        for slot in self.sym_to_subsec.iter_mut().flatten() {
            *slot = remap[*slot as usize];
        }
    }
}

/// Returns the index of the last subsection whose start address is <= `addr`.
/// Requires the subsections to be sorted by `input_addr`.
pub(crate) fn find_subsection(subsections: &[Subsection], addr: u64) -> Option<u32> {
    let idx = subsections.partition_point(|s| s.input_addr <= addr);
    idx.checked_sub(1).map(|i| i as u32)
}

fn malformed(input: InputRef<'_>, reason: String) -> LinkError {
    LinkError::MalformedInput {
        file: input.to_string(),
        reason,
    }
}
