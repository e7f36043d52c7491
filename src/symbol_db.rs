//! The process-wide symbol table. Symbols are interned by name into hash
//! buckets so that concurrent parsing only contends on a bucket, not on a
//! global lock. Interning happens while files are being parsed; once parsing
//! finishes the table is frozen and lookups become lock-free. Resolution then
//! serialises updates per symbol via each symbol's own mutex.

use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::input_data::FileId;
use std::fmt::Display;
use std::sync::Mutex;

const SYMBOL_BUCKET_BITS: u32 = 4;
const NUM_BUCKETS: usize = 1 << SYMBOL_BUCKET_BITS;

/// An ID for an interned symbol. Packs the bucket index in the low bits and
/// the slot within the bucket in the high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    fn new(bucket: usize, slot: usize) -> SymbolId {
        let raw = (slot as u64) << SYMBOL_BUCKET_BITS | bucket as u64;
        SymbolId(u32::try_from(raw).expect("Symbols overflowed 32 bits"))
    }

    fn bucket(self) -> usize {
        (self.0 as usize) & (NUM_BUCKETS - 1)
    }

    fn slot(self) -> usize {
        (self.0 as usize) >> SYMBOL_BUCKET_BITS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    bytes: &'data [u8],
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self { bytes }
    }

    pub(crate) fn prehashed(bytes: &'data [u8]) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(Self::new(bytes), hash_bytes(bytes))
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.bytes), f)
    }
}

/// Whether a symbol is visible outside the file that defines it and, if so,
/// whether it will be exported from the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Scope {
    #[default]
    Local,
    PrivateExtern,
    Extern,
}

/// The mutable part of a symbol, reassigned repeatedly during resolution.
/// Guarded by the symbol's mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SymbolValue {
    /// The file currently chosen as this symbol's owner.
    pub(crate) file: Option<FileId>,

    /// Index of the owning subsection within the owner's subsection list.
    pub(crate) subsec: Option<u32>,

    /// Offset within `subsec`, or the absolute/common value when there is no
    /// subsection.
    pub(crate) value: u64,

    pub(crate) scope: Scope,
    pub(crate) is_imported: bool,
    pub(crate) is_weak: bool,
    pub(crate) is_common: bool,
}

#[derive(Debug)]
pub(crate) struct Symbol<'data> {
    pub(crate) name: SymbolName<'data>,

    pub(crate) state: Mutex<SymbolValue>,
}

#[derive(Debug)]
struct SymbolBucket<'data> {
    name_to_id: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    symbols: Vec<Symbol<'data>>,
}

/// The write side of the table, used while input files are being parsed.
pub(crate) struct SymbolIntern<'data> {
    buckets: Vec<Mutex<SymbolBucket<'data>>>,
}

impl<'data> SymbolIntern<'data> {
    pub(crate) fn new() -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(NUM_BUCKETS, || {
            Mutex::new(SymbolBucket {
                name_to_id: Default::default(),
                symbols: Vec::new(),
            })
        });
        Self { buckets }
    }

    /// Returns the canonical symbol for `name`, creating it if this is the
    /// first time the name has been seen.
    pub(crate) fn get_symbol(&self, name: &'data [u8]) -> SymbolId {
        let prehashed = SymbolName::prehashed(name);
        let bucket_index = prehashed.hash() as usize & (NUM_BUCKETS - 1);
        let mut bucket = self.buckets[bucket_index].lock().unwrap();

        if let Some(id) = bucket.name_to_id.get(&prehashed) {
            return *id;
        }

        let id = SymbolId::new(bucket_index, bucket.symbols.len());
        bucket.symbols.push(Symbol {
            name: *prehashed,
            state: Mutex::default(),
        });
        bucket.name_to_id.insert(prehashed, id);
        id
    }

    pub(crate) fn freeze(self) -> SymbolDb<'data> {
        SymbolDb {
            buckets: self
                .buckets
                .into_iter()
                .map(|b| b.into_inner().unwrap())
                .collect(),
        }
    }
}

/// The frozen table. Name lookups no longer take any lock; symbol values stay
/// behind their per-symbol mutex.
#[derive(Debug)]
pub struct SymbolDb<'data> {
    buckets: Vec<SymbolBucket<'data>>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.buckets[id.bucket()].symbols[id.slot()]
    }

    pub(crate) fn get(&self, name: &'data [u8]) -> Option<SymbolId> {
        let prehashed = SymbolName::prehashed(name);
        self.buckets[prehashed.hash() as usize & (NUM_BUCKETS - 1)]
            .name_to_id
            .get(&prehashed)
            .copied()
    }

    pub fn num_symbols(&self) -> usize {
        self.buckets.iter().map(|b| b.symbols.len()).sum()
    }

    pub(crate) fn all_symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol<'data>)> {
        self.buckets.iter().enumerate().flat_map(|(b, bucket)| {
            bucket
                .symbols
                .iter()
                .enumerate()
                .map(move |(slot, sym)| (SymbolId::new(b, slot), sym))
        })
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
