//! The LTO plugin boundary. Bitcode inputs can't be parsed by us; the plugin
//! surfaces their symbols, and we synthesize nlist-shaped records from the
//! attributes so that the resolver treats a bitcode module exactly like a real
//! object.

use crate::bail;
use crate::error::LinkError;
use crate::error::Result;
use crate::macho::MachSym;
use crate::object_file::ObjectFile;
use crate::object_file::SymbolSlot;
use crate::symbol_db::SymbolIntern;
use bumpalo_herd::Herd;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64Bytes;
use std::borrow::Cow;

// Attribute encoding from llvm-c/lto.h.
pub const LTO_SYMBOL_ALIGNMENT_MASK: u32 = 0x0000_001f;
pub const LTO_SYMBOL_DEFINITION_MASK: u32 = 0x0000_0700;
pub const LTO_SYMBOL_DEFINITION_REGULAR: u32 = 0x0000_0100;
pub const LTO_SYMBOL_DEFINITION_TENTATIVE: u32 = 0x0000_0200;
pub const LTO_SYMBOL_DEFINITION_WEAK: u32 = 0x0000_0300;
pub const LTO_SYMBOL_DEFINITION_UNDEFINED: u32 = 0x0000_0400;
pub const LTO_SYMBOL_DEFINITION_WEAKUNDEF: u32 = 0x0000_0500;
pub const LTO_SYMBOL_SCOPE_MASK: u32 = 0x0000_3800;
pub const LTO_SYMBOL_SCOPE_INTERNAL: u32 = 0x0000_0800;
pub const LTO_SYMBOL_SCOPE_HIDDEN: u32 = 0x0000_1000;
pub const LTO_SYMBOL_SCOPE_DEFAULT: u32 = 0x0000_1800;
pub const LTO_SYMBOL_SCOPE_PROTECTED: u32 = 0x0000_2000;
pub const LTO_SYMBOL_SCOPE_DEFAULT_CAN_BE_HIDDEN: u32 = 0x0000_2800;

/// The libLTO shim supplied by the driver.
pub trait LtoPlugin: Sync {
    fn module_create_from_memory(
        &self,
        data: &[u8],
    ) -> Result<Box<dyn LtoModule + Send + Sync + '_>>;
}

/// A loaded bitcode module.
pub trait LtoModule: Send + Sync {
    fn num_symbols(&self) -> usize;
    fn symbol_name(&self, index: usize) -> &[u8];
    fn symbol_attribute(&self, index: usize) -> u32;
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse_lto_symbols(
        &mut self,
        intern: &SymbolIntern<'data>,
        herd: &'data Herd,
        plugin: Option<&'data (dyn LtoPlugin + 'data)>,
    ) -> Result {
        let plugin_failure = |reason: String| LinkError::LtoPluginFailure {
            file: self.input.to_string(),
            reason,
        };

        let Some(plugin) = plugin else {
            bail!(plugin_failure("no LTO plugin is configured".to_string()));
        };

        let module = plugin
            .module_create_from_memory(self.data)
            .map_err(|e| plugin_failure(format!("module_create_from_memory failed: {e}")))?;

        let nsyms = module.num_symbols();
        let mut mach_syms = Vec::with_capacity(nsyms);
        self.syms.reserve(nsyms);

        let e = LittleEndian;
        for i in 0..nsyms {
            let name: &'data [u8] = herd.get().alloc_slice_copy(module.symbol_name(i));
            self.syms.push(SymbolSlot::Global(intern.get_symbol(name)));

            let attr = module.symbol_attribute(i);

            let mut n_type: u8 = match attr & LTO_SYMBOL_DEFINITION_MASK {
                LTO_SYMBOL_DEFINITION_REGULAR
                | LTO_SYMBOL_DEFINITION_TENTATIVE
                | LTO_SYMBOL_DEFINITION_WEAK => object::macho::N_ABS,
                LTO_SYMBOL_DEFINITION_UNDEFINED | LTO_SYMBOL_DEFINITION_WEAKUNDEF => {
                    object::macho::N_UNDF
                }
                other => {
                    bail!(plugin_failure(format!("unknown symbol definition {other:#x}")));
                }
            };

            match attr & LTO_SYMBOL_SCOPE_MASK {
                0 | LTO_SYMBOL_SCOPE_INTERNAL | LTO_SYMBOL_SCOPE_HIDDEN => {}
                LTO_SYMBOL_SCOPE_DEFAULT
                | LTO_SYMBOL_SCOPE_PROTECTED
                | LTO_SYMBOL_SCOPE_DEFAULT_CAN_BE_HIDDEN => n_type |= object::macho::N_EXT,
                other => {
                    bail!(plugin_failure(format!("unknown symbol scope {other:#x}")));
                }
            }

            // The requested alignment goes where a common symbol's alignment
            // lives in n_desc.
            let p2align = (attr & LTO_SYMBOL_ALIGNMENT_MASK) as u16;

            mach_syms.push(MachSym {
                n_strx: U32::new(e, 0),
                n_type,
                n_sect: 0,
                n_desc: U16::new(e, p2align << 8),
                n_value: U64Bytes::new(e, 0),
            });
        }

        self.mach_syms = Cow::Owned(mach_syms);
        self.lto_module = Some(module);
        Ok(())
    }
}
