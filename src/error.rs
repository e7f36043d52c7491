pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Classified failures surfaced by the ingestion and resolution core. These are
/// carried inside `anyhow::Error` so that call sites can attach file context
/// with `with_context` while the driver can still downcast to decide whether a
/// failure is a parse error or a symbol conflict.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkError {
    /// Truncated load command, offset past the end of the file, impossible
    /// record counts, a `__cstring` without a terminating NUL, and the like.
    MalformedInput { file: String, reason: String },

    /// A `__compact_unwind` relocation with an unexpected shape: pc-relative,
    /// not 8 bytes wide, nonzero type, or pointing at a field we don't
    /// relocate.
    UnsupportedRelocation {
        file: String,
        index: usize,
        reason: String,
    },

    /// A symbol table entry whose `n_type` is none of N_UNDF/N_ABS/N_SECT.
    UnknownSymbolType {
        file: String,
        symbol: String,
        n_type: u8,
    },

    /// A non-extern symbol marked undefined, which has no meaning.
    LocalUndefined { file: String, symbol: String },

    /// A reexported child library could not be located on the search path.
    UnresolvedReexport { install_name: String, path: String },

    /// Two files both define a symbol strongly and non-weakly.
    DuplicateSymbol {
        name: String,
        first: String,
        second: String,
    },

    /// The LTO plugin rejected a bitcode module.
    LtoPluginFailure { file: String, reason: String },
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::MalformedInput { file, reason } => {
                write!(f, "{file}: malformed input: {reason}")
            }
            LinkError::UnsupportedRelocation {
                file,
                index,
                reason,
            } => {
                write!(
                    f,
                    "{file}: __compact_unwind: unsupported relocation {index}: {reason}"
                )
            }
            LinkError::UnknownSymbolType {
                file,
                symbol,
                n_type,
            } => {
                write!(f, "{file}: unknown symbol type for {symbol}: {n_type}")
            }
            LinkError::LocalUndefined { file, symbol } => {
                write!(f, "{file}: local undefined symbol {symbol}")
            }
            LinkError::UnresolvedReexport { install_name, path } => {
                write!(f, "{install_name}: cannot open reexported library {path}")
            }
            LinkError::DuplicateSymbol {
                name,
                first,
                second,
            } => {
                write!(f, "duplicate symbol: {first}: {second}: {name}")
            }
            LinkError::LtoPluginFailure { file, reason } => {
                write!(f, "{file}: {reason}")
            }
        }
    }
}

impl core::error::Error for LinkError {}

/// Prints a warning. By using our own function for this, it'll be easier to
/// find places that issue warnings if we want to say have a flag to suppress
/// them.
#[allow(dead_code)]
pub(crate) fn warning(message: &str) {
    println!("WARNING: tern: {message}");
}
