//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because we need to parse
//! arguments the way ld64 does: single-dash long options (`-syslibroot`,
//! `-all_load`), joined short options (`-lfoo`, `-L/opt/lib`) and per-library
//! modifier flags (`-weak-lfoo`) that attach state to the input that follows
//! from them, not to the link as a whole.

use crate::bail;
use crate::error::Result;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct Args {
    /// Directories searched for `-l` libraries, from `-L`.
    pub lib_search_path: Vec<PathBuf>,

    /// Sysroots prepended to absolute install names when opening reexported
    /// libraries, from `-syslibroot`.
    pub syslibroot: Vec<PathBuf>,

    /// Whether dylibs that end up with no referenced symbols should be
    /// dropped.
    pub dead_strip_dylibs: bool,

    /// Load every member of every archive rather than only referenced ones.
    pub all_load: bool,

    pub inputs: Vec<Input>,
}

/// Per-input state accumulated from the flags that preceded the input on the
/// command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// `-weak-l` / `-weak_library`: definitions from this dylib are weak.
    pub weak: bool,

    /// `-hidden-l`: treat the archive's symbols as private extern.
    pub hidden: bool,

    /// `-needed-l` / `-needed_library`: keep the dylib even if unreferenced.
    pub needed: bool,

    /// `-reexport-l` / `-reexport_library`.
    pub reexport: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Input {
    pub spec: InputSpec,
    pub modifiers: Modifiers,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InputSpec {
    /// A path given directly on the command line.
    File(PathBuf),

    /// `-lfoo`: searched as libfoo.tbd, libfoo.dylib then libfoo.a in the
    /// library search path.
    Lib(String),
}

pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
    let mut args = Args::default();
    let mut input = input;

    let next_value = |input: &mut I, flag: &str| -> Result<String> {
        match input.next() {
            Some(v) => Ok(v.as_ref().to_owned()),
            None => bail!("Missing argument to {flag}"),
        }
    };

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        if let Some(rest) = arg.strip_prefix("-L") {
            let dir = if rest.is_empty() {
                next_value(&mut input, "-L")?
            } else {
                rest.to_owned()
            };
            args.lib_search_path.push(PathBuf::from(dir));
        } else if arg == "-syslibroot" {
            args.syslibroot
                .push(PathBuf::from(next_value(&mut input, arg)?));
        } else if arg == "-all_load" {
            args.all_load = true;
        } else if arg == "-noall_load" {
            args.all_load = false;
        } else if arg == "-dead_strip_dylibs" {
            args.dead_strip_dylibs = true;
        } else if let Some(name) = arg.strip_prefix("-weak-l") {
            args.push_lib(name, Modifiers { weak: true, ..Default::default() });
        } else if let Some(name) = arg.strip_prefix("-hidden-l") {
            args.push_lib(name, Modifiers { hidden: true, ..Default::default() });
        } else if let Some(name) = arg.strip_prefix("-needed-l") {
            args.push_lib(name, Modifiers { needed: true, ..Default::default() });
        } else if let Some(name) = arg.strip_prefix("-reexport-l") {
            args.push_lib(name, Modifiers { reexport: true, ..Default::default() });
        } else if arg == "-weak_library" {
            let path = next_value(&mut input, arg)?;
            args.push_file(path, Modifiers { weak: true, ..Default::default() });
        } else if arg == "-needed_library" {
            let path = next_value(&mut input, arg)?;
            args.push_file(path, Modifiers { needed: true, ..Default::default() });
        } else if arg == "-reexport_library" {
            let path = next_value(&mut input, arg)?;
            args.push_file(path, Modifiers { reexport: true, ..Default::default() });
        } else if let Some(name) = arg.strip_prefix("-l") {
            args.push_lib(name, Modifiers::default());
        } else if arg.starts_with('-') {
            bail!("Unrecognized argument `{arg}`");
        } else {
            args.push_file(arg.to_owned(), Modifiers::default());
        }
    }

    Ok(args)
}

impl Args {
    fn push_lib(&mut self, name: &str, modifiers: Modifiers) {
        self.inputs.push(Input {
            spec: InputSpec::Lib(name.to_owned()),
            modifiers,
        });
    }

    fn push_file(&mut self, path: String, modifiers: Modifiers) {
        self.inputs.push(Input {
            spec: InputSpec::File(PathBuf::from(path)),
            modifiers,
        });
    }
}
