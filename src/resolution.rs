//! The precedence engine. Every file proposes itself as the owner of each
//! symbol it defines; proposals are compared by rank under the symbol's lock,
//! so any interleaving of files produces the same winners. Undefined
//! references then activate archive members (mark-live) until no file changes
//! state, after which dead files release their claims and live files resolve
//! once more.

use crate::error::Error;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::parsing::ParsedFile;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolValue;
use bumpalo_herd::Herd;
use crossbeam_queue::SegQueue;
use itertools::Itertools as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

// Symbols with lower ranks overwrite symbols with higher ranks. From the
// strongest claim to the weakest:
//
//   1. Strong defined symbol
//   2. Weak defined symbol
//   3. Strong defined symbol in a dylib or unextracted archive member
//   4. Weak defined symbol in a dylib or unextracted archive member
//   5. Common symbol
//   6. Common symbol in an unextracted archive member
//   7. Unclaimed (nonexistent) symbol
//
// Ties are broken by file priority, i.e. command-line order.
pub(crate) fn file_rank(file: &ParsedFile, is_common: bool, is_weak: bool) -> u64 {
    let priority = u64::from(file.priority());
    let is_alive = file.is_alive().load(Ordering::SeqCst);

    if is_common {
        debug_assert!(!file.is_dylib());
        if !is_alive {
            return (6 << 24) + priority;
        }
        return (5 << 24) + priority;
    }

    if file.is_dylib() || !is_alive {
        if is_weak {
            return (4 << 24) + priority;
        }
        return (3 << 24) + priority;
    }

    if is_weak {
        return (2 << 24) + priority;
    }
    (1 << 24) + priority
}

pub(crate) fn symbol_rank(state: &SymbolValue, files: &[ParsedFile]) -> u64 {
    match state.file {
        None => 7 << 24,
        Some(file_id) => file_rank(
            &files[file_id.as_usize()],
            state.is_common,
            state.is_weak,
        ),
    }
}

/// Runs resolution to completion: one pass over every file, the archive
/// liveness fixed point, then a redo so that extracted members compete with
/// their final rank.
#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_and_mark_live<'data>(
    files: &[ParsedFile<'data>],
    db: &SymbolDb<'data>,
) -> Result {
    resolve_symbols(files, db)?;

    mark_live_objects(files, db);

    // Extracting an archive member raises the rank of its definitions, so
    // files that stayed dead release their claims and the survivors resolve
    // again.
    files.par_iter().for_each(|file| {
        if !file.is_alive().load(Ordering::SeqCst) {
            file.clear_symbols(db);
        }
    });
    files.par_iter().try_for_each(|file| {
        if file.is_alive().load(Ordering::SeqCst) {
            file.resolve_symbols(files, db)
        } else {
            Ok(())
        }
    })
}

fn resolve_symbols<'data>(files: &[ParsedFile<'data>], db: &SymbolDb<'data>) -> Result {
    files
        .par_iter()
        .try_for_each(|file| file.resolve_symbols(files, db))
}

/// Walks outward from the files that are already live, activating the owner
/// of every symbol a live file needs. Each activation is a single CAS; the
/// winner spawns a task for the newly live file.
#[tracing::instrument(skip_all, name = "Mark live objects")]
fn mark_live_objects<'data>(files: &[ParsedFile<'data>], db: &SymbolDb<'data>) {
    rayon::in_place_scope(|scope| {
        for file in files {
            if let ParsedFile::Object(obj) = file
                && obj.is_alive.load(Ordering::SeqCst)
            {
                let obj = obj.as_ref();
                scope.spawn(move |scope| mark_one(scope, files, db, obj));
            }
        }
    });
}

fn mark_one<'scope, 'data: 'scope>(
    scope: &rayon::Scope<'scope>,
    files: &'scope [ParsedFile<'data>],
    db: &'scope SymbolDb<'data>,
    obj: &'scope ObjectFile<'data>,
) {
    obj.mark_live_objects(files, db, &mut |activated| {
        if let ParsedFile::Object(next) = &files[activated.as_usize()] {
            let next = next.as_ref();
            scope.spawn(move |scope| mark_one(scope, files, db, next));
        }
    });
}

#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols<'data>(
    files: &mut [ParsedFile<'data>],
    db: &SymbolDb<'data>,
    herd: &'data Herd,
) {
    files.par_iter_mut().for_each(|file| {
        if let ParsedFile::Object(obj) = file
            && obj.is_alive.load(Ordering::SeqCst)
        {
            obj.convert_common_symbols(db, herd);
        }
    });
}

/// Reports every duplicate pair at once rather than stopping at the first.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub(crate) fn check_duplicate_symbols<'data>(
    files: &[ParsedFile<'data>],
    db: &SymbolDb<'data>,
) -> Result {
    let errors = SegQueue::new();
    files.par_iter().for_each(|file| {
        if let ParsedFile::Object(obj) = file
            && obj.is_alive.load(Ordering::SeqCst)
        {
            obj.check_duplicate_symbols(files, db, &errors);
        }
    });

    let mut errors: Vec<Error> = errors.into_iter().collect();
    if errors.is_empty() {
        return Ok(());
    }
    errors.sort_by_key(|e| e.to_string());
    Err(Error::msg(format!(
        "Duplicate symbols detected:\n{}",
        errors.iter().map(|e| e.to_string()).join("\n")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::args::Modifiers;
    use crate::dylib::DylibFile;
    use crate::file_kind::FileKind;
    use crate::input_data::FileId;
    use crate::input_data::InputArena;
    use crate::input_data::InputFile;
    use crate::input_data::InputRef;
    use crate::symbol_db::SymbolIntern;
    use crate::test_file;
    use std::path::PathBuf;

    fn make_object<'data>(
        intern: &SymbolIntern<'data>,
        herd: &'data Herd,
        file: &'data InputFile,
        member: Option<&'data [u8]>,
        priority: u32,
        is_alive: bool,
    ) -> ParsedFile<'data> {
        let input = InputRef { file, member };
        let mut obj = Box::new(ObjectFile::new(
            input,
            file.data(),
            FileKind::MachObject,
            priority,
            is_alive,
            false,
        ));
        obj.parse(intern, herd, None).unwrap();
        ParsedFile::Object(obj)
    }

    fn assign_file_ids(files: &mut [ParsedFile<'_>]) {
        for (i, file) in files.iter_mut().enumerate() {
            file.set_file_id(FileId::from_usize(i));
        }
    }

    fn state_of<'data>(db: &SymbolDb<'data>, name: &'data [u8]) -> SymbolValue {
        *db.symbol(db.get(name).unwrap()).state.lock().unwrap()
    }

    #[test]
    fn test_strong_beats_common() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let common_obj = InputFile::with_bytes(
            PathBuf::from("p1.o"),
            &test_file::obj().common(b"_x", 16, 3).build(),
        );
        let strong_obj = InputFile::with_bytes(
            PathBuf::from("p2.o"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 16])
                .global(b"_x", 1, 0x1000)
                .build(),
        );

        let mut files = vec![
            make_object(&intern, &herd, &common_obj, None, 0, true),
            make_object(&intern, &herd, &strong_obj, None, 1, true),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();
        convert_common_symbols(&mut files, &db, &herd);

        let state = state_of(&db, b"_x");
        assert_eq!(state.file, Some(FileId::from_usize(1)));
        assert!(!state.is_common);
        assert!(state.subsec.is_some());

        // The loser materializes no storage: no synthetic __common section.
        let loser = files[0].as_object().unwrap();
        assert!(loser.subsections.is_empty());
        assert!(loser.sections.is_empty());
    }

    #[test]
    fn test_sole_common_is_materialized() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let common_obj = InputFile::with_bytes(
            PathBuf::from("p1.o"),
            &test_file::obj().common(b"_x", 24, 3).build(),
        );

        let mut files = vec![make_object(&intern, &herd, &common_obj, None, 0, true)];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();
        convert_common_symbols(&mut files, &db, &herd);

        let state = state_of(&db, b"_x");
        assert_eq!(state.file, Some(FileId::from_usize(0)));
        assert!(!state.is_common);
        assert_eq!(state.value, 0);

        let owner = files[0].as_object().unwrap();
        let subsec = &owner.subsections[state.subsec.unwrap() as usize];
        assert_eq!(subsec.input_size, 24);
        assert_eq!(subsec.p2align, 3);
        let isec = owner.sections[subsec.isec as usize].as_ref().unwrap();
        assert!(isec.matches(b"__DATA", b"__common"));
    }

    #[test]
    fn test_object_beats_dylib() {
        let herd = Herd::new();
        let arena = InputArena::new();
        let args = Args::default();
        let intern = SymbolIntern::new();

        let dylib_file = InputFile::with_bytes(
            PathBuf::from("libf.dylib"),
            &test_file::dylib("/usr/lib/libf.dylib").export(b"_f").build(),
        );
        let obj_file = InputFile::with_bytes(
            PathBuf::from("main.o"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .global(b"_f", 1, 0x1000)
                .build(),
        );

        let dylib = DylibFile::create(
            &args,
            &arena,
            &herd,
            &test_file::NoStubs,
            &intern,
            InputRef::whole_file(&dylib_file),
            FileKind::Dylib,
            5,
            Modifiers::default(),
        )
        .unwrap();

        let mut files = vec![
            ParsedFile::Dylib(Box::new(dylib)),
            make_object(&intern, &herd, &obj_file, None, 1, true),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        assert_eq!(file_rank(&files[1], false, false), (1 << 24) + 1);
        assert_eq!(file_rank(&files[0], false, false), (3 << 24) + 5);

        resolve_and_mark_live(&files, &db).unwrap();

        let state = state_of(&db, b"_f");
        assert_eq!(state.file, Some(FileId::from_usize(1)));
        assert!(!state.is_imported);
    }

    #[test]
    fn test_dylib_import() {
        let herd = Herd::new();
        let arena = InputArena::new();
        let args = Args::default();
        let intern = SymbolIntern::new();

        let dylib_file = InputFile::with_bytes(
            PathBuf::from("libw.dylib"),
            &test_file::dylib("/usr/lib/libw.dylib")
                .export(b"_strong")
                .weak_export(b"_weak")
                .build(),
        );
        let obj_file = InputFile::with_bytes(
            PathBuf::from("main.o"),
            &test_file::obj()
                .undefined(b"_strong")
                .undefined(b"_weak")
                .build(),
        );

        let dylib = DylibFile::create(
            &args,
            &arena,
            &herd,
            &test_file::NoStubs,
            &intern,
            InputRef::whole_file(&dylib_file),
            FileKind::Dylib,
            1,
            Modifiers::default(),
        )
        .unwrap();

        let mut files = vec![
            make_object(&intern, &herd, &obj_file, None, 0, true),
            ParsedFile::Dylib(Box::new(dylib)),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();

        let strong = state_of(&db, b"_strong");
        assert_eq!(strong.file, Some(FileId::from_usize(1)));
        assert!(strong.is_imported);
        assert!(!strong.is_weak);

        let weak = state_of(&db, b"_weak");
        assert!(weak.is_imported);
        assert!(weak.is_weak);
    }

    #[test]
    fn test_archive_activation() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let main_obj = InputFile::with_bytes(
            PathBuf::from("main.o"),
            &test_file::obj().undefined(b"_foo").build(),
        );
        let archive_file = InputFile::with_bytes(
            PathBuf::from("libA.a"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .global(b"_foo", 1, 0x1000)
                .build(),
        );

        let mut files = vec![
            make_object(&intern, &herd, &main_obj, None, 0, true),
            make_object(&intern, &herd, &archive_file, Some(b"m.o"), 2, false),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        assert!(!files[1].is_alive().load(Ordering::SeqCst));

        resolve_and_mark_live(&files, &db).unwrap();

        assert!(files[1].is_alive().load(Ordering::SeqCst));
        let state = state_of(&db, b"_foo");
        assert_eq!(state.file, Some(FileId::from_usize(1)));
        // The redo pass re-resolved the member at its live rank.
        assert_eq!(symbol_rank(&state, &files), (1 << 24) + 2);
    }

    #[test]
    fn test_unreferenced_member_stays_dead() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let main_obj = InputFile::with_bytes(
            PathBuf::from("main.o"),
            &test_file::obj().build(),
        );
        let member = InputFile::with_bytes(
            PathBuf::from("libA.a"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .global(b"_unused", 1, 0x1000)
                .build(),
        );

        let mut files = vec![
            make_object(&intern, &herd, &main_obj, None, 0, true),
            make_object(&intern, &herd, &member, Some(b"m.o"), 2, false),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();

        assert!(!files[1].is_alive().load(Ordering::SeqCst));
        // A dead file owns nothing after the sweep.
        let state = state_of(&db, b"_unused");
        assert_eq!(state.file, None);
    }

    #[test]
    fn test_common_upgraded_by_archive_member() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let common_obj = InputFile::with_bytes(
            PathBuf::from("main.o"),
            &test_file::obj().common(b"_c", 8, 2).build(),
        );
        let member = InputFile::with_bytes(
            PathBuf::from("libA.a"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .global(b"_c", 1, 0x1000)
                .build(),
        );

        let mut files = vec![
            make_object(&intern, &herd, &common_obj, None, 0, true),
            make_object(&intern, &herd, &member, Some(b"c.o"), 1, false),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();

        // A common definition is a request for a real one: the member gets
        // extracted and its strong definition wins.
        assert!(files[1].is_alive().load(Ordering::SeqCst));
        let state = state_of(&db, b"_c");
        assert_eq!(state.file, Some(FileId::from_usize(1)));
        assert!(!state.is_common);
    }

    #[test]
    fn test_duplicate_symbols_reported() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let build = || {
            test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .global(b"_g", 1, 0x1000)
                .build()
        };
        let a = InputFile::with_bytes(PathBuf::from("a.o"), &build());
        let b = InputFile::with_bytes(PathBuf::from("b.o"), &build());

        let mut files = vec![
            make_object(&intern, &herd, &a, None, 0, true),
            make_object(&intern, &herd, &b, None, 1, true),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        resolve_and_mark_live(&files, &db).unwrap();

        // Priority breaks the tie between the two strong definitions.
        let state = state_of(&db, b"_g");
        assert_eq!(state.file, Some(FileId::from_usize(0)));

        let err = check_duplicate_symbols(&files, &db).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("duplicate symbol"));
        assert!(message.contains("_g"));
        assert!(message.contains("a.o"));
        assert!(message.contains("b.o"));
    }

    #[test]
    fn test_weak_loses_to_strong_regardless_of_order() {
        let herd = Herd::new();
        let intern = SymbolIntern::new();

        let weak = InputFile::with_bytes(
            PathBuf::from("weak.o"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x1000, &[0; 8])
                .sym(
                    b"_w",
                    object::macho::N_SECT | object::macho::N_EXT,
                    1,
                    object::macho::N_WEAK_DEF,
                    0x1000,
                )
                .build(),
        );
        let strong = InputFile::with_bytes(
            PathBuf::from("strong.o"),
            &test_file::obj()
                .section(b"__TEXT", b"__text", 0x2000, &[0; 8])
                .global(b"_w", 1, 0x2000)
                .build(),
        );

        let mut files = vec![
            make_object(&intern, &herd, &weak, None, 0, true),
            make_object(&intern, &herd, &strong, None, 1, true),
        ];
        assign_file_ids(&mut files);
        let db = intern.freeze();

        // Resolve serially in both orders; the outcome must be identical.
        let mut snapshots = Vec::new();
        for order in [[0usize, 1], [1, 0]] {
            for (_, symbol) in db.all_symbols() {
                *symbol.state.lock().unwrap() = Default::default();
            }
            for &i in &order {
                files[i].resolve_symbols(&files, &db).unwrap();
            }
            snapshots.push(state_of(&db, b"_w"));
        }

        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[0].file, Some(FileId::from_usize(1)));
        assert!(!snapshots[0].is_weak);
    }
}
