//! Interactive inspector for a store file.
//!
//! ```text
//! snapdb <file>
//! snapdb> printBTrees
//! ```
//!
//! Exits with status 1 when the file is found to be corrupt.

use std::process::exit;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use snapdb::{init_log, inspector, Database, SnapError, StoreConfig};

fn main() {
    init_log();

    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: snapdb <file>");
            exit(2);
        }
    };

    match run(&path) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            exit(if e.is_corruption() { 1 } else { 2 });
        }
    }
}

fn run(path: &str) -> Result<(), SnapError> {
    let mut db = Database::open(path, StoreConfig::default())?;
    let mut editor =
        DefaultEditor::new().map_err(|e| SnapError::BTreeCreation(format!("no terminal: {}", e)))?;

    loop {
        let line = match editor.readline("snapdb> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {}", e);
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());
        let mut words = line.split_whitespace();

        match words.next() {
            None => {}
            Some("printFileSize") => {
                println!("{} bytes", db.file_size());
            }
            Some("printBTrees") => match inspector::check_store(&db) {
                Ok(report) => {
                    println!(
                        "revision {}, {} managed tree(s), {} free page(s), {} orphan(s)",
                        report.revision, report.nb_trees, report.free_pages, report.orphan_pages
                    );
                    for tree in report.trees {
                        println!(
                            "  {:?}: revision {}, {} element(s), depth {}, {} page(s)",
                            tree.name, tree.revision, tree.nb_elems, tree.depth, tree.nb_pages
                        );
                    }
                }
                Err(e) => report_failure(e)?,
            },
            Some("checkBTree") => match words.next() {
                None => println!("usage: checkBTree <name>"),
                Some(name) => match inspector::check_tree(&db, name) {
                    Ok(tree) => println!(
                        "ok: revision {}, {} element(s), depth {}, {} record(s) on {} page(s)",
                        tree.revision, tree.nb_elems, tree.depth, tree.nb_records, tree.nb_pages
                    ),
                    Err(e) => report_failure(e)?,
                },
            },
            Some("dump") => match inspector::dump(&db) {
                Ok(text) => print!("{}", text),
                Err(e) => report_failure(e)?,
            },
            Some("reload") => {
                drop(db);
                db = Database::open(path, StoreConfig::default())?;
                println!("reloaded at revision {}", db.revision());
            }
            Some("quit") => break,
            Some(other) => {
                println!(
                    "unknown command {:?}; commands: printFileSize printBTrees checkBTree dump reload quit",
                    other
                );
            }
        }
    }
    Ok(())
}

/// Corruption aborts the session with a non-zero exit; anything else is
/// reported and the prompt keeps going.
fn report_failure(e: SnapError) -> Result<(), SnapError> {
    if e.is_corruption() {
        Err(e)
    } else {
        eprintln!("error: {}", e);
        Ok(())
    }
}
