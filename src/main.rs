//! Interactive driver: CLI argument parsing, the menu/REPL loop, and
//! file dumps. Everything here is a thin collaborator around the core
//! `btree_store` library — see spec §6's external-interfaces contract.

mod generate;

use std::io::{self, BufRead, Write};
use std::path::Path;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use btree_store::{BTree, BTreeError, BTreeResult, OperationReport};

#[derive(Parser)]
#[command(name = "btree_store", version, about = "Disk-resident B-tree index engine.")]
struct Cli {
    /// Tree order `d`: every non-root page holds between `d` and `2d` records.
    #[arg(long, short = 'd', default_value_t = 2)]
    order: usize,

    /// Path to the binary index file.
    #[arg(long, default_value = "data/index.txt")]
    index_file: String,

    /// Path to the binary data (heap) file.
    #[arg(long, default_value = "data/data.txt")]
    data_file: String,

    /// Reopen existing files instead of truncating them.
    #[arg(long)]
    resume: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(parent) = Path::new(&cli.index_file).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let tree = if cli.resume {
        BTree::open(cli.order, &cli.index_file, &cli.data_file)
    } else {
        BTree::new(cli.order, &cli.index_file, &cli.data_file)
    };

    let mut tree = match tree {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("failed to open B-tree files: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = main_loop(&mut tree) {
        eprintln!("fatal I/O error: {}", e);
        std::process::exit(1);
    }
}

fn main_loop(tree: &mut BTree) -> BTreeResult<()> {
    let stdin = io::stdin();
    loop {
        print_menu();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim().to_lowercase().as_str() {
            "1" => command_insert(tree)?,
            "2" => report_outcome(tree.print(false)),
            "3" => report_outcome(tree.print(true)),
            "4" => command_search(tree)?,
            "5" => command_remove(tree)?,
            "6" => command_update(tree)?,
            "7" => match tree.dump_index_file() {
                Ok(dump) => println!("{}", dump),
                Err(e) => eprintln!("{}", e),
            },
            "8" => match tree.dump_data_file() {
                Ok(dump) => println!("{}", dump),
                Err(e) => eprintln!("{}", e),
            },
            "q" => break,
            _ => {}
        }
    }
    Ok(())
}

fn print_menu() {
    println!("==========================");
    println!("\t\tMenu:");
    println!("\t[1] Insert");
    println!("\t[2] Print");
    println!("\t[3] Print records");
    println!("\t[4] Search");
    println!("\t[5] Remove");
    println!("\t[6] Update");
    println!("\t[7] Print index file");
    println!("\t[8] Print data file");
    println!("\t[Q] Quit");
    println!();
}

fn prompt_int(prompt: &str) -> io::Result<Option<i32>> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().parse::<i32>().ok())
}

fn command_insert(tree: &mut BTree) -> BTreeResult<()> {
    println!("Inserting");
    let Some(key) = prompt_int("Enter key: ")? else { return Ok(()) };
    let record = generate::random_record(key);
    report_outcome(tree.insert(record).map(|r| (String::new(), r)));
    Ok(())
}

fn command_search(tree: &mut BTree) -> BTreeResult<()> {
    println!("Searching");
    let Some(key) = prompt_int("Enter key: ")? else { return Ok(()) };
    match tree.search(key) {
        Ok((found, report)) => {
            println!("{}", if found { "Key found!" } else { "Key not found!" });
            info!(%report, "search completed");
        }
        Err(e) => eprintln!("{}", e),
    }
    Ok(())
}

fn command_remove(tree: &mut BTree) -> BTreeResult<()> {
    println!("Removing");
    let Some(key) = prompt_int("Enter key: ")? else { return Ok(()) };
    report_outcome(tree.remove(key).map(|r| (String::new(), r)));
    Ok(())
}

fn command_update(tree: &mut BTree) -> BTreeResult<()> {
    println!("Updating");
    let Some(old_key) = prompt_int("Enter key: ")? else { return Ok(()) };
    let Some(new_key) = prompt_int("Enter new key: ")? else { return Ok(()) };
    let record = generate::random_record(new_key);
    report_outcome(tree.update(old_key, record).map(|r| (String::new(), r)));
    Ok(())
}

/// Print any accompanying text (e.g. a traversal dump) and log the
/// telemetry every public operation reports; a rejected operation
/// (`DuplicateKey`/`KeyNotFound`/`EmptyTree`) is surfaced as its
/// user-facing message instead.
fn report_outcome(result: BTreeResult<(String, OperationReport)>) {
    match result {
        Ok((text, report)) => {
            if !text.is_empty() {
                println!("{}", text);
            }
            info!(%report, "operation completed");
        }
        Err(e @ (BTreeError::DuplicateKey(_) | BTreeError::KeyNotFound(_) | BTreeError::EmptyTree)) => {
            warn!("{}", e);
            println!("{}", e);
        }
        Err(e) => eprintln!("{}", e),
    }
}
