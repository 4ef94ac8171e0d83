//! # Tabletop Sync CLI
//!
//! Offline administration of a table's durable storage.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use tabletop_sync_agent::SqliteStore;
use tabletop_sync_core::{
    clear_all_selections, storage_key, ActorId, NewObject, ObjectStore, Position, Readiness,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "tables" => {
            let [db] = operands(&args, "tables <db>")?;
            let store = open(db)?;
            for key in store.storage_keys()? {
                println!("{key}");
            }
        }
        "list" => {
            let [db, table_id] = operands(&args, "list <db> <table>")?;
            let table = load_table(&open(db)?, table_id)?;
            for (id, object) in table.objects() {
                let owner = object
                    .selected_by
                    .map_or_else(|| "-".to_string(), |actor| actor.to_string());
                println!(
                    "{id}  {:<7} {:>12} ({:.1}, {:.1}, {:.1}°)  selected_by={owner}{}",
                    object.kind().as_str(),
                    object.sort_key.as_str(),
                    object.pos.x,
                    object.pos.y,
                    object.pos.r,
                    if object.locked { "  locked" } else { "" },
                );
            }
        }
        "dump" => {
            let [db, table_id] = operands(&args, "dump <db> <table>")?;
            let table = load_table(&open(db)?, table_id)?;
            let json = serde_json::to_string_pretty(&table.objects()).context("Failed to render table")?;
            println!("{json}");
        }
        "clear-selections" => {
            let [db, table_id] = operands(&args, "clear-selections <db> <table>")?;
            let store = open(db)?;
            let mut table = load_table(&store, table_id)?;
            let cleared = clear_all_selections(&mut table);
            save_outbound(&store, &mut table)?;
            println!("Cleared {cleared} selection(s)");
        }
        "seed" => {
            let [db, table_id, count] = operands(&args, "seed <db> <table> <count>")?;
            let count: usize = count.parse().context("Invalid count")?;
            let store = open(db)?;
            let mut table = load_table(&store, table_id)?;
            let created = seed(&mut table, count);
            save_outbound(&store, &mut table)?;
            println!("Created {created} stack(s)");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn operands<'a, const N: usize>(args: &'a [String], usage: &str) -> Result<[&'a str; N]> {
    let rest: Vec<&str> = args.iter().skip(2).map(String::as_str).collect();
    match rest.try_into() {
        Ok(operands) => Ok(operands),
        Err(_) => bail!("Usage: tabletop-sync {usage}"),
    }
}

fn open(db: &str) -> Result<SqliteStore> {
    let path = Path::new(db);
    if !path.exists() {
        bail!("Database not found: {db}");
    }
    SqliteStore::open(path).with_context(|| format!("Failed to open {db}"))
}

/// Rebuild a table from storage under a throwaway identity.
fn load_table(store: &SqliteStore, table_id: &str) -> Result<ObjectStore> {
    let state = store
        .load(&storage_key(table_id))
        .with_context(|| format!("Failed to load table {table_id}"))?;
    let mut table = ObjectStore::new(table_id, ActorId::new());
    if table.hydrate(state) != Readiness::Loaded {
        bail!("Table {table_id} could not be loaded");
    }
    Ok(table)
}

fn save_outbound(store: &SqliteStore, table: &mut ObjectStore) -> Result<()> {
    let key = table.storage_key();
    for delta in table.take_outbound() {
        store.save_delta(&key, &delta).context("Failed to append delta")?;
    }
    Ok(())
}

/// Lay out `count` small decks in rows of ten.
#[allow(clippy::cast_precision_loss)]
fn seed(table: &mut ObjectStore, count: usize) -> usize {
    const COLUMNS: usize = 10;
    const SPACING: f64 = 120.0;

    table.transact(|txn| {
        for index in 0..count {
            let column = (index % COLUMNS) as f64;
            let row = (index / COLUMNS) as f64;
            let cards = (1..=3).map(|card| format!("deck{index}-card{card}"));
            txn.create(NewObject::stack(Position::at(column * SPACING, row * SPACING)).with_cards(cards));
        }
    });
    count
}

fn print_help() {
    println!(
        r#"Tabletop Sync CLI

USAGE:
    tabletop-sync <COMMAND> [OPTIONS]

COMMANDS:
    tables <db>                       List tables stored in a database
    list <db> <table>                 List the objects of a table
    dump <db> <table>                 Print the objects of a table as JSON
    clear-selections <db> <table>     Release every selection on a table
    seed <db> <table> <count>         Add <count> demo stacks to a table
    help                              Show this help message

Edits are appended to the delta log; peers pick them up through
anti-entropy once an agent serves the table.

EXAMPLES:
    tabletop-sync tables ./tabletop-sync.db
    tabletop-sync clear-selections ./tabletop-sync.db table-7
"#
    );
}
