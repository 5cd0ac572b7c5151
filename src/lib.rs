pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod object;
pub mod query;
pub mod reconcile;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod sync;
pub mod table;
pub mod transport;
pub mod types;
pub mod upsert;
pub mod value;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::cli::{Cli, Commands};

pub use crate::{
    batch::{Row, RowBatch},
    config::StoreConfig,
    error::{StoreError, TransportError},
    object::{BincodeCodec, Codec, JsonCodec},
    reconcile::{DuplicatePolicy, NullKeyPolicy},
    schema::{ColumnDef, KeyColumns, TableSchema},
    store::Store,
    types::{ColumnRole, NativeType, TypeMap, TypeOrigin},
    upsert::{SymbolConflict, UpsertOptions, UpsertReport},
    value::Value,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("series_store", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match &cli.command {
        Commands::TypeMap(args) => handle_type_map(&cli, args),
        command => {
            let config = resolve_config(&cli)?;
            let store = Store::open(&config)
                .with_context(|| format!("Opening database '{}'", config.database))?;
            let outcome = dispatch(&store, command);
            store.close();
            outcome
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match (&cli.config, &cli.database) {
        (Some(path), _) => StoreConfig::load(path)
            .with_context(|| format!("Loading store config from {path:?}"))?,
        (None, Some(database)) => StoreConfig::with_database_path(database),
        (None, None) => StoreConfig::from_env().context("No --database or --config given")?,
    };
    if let Some(database) = &cli.database {
        config.database = database.to_string_lossy().into_owned();
    }
    debug!("Store config: {config:?}");
    Ok(config)
}

fn dispatch(store: &Store, command: &Commands) -> Result<()> {
    match command {
        Commands::Ping => handle_ping(store),
        Commands::Upload(args) => handle_upload(store, args),
        Commands::Columns(args) => handle_columns(store, args),
        Commands::Latest(args) => handle_latest(store, args),
        Commands::Symbol(args) => handle_symbol(store, args),
        Commands::Tables => handle_tables(store),
        Commands::TypeMap(_) => Ok(()),
    }
}

fn handle_ping(store: &Store) -> Result<()> {
    store.ping().context("Database is not reachable")?;
    println!("ok");
    Ok(())
}

fn handle_upload(store: &Store, args: &cli::UploadArgs) -> Result<()> {
    let delimiter = args.delimiter.unwrap_or(b',');
    info!(
        "Uploading '{}' into '{}' with delimiter '{}'",
        args.input.display(),
        args.table,
        printable_delimiter(delimiter)
    );
    let batch = RowBatch::from_csv_path(&args.input, delimiter)?;
    let keys = if args.no_keys {
        KeyColumns::none()
    } else {
        key_columns(&args.keys)
    };
    let mut options = store
        .upsert_options(keys)
        .categorical(args.categorical.iter().map(|c| c.trim()))
        .numeric(args.numeric.iter().map(|c| c.trim()))
        .update_latest(args.update_latest)
        .allow_schema_alter(!args.no_alter)
        .null_keys(args.null_keys.into())
        .duplicates(args.duplicates.into());
    if args.strict_symbol {
        options = options.symbol_conflict(SymbolConflict::Reject);
    }
    if let Some(symbol) = &args.symbol {
        options = options.symbol(symbol.clone());
    }
    if let Some(path) = &args.type_map {
        options = options.type_map(load_type_map(path)?);
    }
    let rows = batch.len();
    let report = store
        .upsert(&args.table, batch, &options)
        .with_context(|| format!("Upserting {rows} row(s) into '{}'", args.table))?;
    println!(
        "inserted={} overwritten={} unchanged={} superseded={} dropped={}",
        report.inserted,
        report.overwritten,
        report.unchanged,
        report.superseded,
        report.dropped_null_keys
    );
    Ok(())
}

fn handle_columns(store: &Store, args: &cli::ColumnsArgs) -> Result<()> {
    let tables = args.tables.iter().map(String::as_str).collect::<Vec<_>>();
    let columns = store
        .union_columns(&tables)
        .with_context(|| format!("Reading columns of {tables:?}"))?;
    for column in columns {
        println!("{column}");
    }
    Ok(())
}

fn handle_latest(store: &Store, args: &cli::LatestArgs) -> Result<()> {
    let keys = key_columns(&args.keys);
    let latest = store
        .latest_date(&args.table, args.symbol.as_deref(), &keys, args.strict)
        .with_context(|| format!("Reading latest date of '{}'", args.table))?;
    match latest {
        Some(date) => println!("{date}"),
        None => println!("none"),
    }
    Ok(())
}

fn handle_symbol(store: &Store, args: &cli::SymbolArgs) -> Result<()> {
    let keys = key_columns(&args.keys);
    let tables = (!args.tables.is_empty()).then_some(args.tables.as_slice());
    let found = store
        .all_data_for_symbol(&args.symbol, &keys, tables, args.drop_symbol_col)
        .with_context(|| format!("Collecting rows for '{}'", args.symbol))?;
    if found.is_empty() {
        info!("No rows stored for '{}'", args.symbol);
    }
    for (name, rows) in found {
        println!("[{name}] {} row(s)", rows.len());
        table::print_batch(&rows);
    }
    Ok(())
}

fn handle_tables(store: &Store) -> Result<()> {
    let rows = store
        .list_tables()
        .context("Listing tables")?
        .into_iter()
        .map(|name| vec![name])
        .collect::<Vec<_>>();
    table::print_table(&["table".to_string()], &rows);
    Ok(())
}

fn handle_type_map(cli: &Cli, args: &cli::TypeMapArgs) -> Result<()> {
    let text_length = match (args.text_length, &cli.config) {
        (Some(length), _) => length,
        (None, Some(path)) => {
            StoreConfig::load(path)
                .with_context(|| format!("Loading store config from {path:?}"))?
                .text_length
        }
        (None, None) => StoreConfig::default_text_length(),
    };
    print!("{}", TypeMap::with_text_length(text_length).to_yaml_string()?);
    Ok(())
}

fn key_columns(args: &cli::KeyArgs) -> KeyColumns {
    KeyColumns::symbol_date(args.symbol_col.trim(), args.date_col.trim())
}

fn load_type_map(path: &Path) -> Result<TypeMap> {
    TypeMap::load(path).with_context(|| format!("Loading type map from {path:?}"))
}

fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}
