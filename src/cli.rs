use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::reconcile::{DuplicatePolicy, NullKeyPolicy};

#[derive(Debug, Parser)]
#[command(author, version, about = "Schema-adaptive store for symbol/date keyed tables", long_about = None)]
pub struct Cli {
    /// SQLite database file (overrides --config and SERIES_STORE_DATABASE)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,
    /// YAML file with store settings
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check that the database answers a trivial query
    Ping,
    /// Upsert the rows of a CSV file into a table
    Upload(UploadArgs),
    /// List the union of columns across tables
    Columns(ColumnsArgs),
    /// Print the latest stored date of a table
    Latest(LatestArgs),
    /// Print every row stored for a symbol
    Symbol(SymbolArgs),
    /// List stored tables
    Tables,
    /// Print the default type map as YAML
    TypeMap(TypeMapArgs),
}

#[derive(Debug, Clone, Args)]
pub struct KeyArgs {
    /// Symbol key column
    #[arg(long = "symbol-col", default_value = "symbol")]
    pub symbol_col: String,
    /// Date key column
    #[arg(long = "date-col", default_value = "date")]
    pub date_col: String,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Target table
    #[arg(short, long)]
    pub table: String,
    /// Input CSV file with a header row
    #[arg(short, long)]
    pub input: PathBuf,
    /// Symbol written into every row's symbol column
    #[arg(long)]
    pub symbol: Option<String>,
    #[command(flatten)]
    pub keys: KeyArgs,
    /// Upload without key columns; every row is appended
    #[arg(long = "no-keys")]
    pub no_keys: bool,
    /// Comma-separated categorical columns
    #[arg(long, value_delimiter = ',')]
    pub categorical: Vec<String>,
    /// Comma-separated numeric columns
    #[arg(long, value_delimiter = ',')]
    pub numeric: Vec<String>,
    /// Rewrite the latest row of each symbol in place when it changed
    #[arg(long = "update-latest")]
    pub update_latest: bool,
    /// Fail instead of creating the table or adding columns
    #[arg(long = "no-alter")]
    pub no_alter: bool,
    /// What to do with rows missing a key value
    #[arg(long = "null-keys", value_enum, default_value_t = NullKeysArg::Keep)]
    pub null_keys: NullKeysArg,
    /// What to do with rows whose key is already stored
    #[arg(long, value_enum, default_value_t = DuplicatesArg::Keep)]
    pub duplicates: DuplicatesArg,
    /// Reject rows naming a different symbol than --symbol
    #[arg(long = "strict-symbol")]
    pub strict_symbol: bool,
    /// YAML type map replacing the default role policy
    #[arg(long = "type-map")]
    pub type_map: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
}

#[derive(Debug, Args)]
pub struct ColumnsArgs {
    /// Tables to inspect
    #[arg(required = true)]
    pub tables: Vec<String>,
}

#[derive(Debug, Args)]
pub struct LatestArgs {
    /// Table to query
    #[arg(short, long)]
    pub table: String,
    /// Restrict to one symbol
    #[arg(long)]
    pub symbol: Option<String>,
    #[command(flatten)]
    pub keys: KeyArgs,
    /// Fail when nothing is stored
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Args)]
pub struct SymbolArgs {
    /// Symbol to look up
    pub symbol: String,
    /// Restrict to these tables (all tables when omitted)
    #[arg(short, long = "table")]
    pub tables: Vec<String>,
    #[command(flatten)]
    pub keys: KeyArgs,
    /// Leave the symbol column out of the output
    #[arg(long = "drop-symbol-col")]
    pub drop_symbol_col: bool,
}

#[derive(Debug, Args)]
pub struct TypeMapArgs {
    /// Length of bounded text columns
    #[arg(long = "text-length")]
    pub text_length: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NullKeysArg {
    Keep,
    Drop,
    Reject,
}

impl From<NullKeysArg> for NullKeyPolicy {
    fn from(value: NullKeysArg) -> Self {
        match value {
            NullKeysArg::Keep => NullKeyPolicy::Keep,
            NullKeysArg::Drop => NullKeyPolicy::Drop,
            NullKeysArg::Reject => NullKeyPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DuplicatesArg {
    Keep,
    RequireIdentical,
    Overwrite,
}

impl From<DuplicatesArg> for DuplicatePolicy {
    fn from(value: DuplicatesArg) -> Self {
        match value {
            DuplicatesArg::Keep => DuplicatePolicy::Keep,
            DuplicatesArg::RequireIdentical => DuplicatePolicy::RequireIdentical,
            DuplicatesArg::Overwrite => DuplicatePolicy::Overwrite,
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "pipe" | "|" => Ok(b'|'),
        "semicolon" | ";" => Ok(b';'),
        other => match other.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            [] => Err("Delimiter cannot be empty".to_string()),
            _ => Err("Delimiter must be a single ASCII character".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_aliases() {
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert_eq!(parse_delimiter(":"), Ok(b':'));
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter("ab").is_err());
    }

    #[test]
    fn upload_flags_parse() {
        let cli = Cli::parse_from([
            "series-store",
            "--database",
            "prices.db",
            "upload",
            "--table",
            "prices",
            "--input",
            "prices.csv",
            "--numeric",
            "price,volume",
            "--null-keys",
            "reject",
            "--duplicates",
            "require-identical",
        ]);
        let Commands::Upload(args) = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(args.numeric, ["price", "volume"]);
        assert_eq!(NullKeyPolicy::from(args.null_keys), NullKeyPolicy::Reject);
        assert_eq!(DuplicatePolicy::from(args.duplicates), DuplicatePolicy::RequireIdentical);
        assert_eq!(args.keys.symbol_col, "symbol");
    }
}
