use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sheetsync::config::{parse_config, parse_config_str};
use sheetsync::kv::{KvStore, MemoryStore, SqliteStore};
use sheetsync::source::DirectorySource;
use sheetsync::sync::{IndexTarget, SyncContext, SyncEngine};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "sheetsync.yaml";

/// sheetsync CLI: sync spreadsheet tables into an indexed key-value store
#[derive(Parser)]
#[command(name = "sheetsync", version, about)]
struct Cli {
    /// Config file (default: ./sheetsync.yaml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory of the spreadsheet files
    #[arg(long, default_value = ".")]
    source_dir: PathBuf,

    /// SQLite database holding the index and cache (in-memory when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Sync one table by display name
    SyncTable {
        /// Display name, e.g. "Config_Unit(hero)"
        table: String,
        /// Re-transform and re-index even when the source is unchanged
        #[arg(long)]
        force: bool,
    },

    /// Sync every member table of a group, then merge it
    SyncGroup {
        /// Group name, e.g. Config_Unit
        group: String,
        /// Force a full sync of every member
        #[arg(long)]
        force: bool,
    },

    /// Sync every table in a source folder and the groups they belong to
    SyncFolder {
        /// Folder id relative to the source directory
        folder: String,
    },

    /// Sync every configured table and group
    SyncAll,

    /// Read a table's cached records, rebuilding when absent or stale
    ReadTable {
        table: String,
        /// Bypass the cache
        #[arg(long)]
        force: bool,
    },

    /// Read a group's merged records
    ReadGroup {
        group: String,
        /// Bypass the cache
        #[arg(long)]
        force: bool,
        /// Nest records under the subtype that won them
        #[arg(long)]
        by_subtype: bool,
    },

    /// Keys whose grouping field has a value (e.g. Subtype=hero)
    GroupIds {
        /// Table display name, or group name with --group
        name: String,
        /// Field and value (e.g. Subtype=hero)
        #[arg(value_parser = parse_key_value)]
        filter: (String, String),
        /// Query a group's merged index
        #[arg(long)]
        group: bool,
    },

    /// Count of keys per value of a grouping field
    GroupCounts {
        /// Table display name, or group name with --group
        name: String,
        /// Grouping field
        #[arg(long, default_value = "Subtype")]
        field: String,
        /// Query a group's merged index
        #[arg(long)]
        group: bool,
    },

    /// Drop an index and build it again from the published records
    RebuildIndex {
        /// Table display name, or group name with --group
        name: String,
        /// Rebuild a group's merged index
        #[arg(long)]
        group: bool,
    },

    /// Drop cache entries matching a pattern (e.g. "table:*")
    Invalidate {
        pattern: String,
    },

    /// List a group's member tables
    Resolve {
        group: String,
    },

    /// Show cache state and last sync of every known table and group
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(&cli)?;
    let format = &cli.format;

    match cli.command {
        Command::SyncTable { table, force } => {
            let report = if force {
                engine.refresh_table(&table)?
            } else {
                engine.sync_table(&table)?
            };
            print_output(&report, format)?;
        }

        Command::SyncGroup { group, force } => {
            let report = if force {
                engine.refresh_group(&group)?
            } else {
                engine.sync_group(&group)?
            };
            print_output(&report, format)?;
        }

        Command::SyncFolder { folder } => {
            let batch = engine.sync_folder(&folder)?;
            print_output(&batch, format)?;
            if !batch.is_success() {
                return Err(format!("{} items failed", batch.failures().len()).into());
            }
        }

        Command::SyncAll => {
            let batch = engine.sync_all()?;
            print_output(&batch, format)?;
            if !batch.is_success() {
                return Err(format!("{} items failed", batch.failures().len()).into());
            }
        }

        Command::ReadTable { table, force } => {
            let read = engine.read_table(&table, force)?;
            print_output(&read.entry.payload, format)?;
        }

        Command::ReadGroup {
            group,
            force,
            by_subtype,
        } => {
            if by_subtype {
                print_output(&engine.read_group_by_subtype(&group, force)?, format)?;
            } else {
                let read = engine.read_group(&group, force)?;
                print_output(&read.entry.payload, format)?;
            }
        }

        Command::GroupIds {
            name,
            filter: (field, value),
            group,
        } => {
            let ids = engine.group_ids(target(&name, group), &field, &value)?;
            print_output(&ids, format)?;
        }

        Command::GroupCounts { name, field, group } => {
            let counts = engine.group_counts(target(&name, group), &field)?;
            print_output(&counts, format)?;
        }

        Command::RebuildIndex { name, group } => {
            let report = engine.rebuild_index(target(&name, group))?;
            print_output(&report, format)?;
        }

        Command::Invalidate { pattern } => {
            let removed = engine.invalidate(&pattern)?;
            print_output(&serde_json::json!({ "ok": true, "removed": removed }), format)?;
        }

        Command::Resolve { group } => {
            print_output(&engine.resolve_group_tables(&group)?, format)?;
        }

        Command::Status => {
            print_output(&engine.status()?, format)?;
        }
    }

    Ok(())
}

fn open_engine(cli: &Cli) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => parse_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => parse_config(Path::new(DEFAULT_CONFIG))?,
        None => parse_config_str("{}")?,
    };

    let store: Arc<dyn KvStore> = match &cli.db {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    Ok(SyncEngine::new(SyncContext {
        source: Arc::new(DirectorySource::new(cli.source_dir.clone())),
        store,
        config: Arc::new(config),
    }))
}

fn target(name: &str, group: bool) -> IndexTarget<'_> {
    if group {
        IndexTarget::Group(name)
    } else {
        IndexTarget::Table(name)
    }
}

fn print_output<T: Serialize>(value: &T, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
