use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rouchdb::{AllDocsOptions, ChangesOptions, Database};
use tracing_subscriber::EnvFilter;

/// Command-line client for a RouchDB database: a redb file, an in-memory
/// scratch database, or a remote CouchDB/RouchDB server reached over HTTP.
#[derive(Parser, Debug)]
#[command(name = "rouchdb", version)]
struct Cli {
    /// Database location: a path to a redb file, `:memory:`, or an
    /// `http(s)://` URL naming a remote database.
    #[arg(long, global = true, default_value = ":memory:")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print database metadata (document count, update sequence).
    Info,
    /// Fetch a document by id.
    Get { id: String },
    /// Create or update a document from a JSON string.
    Put {
        id: String,
        json: String,
        /// Current revision, required when updating an existing document.
        #[arg(long)]
        rev: Option<String>,
    },
    /// Delete a document at its current revision.
    Rm { id: String, rev: String },
    /// List every document, optionally with bodies.
    AllDocs {
        #[arg(long)]
        include_docs: bool,
    },
    /// Print changes since a sequence (defaults to the beginning).
    Changes {
        #[arg(long, default_value = "0")]
        since: String,
    },
    /// Push this database's changes to another database.
    Push { other: String },
    /// Pull another database's changes into this one.
    Pull { other: String },
    /// Push, then pull: a bidirectional one-shot sync.
    Sync { other: String },
    /// Prune old revision-tree branches and sweep unreferenced blobs.
    Compact,
}

fn open(target: &str) -> anyhow::Result<Database> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(Database::http(target.to_string()));
    }
    if target == ":memory:" {
        return Ok(Database::memory("scratch"));
    }
    let path = PathBuf::from(target);
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("db").to_string();
    Ok(Database::open(&path, name)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_target(false).init();

    let cli = Cli::parse();
    let db = open(&cli.db)?;

    match cli.command {
        Command::Info => {
            let info = db.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Get { id } => {
            let doc = db.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&doc.to_json())?);
        }
        Command::Put { id, json, rev } => {
            let data: serde_json::Value = serde_json::from_str(&json)?;
            let result = match rev {
                Some(rev) => db.update(id, &rev, data).await?,
                None => db.put(id, data).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Rm { id, rev } => {
            let result = db.remove(id, &rev).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::AllDocs { include_docs } => {
            let opts = AllDocsOptions { include_docs, ..AllDocsOptions::new() };
            let response = db.all_docs(opts).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Changes { since } => {
            let seq = since.parse::<u64>().map(rouchdb::Seq::Num).unwrap_or(rouchdb::Seq::Str(since));
            let opts = ChangesOptions { since: seq, include_docs: true, ..Default::default() };
            let response = db.changes(opts).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Push { other } => {
            let other_db = open(&other)?;
            let stats = db.replicate_to(&other_db).await?;
            println!("{stats:#?}");
        }
        Command::Pull { other } => {
            let other_db = open(&other)?;
            let stats = db.replicate_from(&other_db).await?;
            println!("{stats:#?}");
        }
        Command::Sync { other } => {
            let other_db = open(&other)?;
            let (push, pull) = db.sync(&other_db).await?;
            println!("push: {:#?}\npull: {:#?}", push.stats, pull.stats);
        }
        Command::Compact => {
            db.compact().await?;
            println!("{{\"ok\":true}}");
        }
    }

    Ok(())
}
