//! couchsync CLI - Command line interface for remote store operations.
//!
//! This tool talks to a CouchDB-compatible server through the same
//! replication engine an application would embed.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use couchsync_remote::{
    EventPayload, Handler, PullOutcome, RemoteConfig, RemoteObject, RemoteStore,
};
use couchsync_transport::HttpTransport;

#[derive(Parser)]
#[command(name = "couchsync")]
#[command(about = "couchsync - Replication client for CouchDB-style databases")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RemoteArgs {
    /// Server URL.
    #[arg(short, long, default_value = "http://localhost:5984")]
    server: String,

    /// Database name.
    #[arg(long)]
    store: Option<String>,

    /// Document id prefix, e.g. "$public/".
    #[arg(long)]
    prefix: Option<String>,

    /// URL replacing the database root in request paths.
    #[arg(long)]
    base_url: Option<String>,

    /// JSON file holding a store configuration. Flags take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User for HTTP basic auth; the password is prompted for.
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one object.
    Find {
        /// Object type.
        #[arg(short = 't', long = "type")]
        object_type: String,

        /// Object id.
        #[arg(short, long)]
        id: String,
    },

    /// List objects, optionally of one type.
    FindAll {
        /// Object type.
        #[arg(short = 't', long = "type")]
        object_type: Option<String>,
    },

    /// Save an object, generating an id when none is given.
    Save {
        /// Object type.
        #[arg(short = 't', long = "type")]
        object_type: String,

        /// Object id.
        #[arg(short, long)]
        id: Option<String>,

        /// Attribute as key=value; values are parsed as JSON when possible.
        #[arg(short, long = "attr")]
        attributes: Vec<String>,
    },

    /// Merge attributes into an existing object.
    Update {
        /// Object type.
        #[arg(short = 't', long = "type")]
        object_type: String,

        /// Object id.
        #[arg(short, long)]
        id: String,

        /// Attribute as key=value; values are parsed as JSON when possible.
        #[arg(short, long = "attr")]
        attributes: Vec<String>,
    },

    /// Delete an object, or every object of a type with --all.
    Remove {
        /// Object type.
        #[arg(short = 't', long = "type")]
        object_type: String,

        /// Object id.
        #[arg(short, long, required_unless_present = "all")]
        id: Option<String>,

        /// Delete every object of the type.
        #[arg(long)]
        all: bool,
    },

    /// Push objects from a JSON file holding an array of objects.
    Push {
        /// Path to the JSON file.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Pull once and print the changes.
    Pull {
        /// Start from this checkpoint.
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Connect and print events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = open_store(&cli.remote)?;

    match cli.command {
        Commands::Find { object_type, id } => cmd_find(&store, &object_type, &id).await,

        Commands::FindAll { object_type } => cmd_find_all(&store, object_type.as_deref()).await,

        Commands::Save {
            object_type,
            id,
            attributes,
        } => cmd_save(&store, &object_type, id, &attributes).await,

        Commands::Update {
            object_type,
            id,
            attributes,
        } => cmd_update(&store, &object_type, &id, &attributes).await,

        Commands::Remove {
            object_type,
            id,
            all,
        } => cmd_remove(&store, &object_type, id.as_deref(), all).await,

        Commands::Push { file } => cmd_push(&store, &file).await,

        Commands::Pull { since } => cmd_pull(&store, since).await,

        Commands::Watch => cmd_watch(&store).await,
    }
}

/// Build the store configuration from the optional file and the flags.
fn load_config(args: &RemoteArgs) -> Result<RemoteConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => RemoteConfig::default(),
    };

    if let Some(store) = &args.store {
        config.name = store.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }

    if config.name.is_empty() {
        anyhow::bail!("No store given. Use --store or a config file");
    }
    Ok(config)
}

fn open_store(args: &RemoteArgs) -> Result<RemoteStore> {
    let config = load_config(args)?;

    // Long-polls are held open for the heartbeat interval, so no request
    // timeout is set here; the engine's watchdog covers silent connections.
    let mut transport = HttpTransport::new(&args.server).context("Failed to create transport")?;
    if let Some(user) = &args.user {
        let password = rpassword::prompt_password(format!("Password for {}: ", user))
            .context("Failed to read password")?;
        transport = transport.with_credentials(user.clone(), password);
    }

    info!("Using store {} on {}", config.name, args.server);
    Ok(RemoteStore::new(config, Arc::new(transport)))
}

/// Parse `key=value` pairs into an attribute map.
fn parse_attributes(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut attributes = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Attribute must be key=value: {}", pair))?;
        if key.is_empty() {
            anyhow::bail!("Attribute key cannot be empty: {}", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        attributes.insert(key.to_string(), value);
    }
    Ok(attributes)
}

fn print_object(object: &RemoteObject) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(object)?);
    Ok(())
}

async fn cmd_find(store: &RemoteStore, object_type: &str, id: &str) -> Result<()> {
    let object = store
        .find(object_type, id)
        .await
        .with_context(|| format!("Failed to find {}/{}", object_type, id))?;
    print_object(&object)
}

async fn cmd_find_all(store: &RemoteStore, object_type: Option<&str>) -> Result<()> {
    let objects = store.find_all(object_type).await.context("Failed to list objects")?;

    if objects.is_empty() {
        println!("No objects.");
        return Ok(());
    }
    for object in &objects {
        let rev = object.rev.as_deref().unwrap_or("-");
        println!("  {}/{}  {}", object.object_type, object.id, rev);
    }
    println!("{} object(s)", objects.len());
    Ok(())
}

async fn cmd_save(
    store: &RemoteStore,
    object_type: &str,
    id: Option<String>,
    attributes: &[String],
) -> Result<()> {
    let mut object = RemoteObject::new(object_type, id.unwrap_or_default());
    object.attributes = parse_attributes(attributes)?;

    let saved = store.save(object).await.context("Failed to save object")?;
    println!(
        "Saved {}/{} ({})",
        saved.object_type,
        saved.id,
        saved.rev.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn cmd_update(
    store: &RemoteStore,
    object_type: &str,
    id: &str,
    attributes: &[String],
) -> Result<()> {
    let changes = parse_attributes(attributes)?;
    let updated = store
        .update(object_type, id, &changes)
        .await
        .with_context(|| format!("Failed to update {}/{}", object_type, id))?;
    print_object(&updated)
}

async fn cmd_remove(store: &RemoteStore, object_type: &str, id: Option<&str>, all: bool) -> Result<()> {
    if all {
        let removed = store
            .remove_all(Some(object_type))
            .await
            .with_context(|| format!("Failed to remove objects of type {}", object_type))?;
        println!("Removed {} object(s)", removed.len());
        return Ok(());
    }

    let id = id.context("Missing --id")?;
    let removed = store
        .remove(object_type, id)
        .await
        .with_context(|| format!("Failed to remove {}/{}", object_type, id))?;
    println!("Removed {}/{}", removed.object_type, removed.id);
    Ok(())
}

fn read_objects(path: &Path) -> Result<Vec<RemoteObject>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid objects in {}", path.display()))
}

async fn cmd_push(store: &RemoteStore, file: &Path) -> Result<()> {
    let objects = read_objects(file)?;
    let written = store.push(&objects).await.context("Failed to push objects")?;

    for object in &written {
        println!(
            "  {}/{}  {}",
            object.object_type,
            object.id,
            object.rev.as_deref().unwrap_or("-")
        );
    }
    println!("Pushed {} object(s)", written.len());
    Ok(())
}

/// Print store events as they arrive.
fn event_printer() -> Handler {
    Arc::new(|event: &str, payload: &EventPayload| match payload {
        EventPayload::Change(kind, object) => {
            println!("{}  {} {}/{}", event, kind, object.object_type, object.id)
        }
        EventPayload::Error(err) => println!("{}  {}", event, err),
        _ => println!("{}", event),
    })
}

async fn cmd_pull(store: &RemoteStore, since: u64) -> Result<()> {
    store.set_checkpoint(since);
    store.on("change", event_printer());

    match store.pull().await.context("Pull did not complete")? {
        PullOutcome::Applied(summary) => println!(
            "{} added, {} updated, {} removed, checkpoint {}",
            summary.added, summary.updated, summary.removed, summary.checkpoint
        ),
        PullOutcome::Failed(kind) => anyhow::bail!("Pull failed: {:?}", kind),
        PullOutcome::Superseded => println!("Pull superseded"),
    }
    Ok(())
}

async fn cmd_watch(store: &RemoteStore) -> Result<()> {
    store.on(
        "bootstrap:start bootstrap:end change error:server error:unauthenticated",
        event_printer(),
    );

    let _bootstrap = store.connect();
    println!("Watching {} (Ctrl-C to stop)", store.name());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    store.disconnect();
    println!("\nDisconnected.");
    Ok(())
}
