use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use storygraph_common::{Config, ObjectKind, ObjectRef, StoreResult, StoryGraphError};
use storygraph_graph::{migrate, NarrativeStore, StoryStore};

#[derive(Parser)]
#[command(name = "storygraph", about = "Operate a versioned narrative graph store")]
struct Cli {
    #[command(flatten)]
    conn: Connection,

    #[command(subcommand)]
    command: Command,
}

/// Connection flags. Each one overrides the environment variable of the same
/// name; anything left unset falls back to the environment, then to defaults.
#[derive(Args)]
struct Connection {
    /// Overrides NEO4J_URI
    #[arg(long)]
    neo4j_uri: Option<String>,

    /// Overrides NEO4J_USER
    #[arg(long)]
    neo4j_user: Option<String>,

    /// Overrides NEO4J_PASSWORD
    #[arg(long)]
    neo4j_password: Option<String>,

    /// Overrides NEO4J_DATABASE
    #[arg(long)]
    neo4j_database: Option<String>,

    /// Per-operation timeout in seconds; overrides STORYGRAPH_OP_TIMEOUT_SECS
    #[arg(long)]
    op_timeout_secs: Option<u64>,

    /// Overrides STORYGRAPH_MAX_CONNECTIONS
    #[arg(long)]
    max_connections: Option<usize>,

    /// Overrides STORYGRAPH_FETCH_SIZE
    #[arg(long)]
    fetch_size: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Create constraints and indexes (idempotent)
    Migrate,
    /// Create a story, or return the existing one with that id
    NewStory {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the main chain and current world state of a story
    Show { story_id: String },
    /// Print the chain starting at an entry (e.g. a branch root)
    ShowChain { entry_id: Uuid },
    /// Print the head entry of a story's main chain
    Head { story_id: String },
    /// Fork a new chain from an entry
    Branch {
        entry_id: Uuid,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        branch_id: Option<String>,
    },
    /// Discard everything after an entry on its chain
    Prune { entry_id: Uuid },
    /// Print every version of a world object, oldest first
    History { kind: ObjectKind, id: String },
}

impl Connection {
    fn flag(&self, key: &str) -> Option<String> {
        match key {
            "NEO4J_URI" => self.neo4j_uri.clone(),
            "NEO4J_USER" => self.neo4j_user.clone(),
            "NEO4J_PASSWORD" => self.neo4j_password.clone(),
            "NEO4J_DATABASE" => self.neo4j_database.clone(),
            "STORYGRAPH_OP_TIMEOUT_SECS" => self.op_timeout_secs.map(|n| n.to_string()),
            "STORYGRAPH_MAX_CONNECTIONS" => self.max_connections.map(|n| n.to_string()),
            "STORYGRAPH_FETCH_SIZE" => self.fetch_size.map(|n| n.to_string()),
            _ => None,
        }
    }

    fn config_with(&self, env: impl Fn(&str) -> Option<String>) -> StoreResult<Config> {
        Config::from_lookup(|key| self.flag(key).or_else(|| env(key)))
    }

    fn config(&self) -> StoreResult<Config> {
        self.config_with(|key| std::env::var(key).ok())
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("storygraph=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.conn.config() {
        Ok(config) => {
            config.log_redacted();
            run(&config, cli.command).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.report())?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(config: &Config, command: Command) -> StoreResult<()> {
    let store = StoryStore::connect(config).await?;

    match command {
        Command::Migrate => {
            store.setup().await?;
            let names = migrate::constraint_names(store.client()).await?;
            info!(constraints = names.len(), "Schema in place");
            print_json(&names)
        }
        Command::NewStory { title, id } => {
            let story = match id {
                Some(id) => store.world().create_story_with_id(&id, title.as_deref()).await?,
                None => store.world().create_story(title.as_deref()).await?,
            };
            print_json(&story)
        }
        Command::Show { story_id } => print_json(&store.load(&story_id).await?),
        Command::ShowChain { entry_id } => print_json(&store.reader().load_chain(entry_id).await?),
        Command::Head { story_id } => print_json(&store.timeline().head_of(&story_id).await?),
        Command::Branch {
            entry_id,
            title,
            branch_id,
        } => {
            let root = store
                .branch(entry_id, title.as_deref(), branch_id.as_deref())
                .await?;
            print_json(&root)
        }
        Command::Prune { entry_id } => {
            let report = store.prune(entry_id).await?;
            println!("{}", report.message());
            print_json(&report)
        }
        Command::History { kind, id } => {
            print_json(&store.ledger().history(&ObjectRef::new(kind, id)).await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> StoreResult<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| StoryGraphError::Database(e.to_string()))?;
    println!("{out}");
    Ok(())
}
