//! Gearshed CLI - inspect backend configuration and probe documents.
//!
//! Reads the same environment variables as the application, so it can be
//! used to check a deployment's settings before starting it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gearshed_app::{capabilities, Backend, ProviderKind, Runtime};
use gearshed_backend::value::{document_from_json, document_to_json};
use gearshed_backend::{
    CollectionPath, Database, Direction, DocumentPath, DocumentSnapshot, FilterOp,
    QueryConstraint, SetOptions, Value,
};
use gearshed_config::{
    endpoint, load_client_config, load_server_config, resolve_provider_kind, EnvSource, ProcessEnv,
};

#[derive(Parser)]
#[command(name = "gearshed")]
#[command(about = "Gearshed - backend provider tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Use this provider instead of the one named by the environment.
    #[arg(short, long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered providers and what each supports.
    Providers,

    /// Show the active configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Serve the client configuration at /api/config.
    Serve {
        /// Address to listen on.
        #[arg(short, long, default_value = "127.0.0.1:8787")]
        addr: SocketAddr,
    },

    /// Initialize the active provider in the server context.
    Check,

    /// Read and write documents with the server database.
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print configuration as JSON; secrets are never printed.
    Show {
        /// Also load the server settings and report them redacted.
        #[arg(long)]
        server: bool,
    },
}

#[derive(Subcommand)]
enum DocCommands {
    /// Print one document.
    Get {
        /// Document path, e.g. bikes/b1.
        path: String,
    },

    /// Write a document from a JSON object.
    Set {
        path: String,

        /// Document data as a JSON object.
        data: String,

        /// Merge into the existing document instead of replacing it.
        #[arg(short, long)]
        merge: bool,
    },

    /// Query a collection.
    Query {
        /// Collection path, e.g. bikes or bikes/b1/components.
        collection: String,

        /// Filter as FIELD OP VALUE; VALUE is JSON or a bare string.
        #[arg(short = 'w', long = "where", num_args = 3, value_names = ["FIELD", "OP", "VALUE"])]
        filters: Vec<String>,

        /// Sort field, optionally suffixed with :asc or :desc.
        #[arg(short, long)]
        order_by: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
    match cli.command {
        Commands::Providers => cmd_providers(),
        Commands::Config {
            command: ConfigCommands::Show { server },
        } => cmd_config_show(env.as_ref(), server),
        Commands::Serve { addr } => cmd_serve(addr, env).await,
        Commands::Check => cmd_check(backend(env, cli.provider.as_deref())?).await,
        Commands::Doc { command } => {
            let db = backend(env, cli.provider.as_deref())?
                .get_server_db()
                .await
                .context("Failed to open the server database")?;
            match command {
                DocCommands::Get { path } => cmd_doc_get(db.as_ref(), &path).await,
                DocCommands::Set { path, data, merge } => {
                    cmd_doc_set(db.as_ref(), &path, &data, merge).await
                }
                DocCommands::Query {
                    collection,
                    filters,
                    order_by,
                    limit,
                } => cmd_doc_query(db.as_ref(), &collection, &filters, &order_by, limit).await,
            }
        }
    }
}

fn backend(env: Arc<dyn EnvSource>, provider: Option<&str>) -> Result<Backend> {
    Ok(match provider {
        Some(name) => Backend::with_provider(Runtime::Server, env, name)?,
        None => Backend::new(Runtime::Server, env),
    })
}

/// List every registered provider.
fn cmd_providers() -> Result<()> {
    for kind in ProviderKind::ALL {
        let caps = capabilities(kind);
        println!("{}", kind);
        println!(
            "  operators:     {}",
            caps.operators
                .iter()
                .map(|op| op.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        println!(
            "  transforms:    {}",
            caps.field_values
                .iter()
                .map(|transform| transform.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        println!("  batches:       {}", caps.atomic_batch);
        println!("  transactions:  {}", caps.transactions);
        println!("  vector search: {}", caps.vector_search);
        println!("  realtime:      {}", caps.realtime);
        println!("  nesting:       {:?}", caps.nesting);
        if let Some(max) = caps.max_in_values {
            println!("  max in values: {}", max);
        }
    }
    Ok(())
}

/// Print the configuration of the active provider.
fn cmd_config_show(env: &dyn EnvSource, server: bool) -> Result<()> {
    println!("Provider: {}", resolve_provider_kind(env));

    let client = load_client_config(env).context("Invalid client configuration")?;
    println!("{}", serde_json::to_string_pretty(&client)?);

    if server {
        let server = load_server_config(env).context("Invalid server configuration")?;
        println!("{:#?}", server);
    }
    Ok(())
}

/// Serve the configuration endpoint until interrupted.
async fn cmd_serve(addr: SocketAddr, env: Arc<dyn EnvSource>) -> Result<()> {
    load_client_config(env.as_ref()).context("Refusing to serve an invalid configuration")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tokio::select! {
        result = endpoint::serve(listener, env) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

/// Initialize the provider and open every capability.
async fn cmd_check(backend: Backend) -> Result<()> {
    info!("Checking provider: {}", backend.kind());

    backend.get_server_db().await.context("Server database")?;
    backend.get_server_auth().await.context("Server auth")?;
    backend.get_db().await.context("Client database")?;
    backend.get_auth().await.context("Client auth")?;
    backend.get_storage().await.context("Storage")?;

    println!("Provider '{}' initialized; all capabilities available", backend.kind());
    Ok(())
}

fn print_snapshot(snapshot: &DocumentSnapshot) -> Result<()> {
    match snapshot.data() {
        Some(data) => println!(
            "{} {}",
            snapshot.path(),
            serde_json::to_string(&document_to_json(data))?
        ),
        None => println!("{} (missing)", snapshot.path()),
    }
    Ok(())
}

async fn cmd_doc_get(db: &dyn Database, path: &str) -> Result<()> {
    let path = DocumentPath::parse(path)?;
    let snapshot = db.get_doc(&path).await?;
    print_snapshot(&snapshot)
}

async fn cmd_doc_set(db: &dyn Database, path: &str, data: &str, merge: bool) -> Result<()> {
    let path = DocumentPath::parse(path)?;
    let json: serde_json::Value = serde_json::from_str(data).context("Data is not valid JSON")?;
    let options = if merge {
        SetOptions::merge()
    } else {
        SetOptions::default()
    };

    db.set_doc(&path, document_from_json(json)?, options).await?;
    info!("Wrote {}", path);
    print_snapshot(&db.get_doc(&path).await?)
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_operand(raw: &str) -> Value {
    serde_json::from_str(raw)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::from(raw))
}

async fn cmd_doc_query(
    db: &dyn Database,
    collection: &str,
    filters: &[String],
    order_by: &[String],
    limit: Option<usize>,
) -> Result<()> {
    let collection = CollectionPath::parse(collection)?;

    let mut constraints = Vec::new();
    for filter in filters.chunks(3) {
        let [field, op, value] = filter else {
            bail!("--where takes FIELD OP VALUE");
        };
        let op: FilterOp = op.parse()?;
        constraints.push(QueryConstraint::where_(field.as_str(), op, parse_operand(value)));
    }
    for order in order_by {
        let (field, direction) = match order.rsplit_once(':') {
            Some((field, direction)) => (field, direction.parse::<Direction>()?),
            None => (order.as_str(), Direction::Ascending),
        };
        constraints.push(QueryConstraint::order_by(field, direction));
    }
    if let Some(n) = limit {
        constraints.push(QueryConstraint::limit(n));
    }

    let results = db.get_docs(&collection, &constraints).await?;
    for snapshot in results.iter() {
        print_snapshot(snapshot)?;
    }
    info!("{} documents", results.size());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operand() {
        assert_eq!(parse_operand("200"), Value::Integer(200));
        assert_eq!(parse_operand("active"), Value::from("active"));
        assert_eq!(parse_operand("\"200\""), Value::from("200"));
        assert_eq!(
            parse_operand("[\"road\", \"gravel\"]"),
            Value::Array(vec![Value::from("road"), Value::from("gravel")])
        );
    }

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "gearshed", "doc", "query", "bikes", "--where", "km", ">=", "200", "-o", "km:desc",
            "--limit", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Doc {
                command:
                    DocCommands::Query {
                        collection,
                        filters,
                        order_by,
                        limit,
                    },
            } => {
                assert_eq!(collection, "bikes");
                assert_eq!(filters, vec!["km", ">=", "200"]);
                assert_eq!(order_by, vec!["km:desc"]);
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected doc query"),
        }
    }
}
