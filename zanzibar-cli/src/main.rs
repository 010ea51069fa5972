use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use zanzibar_engine::{
    telemetry, AuthorizationEngine, CheckRequest, ConsistencyToken, EngineConfig,
    InMemoryTupleStore, NamespaceConfig, NamespaceRegistry, RelationTuple, WriteRequest,
};

#[derive(Parser, Debug)]
#[command(name = "zanzibar")]
#[command(about = "Run authorization queries against namespace and tuple fixtures")]
struct Args {
    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "ZANZIBAR_CONFIG")]
    config: Option<PathBuf>,

    /// YAML list of namespace configurations; the seed namespaces when omitted
    #[arg(short, long)]
    namespaces: Option<PathBuf>,

    /// Tuple file, one `namespace:object#relation@user` per line
    #[arg(short, long)]
    tuples: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Does USER hold RELATION on NAMESPACE:OBJECT_ID?
    Check {
        namespace: String,
        object_id: String,
        relation: String,
        user: String,
        /// Consistency token from an earlier call
        #[arg(long)]
        token: Option<String>,
    },
    /// Every identifier holding RELATION on NAMESPACE:OBJECT_ID
    Expand {
        namespace: String,
        object_id: String,
        relation: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Every relation USER holds
    ListPermissions {
        user: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Checks every `namespace:object#relation@user` line of FILE, in order
    BatchCheck {
        file: PathBuf,
        #[arg(long)]
        token: Option<String>,
    },
    /// Loads the fixtures and reports what was found
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    telemetry::init_tracing(&config.logging)?;

    let namespaces = match &args.namespaces {
        Some(path) => load_namespaces(path)?,
        None => NamespaceConfig::default_namespaces(),
    };
    let registry = Arc::new(NamespaceRegistry::new(&namespaces)?);

    let store = Arc::new(InMemoryTupleStore::new());
    let tuple_count = match &args.tuples {
        Some(path) => {
            let tuples = parse_lines::<RelationTuple>(path)?;
            let snapshot = registry.snapshot();
            for tuple in &tuples {
                snapshot.validate_tuple(tuple)?;
            }
            let count = tuples.len();
            store.batch_write(WriteRequest {
                writes: tuples,
                deletes: Vec::new(),
            });
            count
        }
        None => 0,
    };
    info!(
        namespaces = namespaces.len(),
        tuples = tuple_count,
        "Fixtures loaded"
    );

    let engine = AuthorizationEngine::from_config(store.clone(), registry, config).await?;

    let output = match args.command {
        Command::Check {
            namespace,
            object_id,
            relation,
            user,
            token,
        } => {
            let token = token.map(into_token);
            let request = CheckRequest::new(&namespace, &object_id, &relation, &user);
            serde_json::to_value(engine.check(&request, token.as_ref()).await?)?
        }
        Command::Expand {
            namespace,
            object_id,
            relation,
            token,
        } => {
            let token = token.map(into_token);
            serde_json::to_value(
                engine
                    .expand(&namespace, &object_id, &relation, token.as_ref())
                    .await?,
            )?
        }
        Command::ListPermissions { user, token } => {
            let token = token.map(into_token);
            serde_json::to_value(engine.list_permissions(&user, token.as_ref()).await?)?
        }
        Command::BatchCheck { file, token } => {
            let token = token.map(into_token);
            let items: Vec<CheckRequest> = parse_lines::<RelationTuple>(&file)?
                .into_iter()
                .map(|t| CheckRequest::new(&t.namespace, &t.object_id, &t.relation, &t.user.to_string()))
                .collect();
            let batch = engine.batch_check(&items, token.as_ref()).await?;
            let results: Vec<_> = items
                .iter()
                .zip(&batch.results)
                .map(|(item, result)| match result {
                    Ok(allowed) => json!({ "request": item.to_string(), "allowed": allowed }),
                    Err(e) => json!({
                        "request": item.to_string(),
                        "error": e.code(),
                        "message": e.to_string(),
                    }),
                })
                .collect();
            json!({ "results": results, "token": batch.token })
        }
        Command::Validate => {
            let health = engine.health_check().await?;
            json!({
                "namespaces": namespaces.iter().map(|n| &n.name).collect::<Vec<_>>(),
                "tuples": store.len(),
                "health": health,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn into_token(token: String) -> ConsistencyToken {
    ConsistencyToken {
        token,
        issued_at: chrono::Utc::now(),
    }
}

fn load_namespaces(path: &Path) -> Result<Vec<NamespaceConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read namespaces from {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Invalid namespace file {}", path.display()))
}

/// Parses one item per non-empty line; `#` at line start marks a comment.
fn parse_lines<T>(path: &Path) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            line.parse::<T>()
                .with_context(|| format!("{}:{}: invalid entry '{}'", path.display(), number, line))
        })
        .collect()
}
