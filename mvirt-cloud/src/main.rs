use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mvirt_cloud::ids;
use mvirt_cloud::{CloudConfig, NodeEvent, NodeProjection};

#[derive(Parser)]
#[command(name = "mvirt-cloud")]
#[command(about = "mvirt cloud adapter - node and disk reconciliation tools")]
struct Args {
    /// Cloud config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate the cloud config, print the effective config
    Validate,

    /// Show what an identifier parses into
    ParseId {
        /// Resource id, provider id or IP configuration id
        id: String,
    },

    /// Read JSON-lines node events from stdin and print the node projection
    ProjectNodes,
}

fn load_config(path: Option<&Path>) -> Result<CloudConfig> {
    let Some(path) = path else {
        bail!("--config is required for this command");
    };
    let config = CloudConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?
        .validate()
        .context("invalid cloud config")?;
    info!("Loaded cloud config from {}", path.display());
    Ok(config)
}

async fn project_nodes(config: &CloudConfig) -> Result<()> {
    let projection = NodeProjection::new(config.resource_group.clone(), config.location.clone());
    projection.attach_informer().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: NodeEvent =
            serde_json::from_str(&line).with_context(|| format!("invalid node event on line {line_no}"))?;
        debug!(node = %event.node_name(), "applying node event");
        projection.handle(&event).await;
        events += 1;
    }
    projection.mark_synced().await;
    info!("Applied {} node events", events);

    let snapshot = projection.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_cloud=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Validate => {
            let config = load_config(args.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::ParseId { id } => {
            let parsed = ids::inspect(&id);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Command::ProjectNodes => {
            let config = load_config(args.config.as_deref())?;
            project_nodes(&config).await?;
        }
    }

    Ok(())
}
