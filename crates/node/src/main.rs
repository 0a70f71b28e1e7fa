mod admission;
mod audit;
mod condition;
mod config;
mod egress;
mod engine;
mod launch;
mod results;
mod scheduler;
mod spool;
mod supervisor;
mod unpack;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::SiteConfig;
use crate::engine::docker::DockerEngine;
use crate::supervisor::Supervisor;

#[derive(Debug, Parser)]
struct Args {
    /// Path to the site configuration file
    #[arg(long)]
    config: PathBuf,

    /// Restrict processing to the named sets (default: all configured sets)
    #[arg(long = "set")]
    sets: Vec<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let site = Arc::new(SiteConfig::load(&args.config)?);
    site.ensure_layout()?;

    let sets = if args.sets.is_empty() {
        site.domains.sets.keys().cloned().collect()
    } else {
        args.sets
    };
    for key in &sets {
        site.set(key)?;
    }

    let engine = Arc::new(DockerEngine::connect()?);
    let supervisor = Supervisor::new(site, engine);
    supervisor.run(sets).await
}
