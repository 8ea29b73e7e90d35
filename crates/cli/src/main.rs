mod cli;
mod synthetic;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use preload_core::LoaderConfig;
use preload_loader::{
    CacheLoaderContext, CachePlan, DependentLoaderSpec, FactoryRegistry, FullLoadFactory, LoadKind, PlanSpec,
    Relationship, TopLevelLoader,
};
use tracing::{error, info};

use crate::cli::{CliArgs, Command, RunArgs};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    preload_core::config::load_dotenv();
    let args = CliArgs::parse();

    match args.command {
        Command::Run(run_args) => run(run_args),
        Command::CheckPlan { path } => check_plan(&path),
    }
}

fn load_config(args: &RunArgs) -> Result<LoaderConfig> {
    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => LoaderConfig::from_env(),
    };
    if let Some(threads) = args.threads {
        config.threads_per_db_server = threads;
    }
    if let Some(task_size) = args.task_size {
        config.task_size = task_size;
    }
    if let Some(stripe_size) = args.stripe_size {
        config.stripe_size = stripe_size;
    }
    config.validate().context("invalid loader config")?;
    Ok(config)
}

fn default_plan() -> CachePlan {
    CachePlan::new()
        .with_top_level(TopLevelLoader::new("Contract", Arc::new(FullLoadFactory)))
        .with_dependent(DependentLoaderSpec::new(
            Relationship::new("product", "Contract", "Product", &[("productId", "id")]),
            Arc::new(FullLoadFactory),
        ))
}

fn read_plan(path: &std::path::Path) -> Result<CachePlan> {
    let spec = PlanSpec::from_file(path).with_context(|| format!("failed to read plan {}", path.display()))?;
    spec.into_plan(&FactoryRegistry::with_builtins())
        .context("failed to resolve plan factories")
}

fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    config.log_summary();

    let plan = match &args.plan {
        Some(path) => read_plan(path)?,
        None => default_plan(),
    };
    let catalog = synthetic::catalog(args.owners, args.products, &args.business_dates);
    info!(
        "Synthetic catalog: {} contract(s), {} product(s), {} issuer(s)",
        args.owners,
        args.products,
        synthetic::ISSUERS
    );

    let context = CacheLoaderContext::new(config, Arc::new(catalog), LoadKind::Initial, args.business_dates.clone());
    let result = context.execute(&plan);

    let output = if args.summary {
        match &result {
            Ok(summary) => serde_json::to_string_pretty(summary)?,
            Err(_) => serde_json::to_string_pretty(&context.monitor())?,
        }
    } else {
        serde_json::to_string_pretty(&context.monitor())?
    };
    println!("{}", output);

    match result {
        Ok(summary) => {
            info!("Loaded {} row(s) with {} task(s)", summary.rows, summary.tasks);
            Ok(())
        }
        Err(e) => {
            error!("Load failed: {}", e);
            Err(e).context("cache load failed")
        }
    }
}

fn check_plan(path: &std::path::Path) -> Result<()> {
    let plan = read_plan(path)?;
    plan.check_prerequisite_cycles().context("plan has a prerequisite cycle")?;
    for loader in &plan.top_level {
        println!("top-level  {:?}", loader);
    }
    for dependent in &plan.dependents {
        println!(
            "dependent  {} via {}",
            dependent.relationship,
            dependent.helper_factory.name()
        );
    }
    Ok(())
}
