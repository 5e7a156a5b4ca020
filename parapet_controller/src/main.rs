//! Parapet Controller - one protection cycle per invocation
//!
//! An external scheduler (cron, systemd timer, or similar) invokes this
//! binary periodically; each invocation runs a single cycle and exits.
//! Retry and scheduling policy live outside this process.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use parapet_common::{AddressSet, PolicyRule, ProtectionPolicy, RuleStatement};
use parapet_controller::config::Config;
use parapet_controller::cycle::Orchestrator;
use parapet_controller::stores::{http::FilterEngineClient, memory::MemoryStore, redis, Collaborators};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Live filtering engine + Redis metrics
    Live,
    /// In-memory stores seeded from configuration (local smoke runs)
    Memory,
}

#[derive(Parser)]
#[command(name = "parapet-controller")]
#[command(version)]
#[command(about = "Adaptive traffic-protection controller", long_about = None)]
struct Cli {
    /// Print the cycle summary as JSON to stdout
    #[arg(long)]
    json: bool,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Collaborator backends to run against
    #[arg(long, value_enum, default_value_t = Backend::Live)]
    backend: Backend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,parapet_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Configuration problems surface before any remote call
    let config = Config::from_env().context("invalid configuration")?;
    if cli.check_config {
        tracing::info!(policy = %config.policy.name, "configuration is valid");
        return Ok(());
    }

    tracing::info!(
        policy = %config.policy.name,
        address_set = %config.address_set.name,
        backend = ?cli.backend,
        "starting controller"
    );

    let collaborators = match cli.backend {
        Backend::Live => {
            let engine = Arc::new(FilterEngineClient::new(
                config.filter_api_url.clone(),
                config.filter_api_token.clone(),
            )?);
            tracing::info!("Connecting to Redis...");
            let client = redis::init_client(&config.redis_url).await?;
            let metrics = Arc::new(redis::RedisMetrics::new(
                client,
                config.metric_namespace.clone(),
            ));
            Collaborators {
                policies: engine.clone(),
                address_sets: engine.clone(),
                metrics,
                sampling: engine,
            }
        }
        Backend::Memory => {
            let store = Arc::new(seeded_memory_store(&config));
            store.collaborators()
        }
    };

    let orchestrator = Orchestrator::new(config, collaborators);
    match orchestrator.run(chrono::Utc::now()).await {
        Ok(summary) => {
            if cli.json {
                println!("{}", summary.to_json()?);
            } else {
                println!(
                    "{} (limit {} -> {}, ratio {:.3}, blocked {} requests, {} addresses)",
                    summary.message,
                    summary.previous_limit,
                    summary.new_limit,
                    summary.block_ratio,
                    summary.block_count,
                    summary.blocked_address_count
                );
            }
            Ok(())
        }
        Err(e) => {
            if e.is_conflict() {
                tracing::warn!(error = %e, "cycle lost an optimistic-concurrency race");
            } else {
                tracing::error!(error = %e, "cycle failed");
            }
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "error",
                        "stage": e.stage().map(|s| s.as_str()),
                        "conflict": e.is_conflict(),
                        "error": e.to_string(),
                    })
                );
            }
            Err(e.into())
        }
    }
}

/// Seed the in-memory backend with the configured policy (at the lower rate
/// bound) and an empty address set, enough for an end-to-end smoke run
fn seeded_memory_store(config: &Config) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_policy(ProtectionPolicy {
        id: config.policy.id.clone(),
        name: config.policy.name.clone(),
        scope: config.policy.scope,
        rules: vec![PolicyRule {
            name: config.rate_rule_name.clone(),
            priority: 0,
            statement: RuleStatement::RateBased {
                limit: config.min_rate_limit,
            },
        }],
    });
    store.insert_address_set(AddressSet {
        id: config.address_set.id.clone(),
        name: config.address_set.name.clone(),
        scope: config.address_set.scope,
        addresses: BTreeSet::new(),
    });
    store
}
