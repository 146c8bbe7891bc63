use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info};
use std::env;
use std::sync::Arc;

mod config;
mod error;
mod job;
mod matching;
mod metrics;
mod models;
mod notify;
mod progress;
mod util;

use crate::config::ReconcileConfig;
use crate::job::mysql_store::{make_pool, MySqlJobStore};
use crate::job::{spawn_lock_janitor, JobManager, JobStore, MemoryJobStore};
use crate::models::Record;
use crate::notify::{EngineEvent, EventBus};
use crate::util::envfile::{load_dotenv_if_present, parse_env_file, write_env_template};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn env_or_arg(env_map: &std::collections::HashMap<String, String>, key: &str, args: &[String], idx: usize) -> Option<String> {
    env_map
        .get(key)
        .cloned()
        .or_else(|| std::env::var(key).ok())
        .or_else(|| args.get(idx).cloned())
}

/// "boCol=partnerCol,boCol2=partnerCol2"; a bare "col" pairs with itself.
fn parse_pairs(spec: &str) -> Vec<(String, String)> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|part| match part.split_once('=') {
            Some((bo, partner)) => (bo.trim().to_string(), partner.trim().to_string()),
            None => (part.to_string(), part.to_string()),
        })
        .collect()
}

fn load_records(path: &str) -> Result<Vec<Record>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset file {path}"))?;
    let records: Vec<Record> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {path} as a JSON array of records"))?;
    Ok(records)
}

async fn run() -> Result<()> {
    load_dotenv_if_present()?;
    let env_map = parse_env_file().unwrap_or_default();
    let args: Vec<String> = env::args().collect();

    // Utility subcommand: generate .env.template
    if args.get(1).map(|s| s.as_str()) == Some("env-template") {
        let path = args.get(2).cloned().unwrap_or_else(|| ".env.template".to_string());
        write_env_template(&path)?;
        println!("Wrote {}. Copy to .env and edit values as needed.", path);
        return Ok(());
    }

    let bo_file = env_or_arg(&env_map, "RECON_BO_FILE", &args, 1);
    let partner_file = env_or_arg(&env_map, "RECON_PARTNER_FILE", &args, 2);
    let bo_key = env_or_arg(&env_map, "RECON_BO_KEY", &args, 3);
    let partner_key = env_or_arg(&env_map, "RECON_PARTNER_KEY", &args, 4);

    let (bo_file, partner_file, bo_key, partner_key) =
        match (bo_file, partner_file, bo_key, partner_key) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => {
                eprintln!(
                    "Usage: {} <bo.json> <partner.json> <bo_key> <partner_key> [out_path]",
                    args.first().map(String::as_str).unwrap_or("txn_reconciler")
                );
                eprintln!("       {} env-template [path]   # generate a .env.template", args.first().map(String::as_str).unwrap_or("txn_reconciler"));
                eprintln!("Environment: RECON_BO_FILE, RECON_PARTNER_FILE, RECON_BO_KEY, RECON_PARTNER_KEY,");
                eprintln!("             RECON_KEY_PAIRS, RECON_COMPARE_PAIRS, RECON_TOLERANCE, RECON_DB_URL");
                std::process::exit(2);
            }
        };

    let tolerance: f64 = env_map
        .get("RECON_TOLERANCE")
        .cloned()
        .or_else(|| std::env::var("RECON_TOLERANCE").ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0);

    let mut config = ReconcileConfig::new(bo_key, partner_key).with_tolerance(tolerance);
    if let Some(spec) = env_map.get("RECON_KEY_PAIRS").cloned().or_else(|| std::env::var("RECON_KEY_PAIRS").ok()) {
        for (bo, partner) in parse_pairs(&spec) {
            config = config.with_key_pair(bo, partner);
        }
    }
    if let Some(spec) = env_map.get("RECON_COMPARE_PAIRS").cloned().or_else(|| std::env::var("RECON_COMPARE_PAIRS").ok()) {
        for (bo, partner) in parse_pairs(&spec) {
            config = config.with_compare_pair(bo, partner);
        }
    }

    info!("Loading extracts: {} / {}", bo_file, partner_file);
    let bo = load_records(&bo_file)?;
    let partner = load_records(&partner_file)?;
    info!("Loaded {} BO rows, {} partner rows", bo.len(), partner.len());

    let store: Arc<dyn JobStore> = match env_map
        .get("RECON_DB_URL")
        .cloned()
        .or_else(|| std::env::var("RECON_DB_URL").ok())
        .filter(|s| !s.trim().is_empty())
    {
        Some(url) => {
            info!("Using MySQL job store");
            let pool = make_pool(&url).await?;
            let store = MySqlJobStore::new(pool);
            store.init_schema().await?;
            Arc::new(store)
        }
        None => Arc::new(MemoryJobStore::new()),
    };

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Progress(p) => info!(
                    "Progress: {:.1}% | ETA: {}s ({} / {}) | {}",
                    p.percent, p.eta_secs, p.processed, p.total, p.current_step
                ),
                EngineEvent::StatusChanged { job_id, status } => {
                    info!("[job {}] -> {}", job_id, status)
                }
            }
        }
    });

    let manager = Arc::new(JobManager::new(store).with_bus(bus));
    let janitor = spawn_lock_janitor(manager.clone(), std::time::Duration::from_secs(60));

    let owner = std::env::var("RECON_OWNER").unwrap_or_else(|_| "cli".to_string());
    let job_id = manager.create_job(bo, partner, config, &owner).await?;
    let summary = manager.start_processing(&job_id).await?;
    info!(
        "Reconciled: {} matched, {} mismatched, {} BO-only, {} partner-only in {} ms",
        summary.total_matches,
        summary.total_mismatches,
        summary.total_bo_only,
        summary.total_partner_only,
        summary.execution_time_ms
    );

    let report = manager.report(&job_id).await?;
    let rendered = serde_json::to_string_pretty(&report)?;
    match args.get(5) {
        Some(out_path) => {
            std::fs::write(out_path, rendered)
                .with_context(|| format!("Failed to write report to {out_path}"))?;
            info!("Report written to {}", out_path);
        }
        None => println!("{}", rendered),
    }

    janitor.abort();
    event_logger.abort();
    info!("Done.");
    Ok(())
}
