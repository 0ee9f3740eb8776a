use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostlens_common::{DiagnosticSink, HostlensConfig, TracingSink};
use hostlens_detect::{DetectorConfig, DualStrategyDetector};
use hostlens_identity::{
    decode, IdentityCache, IdentityProbe, IdentityResolver, Lookup, PassiveDataIngestor,
    PayloadLayout, ThreadMetadataKey,
};
use simhost::{Scenario, SimKind, SimNode, SimProbe};

#[derive(Parser)]
#[command(
    name = "hostlens-replay",
    about = "Replay captured payloads and simulated sessions through hostlens"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode payload files and print their records as JSON.
    Decode {
        #[arg(long)]
        layout: PathBuf,
        #[arg(required = true)]
        payloads: Vec<PathBuf>,
    },
    /// Ingest payloads, then look up one thread by its visible metadata.
    Lookup {
        #[arg(long)]
        layout: PathBuf,
        #[arg(long = "payload", required = true)]
        payloads: Vec<PathBuf>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        time: String,
        #[arg(long, default_value = "")]
        people: String,
    },
    /// Run detection and identity resolution against a simulated host.
    Simulate {
        #[arg(long)]
        layout: PathBuf,
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long = "payload")]
        payloads: Vec<PathBuf>,
        /// How long to let detection run.
        #[arg(long, default_value_t = 2_000)]
        for_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hostlens=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = match cli.command {
        Command::Decode { layout, payloads } => decode_files(&layout, &payloads)?,
        Command::Lookup {
            layout,
            payloads,
            subject,
            time,
            people,
        } => lookup(&layout, &payloads, &subject, &time, &people)?,
        Command::Simulate {
            layout,
            scenario,
            payloads,
            for_ms,
        } => simulate(&layout, &scenario, &payloads, Duration::from_millis(for_ms)).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn decode_files(layout: &Path, payloads: &[PathBuf]) -> Result<Value> {
    let layout = PayloadLayout::load(layout)?;
    let mut files = Vec::with_capacity(payloads.len());
    for path in payloads {
        let decoded = decode(&read(path)?, &layout)
            .with_context(|| format!("Failed to decode {}", path.display()))?;
        info!(
            file = %path.display(),
            records = decoded.records.len(),
            skipped = decoded.skipped,
            "Decoded payload"
        );
        files.push(json!({
            "file": path.display().to_string(),
            "records": decoded.records,
            "skipped": decoded.skipped,
        }));
    }
    Ok(Value::Array(files))
}

/// First payload counts as the preloaded one, the rest as intercepted.
fn ingest_all(ingestor: &PassiveDataIngestor, payloads: &[PathBuf]) -> Result<()> {
    for (i, path) in payloads.iter().enumerate() {
        let text = read(path)?;
        let report = if i == 0 {
            ingestor.ingest_preloaded(&text)
        } else {
            ingestor.ingest_intercepted(&text)
        }
        .with_context(|| format!("Failed to ingest {}", path.display()))?;
        info!(
            file = %path.display(),
            inserted = report.inserted,
            flipped = report.flipped,
            "Ingested"
        );
    }
    Ok(())
}

fn lookup(
    layout: &Path,
    payloads: &[PathBuf],
    subject: &str,
    time: &str,
    people: &str,
) -> Result<Value> {
    let cache = Arc::new(IdentityCache::new());
    let ingestor = PassiveDataIngestor::new(PayloadLayout::load(layout)?, cache.clone())?;
    ingest_all(&ingestor, payloads)?;

    let key = ThreadMetadataKey::new(subject, time, people);
    let (outcome, id) = match cache.lookup(&key) {
        Lookup::Concrete(id) => ("concrete", Some(id)),
        Lookup::Ambiguous => ("ambiguous", None),
        Lookup::Missing => ("missing", None),
    };
    Ok(json!({
        "key": key,
        "outcome": outcome,
        "id": id,
        "cache_size": cache.len(),
        "ambiguous_keys": cache.ambiguous_count(),
    }))
}

async fn simulate(
    layout: &Path,
    scenario: &Path,
    payloads: &[PathBuf],
    run_for: Duration,
) -> Result<Value> {
    let config = HostlensConfig::from_env()?;
    config.log_redacted();

    let scenario = Scenario::load(scenario)?;
    info!(scenario = scenario.name.as_str(), rows = scenario.rows.len(), "Loaded scenario");
    let (host, _nodes) = scenario.build();

    let cache = Arc::new(IdentityCache::new());
    let ingestor = PassiveDataIngestor::new(PayloadLayout::load(layout)?, cache.clone())?;
    ingest_all(&ingestor, payloads)?;

    let sink: Arc<dyn DiagnosticSink> = Arc::new(TracingSink);
    let detector = DualStrategyDetector::new(DetectorConfig::from_config(&config), sink.clone());
    let probe: Arc<dyn IdentityProbe<SimNode>> = Arc::new(SimProbe::new(host.clone()));
    let resolver = IdentityResolver::from_config(&config, cache, probe, sink);

    let mut stream = detector.stream(Arc::new(SimKind::new(host.clone())));
    let deadline = tokio::time::Instant::now() + run_for;
    let mut tracked = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            next = stream.next() => {
                let Some(entity) = next else { break };
                let id = resolver.resolve(&entity).await;
                info!(entity = %entity.id, node = %entity.node.0, resolved = id.is_some(), "Tracked entity");
                tracked.push(json!({
                    "entity": entity.id,
                    "node": entity.node.0,
                    "origin": entity.origin,
                    "attributes": entity.parsed.attributes,
                    "score": entity.parsed.score,
                    "id": id,
                }));
            }
        }
    }

    Ok(json!({
        "scenario": scenario.name,
        "tracked": tracked,
        "status": stream.status(),
        "probe_clicks": host.clicks(),
    }))
}
