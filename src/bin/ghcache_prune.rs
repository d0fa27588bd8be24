//! Run one prune sweep over a partitioned disk cache and exit.
//! Useful from cron when the proxy itself runs without a pruner.

use anyhow::{bail, Context};
use ghcache::Pruner;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let cache_dir = match (args.next(), args.next()) {
        (Some(dir), None) if dir != "-h" && dir != "--help" => PathBuf::from(dir),
        _ => bail!("usage: ghcache-prune <cache-dir>"),
    };
    let cache_dir = cache_dir
        .canonicalize()
        .with_context(|| format!("cache directory {} is not accessible", cache_dir.display()))?;

    let report = Pruner::new(&cache_dir).sweep().await;
    println!(
        "{}: deleted {}, kept {}, skipped {}, failed {}",
        cache_dir.display(),
        report.deleted.len(),
        report.kept.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for path in &report.failed {
        eprintln!("  failed to delete {}", path.display());
    }
    Ok(())
}
