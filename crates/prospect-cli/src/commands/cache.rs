use anyhow::{Context, Result};

use prospect_etl::enrich::SqliteCacheStore;
use prospect_etl::{Config, KeyedCache};

fn open(config: &Config) -> Result<KeyedCache> {
    let store = SqliteCacheStore::open(&config.cache_path)
        .with_context(|| format!("Failed to open cache {}", config.cache_path.display()))?;
    Ok(KeyedCache::new(std::sync::Arc::new(store)))
}

pub fn show_stats(config: &Config) -> Result<()> {
    let stats = open(config)?.stats()?;

    println!("\n🗄  Response cache\n");
    println!("  Path: {}", config.cache_path.display());
    println!("  Entries: {}", stats.entries);
    println!("  Expired: {}", stats.expired);
    println!("  Stored values: {} bytes", stats.bytes);

    if stats.expired > 0 {
        println!("\n  Run `prospect cache purge` to remove expired entries");
    }
    Ok(())
}

pub fn purge(config: &Config) -> Result<()> {
    let removed = open(config)?.purge_expired()?;
    println!("✓ Removed {removed} expired entries");
    Ok(())
}

pub fn clear(config: &Config) -> Result<()> {
    let removed = open(config)?.clear()?;
    println!("✓ Removed {removed} entries");
    Ok(())
}
