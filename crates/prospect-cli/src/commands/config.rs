use anyhow::Result;
use prospect_etl::{config, Config};

fn redact(secret: Option<&str>) -> &'static str {
    match secret {
        Some(s) if !s.trim().is_empty() => "<set>",
        _ => "<not set>",
    }
}

/// Show the current effective configuration.
pub fn show_config() -> Result<()> {
    let config = Config::load()?;

    println!("Current Configuration");
    println!("=====================\n");

    println!("Config file: {}", config::config_file_path().display());

    let exists = config::config_file_path().exists();
    println!("File exists: {}\n", if exists { "yes" } else { "no (using defaults)" });

    println!("Settings:");
    println!("  companies_house_key: {}", redact(config.companies_house_key.as_deref()));
    println!("  opencage_key: {}", redact(config.opencage_key.as_deref()));
    println!("  max_concurrency: {}", config.max_concurrency);
    println!("  checkpoint_interval: {}", config.checkpoint_interval);
    println!("  row_timeout_secs: {}", config.row_timeout_secs);
    println!("  drain_grace_secs: {}", config.drain_grace_secs);
    println!("  http_timeout_secs: {}", config.http_timeout_secs);
    println!("  cache_path: {}", config.cache_path.display());
    println!("  id_column: {}", config.id_column);
    println!("  name_column: {}", config.name_column);
    println!("  headcount_periods: {}", config.headcount_periods.join(", "));
    println!(
        "  search: rate {} (floor {}, ceiling {})",
        config.search.rate, config.search.floor, config.search.ceiling
    );
    println!("  cache_ttl: {}", serde_json::to_string(&config.cache_ttl)?);

    println!("\nPriority: CLI args > ENV vars (PROSPECT_*) > Config file > Defaults");

    Ok(())
}

/// Show the config file path.
pub fn show_path() -> Result<()> {
    let config_path = config::config_file_path();
    println!("{}", config_path.display());
    Ok(())
}

/// Show example configuration.
pub fn show_example() -> Result<()> {
    print!("{}", config::example_config());
    Ok(())
}

/// Initialize config file with defaults.
pub fn init_config() -> Result<()> {
    let created = config::ensure_config_file()?;
    let config_path = config::config_file_path();

    if created {
        println!("✓ Created config file: {}", config_path.display());
        println!("\nEdit this file to set your Companies House key.");
    } else {
        println!("Config file already exists: {}", config_path.display());
    }

    Ok(())
}
