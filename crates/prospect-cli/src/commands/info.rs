use anyhow::{Context, Result};
use std::path::Path;

use prospect_etl::{Config, InputTable};

pub fn show_info(config: &Config, input: &Path) -> Result<()> {
    let table = InputTable::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    println!("\n📋 {}\n", input.display());
    println!("  Rows: {}", table.len());
    println!("  Columns: {}\n", table.columns().len());

    let width = table
        .columns()
        .iter()
        .map(|c| c.chars().count())
        .max()
        .unwrap_or(0);
    for column in table.profile() {
        println!(
            "  {:<width$}  {:>6} non-empty",
            column.name,
            column.non_empty,
            width = width
        );
    }

    let columns = config.entity_columns();
    match table.require(&columns) {
        Ok(()) => println!("\n  ✓ Ready to enrich"),
        Err(e) => {
            println!("\n  ✗ {e}");
            println!("    Rename the columns or set id_column / name_column in the config.");
        }
    }

    Ok(())
}
