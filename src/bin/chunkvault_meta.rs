//! CLI entry point for chunkvault-meta: file record export/import tool.

use chunkvault::metadata::sqlite::SqliteMetadataStore;
use chunkvault::serialization::{export_metadata, import_metadata};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chunkvault-meta", about = "chunkvault file record export/import tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export file records to JSON
    Export {
        #[arg(long, default_value = "chunkvault.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
        #[arg(long, default_value = "-")]
        output: String,
    },
    /// Import file records from JSON
    Import {
        #[arg(long, default_value = "chunkvault.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
        #[arg(long, default_value = "-")]
        input: String,
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
}

fn resolve_db_path(db: Option<String>, config_path: &PathBuf) -> anyhow::Result<String> {
    if let Some(path) = db {
        return Ok(path);
    }
    let content = std::fs::read_to_string(config_path)?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let path = raw
        .get("metadata")
        .and_then(|m| m.get("sqlite"))
        .and_then(|s| s.get("path"))
        .and_then(|p| p.as_str())
        .unwrap_or("./data/metadata.db");
    Ok(path.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Export { config, db, output } => run_export(db, &config, &output).await,
        Commands::Import {
            config,
            db,
            input,
            replace,
        } => run_import(db, &config, &input, replace).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_export(db: Option<String>, config: &PathBuf, output: &str) -> anyhow::Result<()> {
    let db_path = resolve_db_path(db, config)?;
    let store = SqliteMetadataStore::new(&db_path)?;
    let json = export_metadata(&store).await?;
    if output == "-" {
        println!("{}", json);
    } else {
        std::fs::write(output, format!("{}\n", json))?;
        eprintln!("Exported to {}", output);
    }
    Ok(())
}

async fn run_import(
    db: Option<String>,
    config: &PathBuf,
    input: &str,
    replace: bool,
) -> anyhow::Result<()> {
    let db_path = resolve_db_path(db, config)?;
    let json = if input == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input)?
    };

    let store = SqliteMetadataStore::new(&db_path)?;
    let result = import_metadata(&store, &json, replace).await?;
    if replace {
        eprintln!("  files: {} removed", result.removed);
    }
    let mut msg = format!("  files: {} imported", result.imported);
    if result.skipped > 0 {
        msg.push_str(&format!(", {} skipped", result.skipped));
    }
    eprintln!("{}", msg);
    for w in &result.warnings {
        eprintln!("  WARNING: {}", w);
    }
    Ok(())
}
