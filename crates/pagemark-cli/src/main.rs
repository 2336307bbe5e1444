//! Pagemark command-line tool
//!
//! Inspects, imports, exports and synchronizes annotation documents stored on
//! the local filesystem. Each `--mirror` directory acts as a secondary
//! provider that receives committed documents and takes part in sync.
//!
//! ```text
//! pagemark list
//! pagemark show <document-id> [--page N]
//! pagemark import notes.json
//! pagemark export <document-id> [--pages] [-o out.json]
//! pagemark --mirror /mnt/backup sync --strategy merge
//! pagemark --mirror /mnt/backup watch --interval 60
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use pagemark_core::storage::{FileProvider, ProviderSet};
use pagemark_core::{AnnotatorConfig, ConflictStrategy, DocumentStore, SyncManager, SyncReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "pagemark")]
#[command(about = "Manage and synchronize document annotations")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "PAGEMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Primary storage directory (overrides the config file)
    #[arg(long, env = "PAGEMARK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Secondary storage directory; repeat for several mirrors
    #[arg(long = "mirror")]
    mirrors: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored documents
    List,
    /// Print a summary of one document
    Show {
        document_id: String,
        /// Only show this page
        #[arg(long)]
        page: Option<u32>,
    },
    /// Import a document from an exported JSON file
    Import { file: PathBuf },
    /// Export a document as JSON
    Export {
        document_id: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Emit the per-page export feed instead of the raw document
        #[arg(long)]
        pages: bool,
    },
    /// Run one sync pass against every mirror
    Sync {
        /// Conflict strategy (latest, merge, manual)
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
    },
    /// Sync periodically until interrupted
    Watch {
        /// Seconds between passes
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<AnnotatorConfig> {
    let mut config = match &cli.config {
        Some(path) => AnnotatorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AnnotatorConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    Ok(config)
}

fn build_store(cli: &Cli, config: AnnotatorConfig) -> anyhow::Result<DocumentStore> {
    let primary = match &config.data_dir {
        Some(dir) => FileProvider::new(dir.clone()),
        None => FileProvider::default_location(),
    }
    .context("opening primary storage")?;
    log::info!("Primary storage: {}", primary.base_path().display());

    let mut providers = ProviderSet::new(Arc::new(primary.with_name("local")));
    for dir in &cli.mirrors {
        let mirror = FileProvider::new(dir.clone())
            .with_context(|| format!("opening mirror {}", dir.display()))?
            .with_name(dir.display().to_string());
        providers = providers.with_secondary(Arc::new(mirror));
    }
    Ok(DocumentStore::new(providers, config))
}

fn print_report(report: &SyncReport) {
    for provider in &report.providers {
        match &provider.error {
            Some(e) => println!("{}: failed ({})", provider.provider, e),
            None => println!(
                "{}: pushed {}, pulled {}, conflicts {} ({} resolved, {} deferred)",
                provider.provider,
                provider.pushed,
                provider.pulled,
                provider.conflicts_found,
                provider.conflicts_resolved,
                provider.deferred
            ),
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;
    if let Command::Sync { strategy: Some(strategy) }
    | Command::Watch {
        strategy: Some(strategy),
        ..
    } = &cli.command
    {
        config.sync.strategy = *strategy;
    }
    let store = Arc::new(build_store(&cli, config)?);

    match cli.command {
        Command::List => {
            for id in store.list_documents().await? {
                match store.load(&id).await? {
                    Some(doc) => println!(
                        "{}\t{} pages\t{} annotations\tv{}",
                        id,
                        doc.total_pages(),
                        doc.annotation_count(),
                        doc.version
                    ),
                    None => println!("{}\t(unreadable)", id),
                }
            }
        }
        Command::Show { document_id, page } => {
            let doc = store
                .load(&document_id)
                .await?
                .with_context(|| format!("no document {}", document_id))?;
            if let Some(title) = &doc.metadata.title {
                println!("{}", title);
            }
            println!(
                "{}: {} pages, {} annotations, version {}",
                doc.document_id,
                doc.total_pages(),
                doc.annotation_count(),
                doc.version
            );
            // Empty pages are skipped unless one was asked for.
            let (pages, single): (Vec<u32>, bool) = match page {
                Some(page) => (vec![page], true),
                None => ((1..=doc.total_pages()).collect(), false),
            };
            for number in pages {
                let page = doc.page(number)?;
                if page.annotations.is_empty() && !single {
                    continue;
                }
                println!("page {}:", number);
                for annotation in &page.annotations {
                    println!(
                        "  {} {:?} ({} points)",
                        annotation.id,
                        annotation.annotation_type(),
                        annotation.coordinates.len()
                    );
                }
            }
        }
        Command::Import { file } => {
            let json = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = store.import_json(&json).await?;
            println!(
                "Imported {} ({} annotations)",
                doc.document_id,
                doc.annotation_count()
            );
        }
        Command::Export {
            document_id,
            output,
            pages,
        } => {
            let json = if pages {
                serde_json::to_string_pretty(&store.export_pages(&document_id).await?)?
            } else {
                store.export_json(&document_id).await?
            };
            match output {
                Some(path) => tokio::fs::write(&path, json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", json),
            }
        }
        Command::Sync { .. } => {
            let manager = SyncManager::new(Arc::clone(&store));
            let report = manager.sync_all().await;
            print_report(&report);
            for conflict in manager.pending_conflicts() {
                println!(
                    "unresolved {:?} conflict on {} with {}",
                    conflict.kind, conflict.document_id, conflict.provider
                );
            }
        }
        Command::Watch { interval, .. } => {
            let secs = interval.unwrap_or(store.config().sync.interval_secs).max(1);
            let manager = Arc::new(SyncManager::new(Arc::clone(&store)));
            let handle = manager.spawn_periodic(Duration::from_secs(secs));
            log::info!("Syncing every {}s, press Ctrl-C to stop", secs);
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
    }

    for outcome in store.flush_replication().await {
        if let Err(e) = outcome.result {
            log::warn!("Mirror {} is behind: {}", outcome.provider, e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("Starting Pagemark");
    run(Cli::parse()).await
}
