// Bulk project indexing command

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;

use crate::config::Config;
use crate::indexing::pipeline::{FileIndexer, IndexOutcome, SkipStrategy};
use crate::indexing::project::{collect_candidates, ScanFilter};
use crate::session::IndexSession;
use crate::storage::sqlite::{DatabaseLocation, SqliteStorage};
use crate::storage::Storage;

pub async fn index_project(project: String, rebuild: bool) -> Result<()> {
    info!("Indexing project: {}", project);

    let mut config = Config::from_project_dir(&project);
    super::resolve_database_location(&mut config, &project);

    println!("Quarry Indexer v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", project);
    println!("Database: {}", config.index.database);
    println!("Extensions: {}", config.index.extensions.join(", "));

    if rebuild {
        let location = DatabaseLocation::parse(&config.index.database);
        let mut storage = SqliteStorage::open(&location)?;
        storage.rebuild()?;
        println!("Rebuild: index dropped and recreated");
    }

    let mut session = IndexSession::open(&config)?;
    let filter = ScanFilter::new(&config.index.extensions, &config.index.exclude)?;

    println!("\nScanning project files...");
    let candidates = collect_candidates(
        &[PathBuf::from(&project)],
        &filter,
        session.storage(),
        &|_| false,
    )?;
    println!("Found {} files needing (re)indexing", candidates.len());

    let bar = ProgressBar::new(candidates.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for candidate in candidates {
        bar.set_message(candidate.uri.clone());
        let source = match std::fs::read_to_string(&candidate.path) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", candidate.uri, e);
                failed += 1;
                bar.inc(1);
                continue;
            }
        };

        let strategy = SkipStrategy::Timestamp {
            disk_mtime: candidate.disk_mtime,
            overridden: false,
        };
        match FileIndexer::new(session.storage_mut()).index(&candidate.uri, &source, strategy) {
            Ok(IndexOutcome::Indexed) => indexed += 1,
            Ok(IndexOutcome::Skipped) => skipped += 1,
            Err(e) if e.is_fatal() => {
                bar.abandon();
                bail!("fatal storage failure, aborting: {e}");
            }
            Err(e) => {
                tracing::warn!("Indexing {} failed: {}", candidate.uri, e);
                failed += 1;
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    let stats = session.storage().stats()?;
    println!("\nIndexing complete:");
    println!("  Indexed: {}", indexed);
    println!("  Skipped: {}", skipped);
    println!("  Failed:  {}", failed);
    println!(
        "  Index now holds {} files, {} structures, {} functions",
        stats.total_files, stats.total_structures, stats.total_functions
    );

    Ok(())
}
