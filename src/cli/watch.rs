// Watch command: live reindexing of a project

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::indexing::debounce::Debouncer;
use crate::indexing::project::ScanFilter;
use crate::normalize;
use crate::service::{IndexResponse, IndexingService};
use crate::session::IndexSession;

pub async fn watch_project(project: String) -> Result<()> {
    let mut config = Config::from_project_dir(&project);
    super::resolve_database_location(&mut config, &project);

    let session = IndexSession::open(&config)?;
    let service = Arc::new(IndexingService::start(session, &config)?);
    let filter = ScanFilter::new(&config.index.extensions, &config.index.exclude)?;
    let debouncer = Arc::new(Debouncer::new(Duration::from_millis(config.index.debounce_ms)));

    // One shared drain for responses of watcher-triggered reindexes.
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            match response {
                IndexResponse::Finished { uri, succeeded } if !succeeded => {
                    debug!("Reindex of {} did not succeed", uri);
                }
                IndexResponse::Progress(progress) => {
                    debug!("{} ({:.0}%)", progress.uri, progress.percentage());
                }
                _ => {}
            }
        }
    });

    // Startup: drop vanished files, then bring the whole project up to
    // date before watching.
    service.prune();
    service.index(&project, false, response_tx.clone(), None);

    info!("Watching {} for changes...", project);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(e) => error!("File watch error: {}", e),
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;
    watcher
        .watch(&PathBuf::from(&project), RecursiveMode::Recursive)
        .context("Failed to start file watcher")?;

    while let Some(event) = event_rx.recv().await {
        handle_event(event, &filter, &service, &debouncer, &response_tx);
    }

    Ok(())
}

fn handle_event(
    event: Event,
    filter: &ScanFilter,
    service: &Arc<IndexingService>,
    debouncer: &Arc<Debouncer>,
    response_tx: &mpsc::UnboundedSender<IndexResponse>,
) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in &event.paths {
                if !filter.matches(path) {
                    continue;
                }
                let uri = normalize::normalize_path(path);
                debug!("Change detected: {}", uri);
                let service = Arc::clone(service);
                let response_tx = response_tx.clone();
                let key = uri.clone();
                // Bursts of edits collapse to one reindex of the final
                // content.
                debouncer.schedule(&key, async move {
                    service.index(&uri, true, response_tx, None);
                });
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if !filter.matches(path) {
                    continue;
                }
                let uri = normalize::normalize_path(path);
                debug!("Removal detected: {}", uri);
                debouncer.cancel(&uri);
                service.remove_file(&uri);
            }
        }
        _ => {}
    }
}
