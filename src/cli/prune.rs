// Prune command

use anyhow::Result;

use crate::config::Config;
use crate::indexing::prune::prune_missing_files;
use crate::session::IndexSession;

pub async fn prune_project(project: String) -> Result<()> {
    let mut config = Config::from_project_dir(&project);
    super::resolve_database_location(&mut config, &project);

    let mut session = IndexSession::open(&config)?;
    let pruned = prune_missing_files(session.storage_mut())?;

    println!("Pruned {} vanished files from the index", pruned);
    Ok(())
}
