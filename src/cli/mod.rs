// CLI command implementations

pub mod index;
pub mod prune;
pub mod stats;
pub mod watch;

use std::path::Path;

use crate::config::Config;

/// Resolve a relative database location against the project root so
/// commands behave the same from any working directory.
pub fn resolve_database_location(config: &mut Config, project: &str) {
    let database = &config.index.database;
    if database == ":memory:" || Path::new(database).is_absolute() {
        return;
    }
    config.index.database = Path::new(project)
        .join(database)
        .to_string_lossy()
        .into_owned();
}
