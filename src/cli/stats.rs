// Stats command

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::session::IndexSession;
use crate::storage::Storage;

pub async fn show_stats(project: String) -> Result<()> {
    let mut config = Config::from_project_dir(&project);
    super::resolve_database_location(&mut config, &project);

    let session = IndexSession::open(&config)?;
    let stats = session.storage().stats()?;

    println!("Quarry Index Statistics");
    println!("=======================");
    println!("Database:   {}", config.index.database);
    println!("Files:      {}", stats.total_files);
    println!("Structures: {}", stats.total_structures);
    println!("Functions:  {}", stats.total_functions);
    println!("Constants:  {}", stats.total_constants);
    println!("Properties: {}", stats.total_properties);

    match stats.last_indexed.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)) {
        Some(when) => println!("Last index: {}", when.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last index: never"),
    }

    Ok(())
}
