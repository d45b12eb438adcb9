//! Registry commands: list, create, import, rename, remove and duplicate.

use super::Session;
use safesync_storage::Passphrase;
use serde::Serialize;
use std::error::Error;
use std::fs;
use std::path::Path;
use tracing::info;

/// One row of `list`.
#[derive(Debug, Serialize)]
pub struct DatabaseInfo {
    /// Friendly name.
    pub name: String,
    /// Backing file.
    pub file: String,
    /// Included in sync.
    pub marked: bool,
    /// Last synced remote revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Edited since the last sync.
    pub modified: bool,
}

/// Collects the registry listing.
pub fn collect(session: &Session) -> Result<Vec<DatabaseInfo>, Box<dyn Error>> {
    let mut rows = Vec::new();
    for name in session.registry.friendly_names() {
        let record = session.tracker.get(&name)?;
        rows.push(DatabaseInfo {
            file: session.registry.file_id_for(&name).unwrap_or_default(),
            marked: record.is_some(),
            revision: record
                .as_ref()
                .and_then(|r| r.revision.as_ref())
                .map(ToString::to_string),
            modified: record.is_some_and(|r| r.locally_modified),
            name,
        });
    }
    Ok(rows)
}

/// Runs the list command.
pub fn list(session: &Session, format: &str) -> Result<(), Box<dyn Error>> {
    let rows = collect(session)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("No databases in {:?}", session.dir);
                return Ok(());
            }
            for row in &rows {
                let sync = match (&row.revision, row.marked) {
                    (_, false) => "-".to_string(),
                    (None, true) => "never synced".to_string(),
                    (Some(rev), true) if row.modified => format!("rev {rev}, modified"),
                    (Some(rev), true) => format!("rev {rev}"),
                };
                println!("{:24} {:28} {}", row.name, row.file, sync);
            }
        }
    }
    Ok(())
}

/// Runs the create command.
pub fn create(
    session: &Session,
    name: &str,
    file: Option<&str>,
    passphrase: &Passphrase,
) -> Result<(), Box<dyn Error>> {
    let file_id = match file {
        Some(file) => file.to_string(),
        None => session.registry.unique_file_id(None)?,
    };
    session.registry.create(name, &file_id, passphrase)?;
    println!("✓ Created {name} ({file_id})");
    Ok(())
}

/// Runs the import command, copying `file` into the documents directory
/// first if it lives elsewhere.
pub fn import(
    session: &Session,
    name: &str,
    file: &Path,
    passphrase: &Passphrase,
) -> Result<(), Box<dyn Error>> {
    let file_id = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("Not a file name: {file:?}"))?;

    let target = session.dir.join(file_id);
    if !target.exists() {
        fs::copy(file, &target)?;
        info!("Copied {:?} to {:?}", file, target);
    } else if fs::canonicalize(&target)? != fs::canonicalize(file)? {
        return Err(format!("{file_id} already exists in {:?}", session.dir).into());
    }

    session.registry.import(name, file_id, passphrase)?;
    println!("✓ Imported {name} ({file_id})");
    Ok(())
}

/// Runs the rename command.
pub fn rename(session: &Session, old: &str, new: &str) -> Result<(), Box<dyn Error>> {
    session.registry.rename(old, new)?;
    println!("✓ Renamed {old} to {new}");
    Ok(())
}

/// Runs the remove command.
pub fn remove(session: &Session, name: &str) -> Result<(), Box<dyn Error>> {
    session.registry.remove(name)?;
    println!("✓ Removed {name}");
    Ok(())
}

/// Runs the duplicate command.
pub fn duplicate(session: &Session, old: &str, new: &str) -> Result<(), Box<dyn Error>> {
    let file_id = session.registry.duplicate(old, new)?;
    println!("✓ Duplicated {old} as {new} ({file_id})");
    Ok(())
}
