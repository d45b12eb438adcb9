//! Entry commands.

use super::Session;
use safesync_storage::{Entry, Passphrase};
use std::error::Error;

/// Prints the entries of `name`. Passwords are never printed.
pub fn list(session: &Session, name: &str, passphrase: &Passphrase) -> Result<(), Box<dyn Error>> {
    let model = session.registry.open(name, passphrase)?;
    let entries = model.entries()?;

    println!("{name} ({} entries, format {})", entries.len(), model.version_string()?);
    for entry in &entries {
        print!("  {:24} {:20}", entry.title, entry.user);
        if !entry.url.is_empty() {
            print!(" {}", entry.url);
        }
        println!();
    }
    Ok(())
}

/// Adds `entry` to `name` and records the edit for the next sync.
pub fn add(
    session: &Session,
    name: &str,
    passphrase: &Passphrase,
    entry: Entry,
) -> Result<(), Box<dyn Error>> {
    let model = session.registry.open(name, passphrase)?;
    let key = model.add_entry(entry)?;
    println!("✓ Added {key} to {name}");
    Ok(())
}
