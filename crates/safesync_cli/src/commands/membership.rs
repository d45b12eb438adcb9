//! Sync membership commands.

use super::Session;
use std::error::Error;

/// Runs the mark command.
pub fn mark(session: &Session, name: &str) -> Result<(), Box<dyn Error>> {
    if !session.registry.contains(name) {
        return Err(format!("Unknown database: {name}").into());
    }
    if session.tracker.mark(name)? {
        println!("✓ {name} will be synced");
    } else {
        println!("{name} is already marked");
    }
    Ok(())
}

/// Runs the unmark command.
pub fn unmark(session: &Session, name: &str) -> Result<(), Box<dyn Error>> {
    if session.tracker.unmark(name)? {
        println!("✓ {name} will no longer be synced");
    } else {
        println!("{name} is not marked");
    }
    Ok(())
}
