//! Sync command implementation.

use super::Session;
use safesync_storage::Passphrase;
use safesync_sync::{
    CancelSignal, ConflictResolver, DirRemoteStore, EntryChoice, SyncConfig, SyncDriver,
    SyncOutcome, Strategy,
};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Syncs `name` with the remote directory.
///
/// A conflict is resolved with `strategy`; without one the conflict is
/// reported and nothing changes. With [`Strategy::Merge`], `prefer` picks the
/// side kept for every conflicting entry.
pub fn run(
    session: &Session,
    remote_dir: &Path,
    name: &str,
    passphrase: &Passphrase,
    strategy: Option<Strategy>,
    prefer: Option<EntryChoice>,
) -> Result<(), Box<dyn Error>> {
    session.registry.open(name, passphrase)?;

    let remote = Arc::new(DirRemoteStore::open(remote_dir)?);
    let driver = SyncDriver::new(
        Arc::clone(&session.registry),
        Arc::clone(&session.tracker),
        remote,
        SyncConfig::default(),
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cancel = CancelSignal::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling sync");
                interrupt.cancel();
            }
        });

        match driver.sync(name, &cancel).await? {
            SyncOutcome::UpToDate => println!("✓ {name} is up to date"),
            SyncOutcome::Uploaded { revision } => {
                println!("✓ Uploaded {name} (revision {revision})");
            }
            SyncOutcome::Adopted { revision } => {
                println!("✓ Updated {name} from remote (revision {revision})");
            }
            SyncOutcome::Conflict(resolver) => resolve(resolver, strategy, prefer, &cancel).await?,
        }

        let stats = driver.stats();
        debug!(
            uploads = stats.uploads,
            downloads = stats.downloads,
            retries = stats.retries,
            "sync finished"
        );
        Ok(())
    })
}

async fn resolve(
    resolver: ConflictResolver,
    strategy: Option<Strategy>,
    prefer: Option<EntryChoice>,
    cancel: &CancelSignal,
) -> Result<(), Box<dyn Error>> {
    let name = resolver.name().to_string();

    let Some(strategy) = strategy else {
        println!(
            "✗ {name} changed both locally and on the remote (remote revision {})",
            resolver.remote_revision()
        );
        println!("  Rerun with --strategy keep-local, keep-remote or merge");
        return Err(format!("Unresolved conflict in {name}").into());
    };

    let revision = match strategy {
        Strategy::KeepLocal => resolver.keep_local(cancel).await?,
        Strategy::KeepRemote => resolver.keep_remote()?,
        Strategy::Merge => {
            let mut plan = resolver.plan_merge()?;
            if let Some(choice) = prefer {
                plan.choose_all(choice);
            }
            if !plan.is_complete() {
                println!("Conflicting entries (choose a side with --prefer local|remote):");
                for conflict in plan.conflicts() {
                    println!(
                        "  {:24} local user {:16} remote user {}",
                        conflict.local.title, conflict.local.user, conflict.remote.user
                    );
                }
            }
            println!(
                "  {} conflicting, {} adopted from remote",
                plan.conflicts().len(),
                plan.adopted_count()
            );
            resolver.merge(plan, cancel).await?
        }
    };

    println!("✓ Resolved {name} (revision {revision})");
    Ok(())
}
