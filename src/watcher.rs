//! Filesystem watcher feeding the sender pipeline.
//!
//! Translates change notifications into replication calls: creates and
//! writes re-process the file, metadata changes propagate ownership,
//! removals delete, and rename FROM/TO notifications are paired within a
//! configurable window. Per-event work runs in short-lived tasks bounded
//! by the configured parallelism so the watch loop never blocks.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sender::FileReplicator;

/// Pairs RENAME-FROM notifications with their RENAME-TO counterpart.
///
/// A FROM without a TO inside the window means the file left the tree and
/// is treated as a removal; a TO without a FROM is a creation.
#[derive(Debug)]
struct RenameTracker {
    pending: VecDeque<(PathBuf, Instant)>,
    window: Duration,
}

impl RenameTracker {
    fn new(window: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            window,
        }
    }

    fn record_from(&mut self, path: PathBuf, now: Instant) {
        self.pending.push_back((path, now));
    }

    /// Take the oldest un-expired FROM for an arriving TO.
    ///
    /// Expired entries are left for [`Self::expired`] to drain.
    fn pair_to(&mut self, now: Instant) -> Option<PathBuf> {
        let (_, seen) = self.pending.front()?;
        if now.duration_since(*seen) <= self.window {
            self.pending.pop_front().map(|(path, _)| path)
        } else {
            None
        }
    }

    /// Drain every FROM older than the window.
    fn expired(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut out = Vec::new();
        while let Some((_, seen)) = self.pending.front() {
            if now.duration_since(*seen) <= self.window {
                break;
            }
            if let Some((path, _)) = self.pending.pop_front() {
                out.push(path);
            }
        }
        out
    }
}

/// Watch the replicator's source root and dispatch replication calls for
/// every notification until the watcher channel closes.
///
/// # Errors
///
/// Returns an error if the watcher cannot be created or attached to the
/// root.
pub async fn watch(replicator: Arc<FileReplicator>) -> Result<()> {
    let root = replicator.client().file_root().to_path_buf();
    let limit = Arc::new(Semaphore::new(replicator.config().parallelism.max(1)));
    // interval() panics on a zero period; clamp a zero window to 1ms.
    let window = replicator
        .config()
        .rename_window
        .max(Duration::from_millis(1));
    let mut renames = RenameTracker::new(window);

    let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(1024);
    let mut watcher = notify::recommended_watcher(move |event| {
        // Blocks the watcher thread when the channel is full; events are
        // never dropped on the floor.
        let _ = tx.blocking_send(event);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), "watching for changes");

    let mut sweep = tokio::time::interval(window);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                None => break,
                Some(Err(e)) => warn!(error = %e, "watch error"),
                Some(Ok(event)) => {
                    handle_event(&replicator, &root, event, &mut renames, &limit);
                }
            },
            _ = sweep.tick() => {
                for from in renames.expired(Instant::now()) {
                    if let Some(rel) = relative_to(&root, &from) {
                        spawn_delete(&replicator, &limit, rel);
                    }
                }
            }
        }
    }

    Ok(())
}

fn handle_event(
    replicator: &Arc<FileReplicator>,
    root: &Path,
    event: notify::Event,
    renames: &mut RenameTracker,
    limit: &Arc<Semaphore>,
) {
    match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            for path in &event.paths {
                if path.is_file() {
                    if let Some(rel) = relative_to(root, path) {
                        spawn_process(replicator, limit, rel);
                    }
                }
            }
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            for path in &event.paths {
                if path.is_file() {
                    if let Some(rel) = relative_to(root, path) {
                        spawn_process(replicator, limit, rel);
                    }
                }
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for path in &event.paths {
                if path.is_file() {
                    if let Some(rel) = relative_to(root, path) {
                        spawn_ownership(replicator, limit, rel);
                    }
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                if let (Some(from_rel), Some(to_rel)) =
                    (relative_to(root, from), relative_to(root, to))
                {
                    spawn_rename(replicator, limit, from_rel, to_rel);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                renames.record_from(path.clone(), Instant::now());
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            for path in &event.paths {
                let Some(to_rel) = relative_to(root, path) else {
                    continue;
                };
                match renames.pair_to(Instant::now()) {
                    Some(from) => {
                        if let Some(from_rel) = relative_to(root, &from) {
                            spawn_rename(replicator, limit, from_rel, to_rel);
                        }
                    }
                    // No FROM in the window: the file arrived from
                    // outside the tree; replicate it as a creation.
                    None => spawn_process(replicator, limit, to_rel),
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if let Some(rel) = relative_to(root, path) {
                    spawn_delete(replicator, limit, rel);
                }
            }
        }
        _ => {}
    }
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
    match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            Some(relative.to_string_lossy().into_owned())
        }
        _ => {
            debug!(path = %path.display(), "event outside root, ignoring");
            None
        }
    }
}

fn spawn_process(replicator: &Arc<FileReplicator>, limit: &Arc<Semaphore>, rel: String) {
    let replicator = Arc::clone(replicator);
    let limit = Arc::clone(limit);
    tokio::spawn(async move {
        let Ok(_permit) = limit.acquire_owned().await else {
            return;
        };
        if let Err(e) = replicator.process_file(&rel).await {
            warn!(path = rel, error = %e, "failed to process file");
        }
    });
}

fn spawn_ownership(replicator: &Arc<FileReplicator>, limit: &Arc<Semaphore>, rel: String) {
    let replicator = Arc::clone(replicator);
    let limit = Arc::clone(limit);
    tokio::spawn(async move {
        let Ok(_permit) = limit.acquire_owned().await else {
            return;
        };
        if let Err(e) = replicator.update_ownership(&rel).await {
            warn!(path = rel, error = %e, "failed to update ownership");
        }
    });
}

fn spawn_delete(replicator: &Arc<FileReplicator>, limit: &Arc<Semaphore>, rel: String) {
    let replicator = Arc::clone(replicator);
    let limit = Arc::clone(limit);
    tokio::spawn(async move {
        let Ok(_permit) = limit.acquire_owned().await else {
            return;
        };
        if let Err(e) = replicator.delete_file(&rel).await {
            warn!(path = rel, error = %e, "failed to delete file");
        }
    });
}

fn spawn_rename(
    replicator: &Arc<FileReplicator>,
    limit: &Arc<Semaphore>,
    from_rel: String,
    to_rel: String,
) {
    let replicator = Arc::clone(replicator);
    let limit = Arc::clone(limit);
    tokio::spawn(async move {
        let Ok(_permit) = limit.acquire_owned().await else {
            return;
        };
        if let Err(e) = replicator.rename_file(&from_rel, &to_rel).await {
            warn!(from = from_rel, to = to_rel, error = %e, "failed to rename file");
        }
    });
}
