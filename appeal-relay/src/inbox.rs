use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::health::HealthHandle;
use crate::worker::{QueueError, UploadOutcome, UploadQueue};

const PROCESSING: &str = "processing";
const PROCESSED: &str = "processed";
const FAILED: &str = "failed";

/// Polls a drop directory and feeds new files to the upload queue. A file is claimed
/// by renaming it into `processing/`, so two watchers never take the same file.
pub struct InboxWatcher {
    root: PathBuf,
    queue: Arc<UploadQueue>,
    poll_interval: Duration,
    pending: Mutex<JoinSet<()>>,
}

impl InboxWatcher {
    pub fn new(root: PathBuf, queue: Arc<UploadQueue>, poll_interval: Duration) -> Self {
        Self {
            root,
            queue,
            poll_interval,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Creates the working directories and returns files a previous run left in
    /// `processing/` to the inbox.
    pub async fn prepare(&self) -> io::Result<()> {
        for dir in [PROCESSING, PROCESSED, FAILED] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }

        let mut entries = tokio::fs::read_dir(self.root.join(PROCESSING)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let target = self.root.join(entry.file_name());
                tokio::fs::rename(entry.path(), &target).await?;
                info!(path = %target.display(), "recovered unfinished upload");
            }
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, liveness: HealthHandle) {
        if let Err(e) = self.prepare().await {
            error!(root = %self.root.display(), "failed to prepare inbox: {}", e);
            return;
        }
        info!(root = %self.root.display(), "watching inbox");

        loop {
            if *shutdown.borrow() {
                break;
            }
            liveness.report_healthy();

            if let Err(e) = self.scan_once().await {
                error!(root = %self.root.display(), "inbox scan failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("inbox watcher stopping, waiting for claimed files");
        self.wait_pending().await;
    }

    /// Claims and submits every file currently in the inbox. Returns how many were
    /// handed to the queue.
    pub async fn scan_once(&self) -> io::Result<usize> {
        self.reap_settled().await;

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut submitted = 0;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() || is_hidden(&entry.path()) {
                continue;
            }
            let name = entry.file_name();
            let claimed = self.root.join(PROCESSING).join(&name);
            if let Err(e) = tokio::fs::rename(entry.path(), &claimed).await {
                // Another watcher got there first
                warn!(path = %entry.path().display(), "could not claim file: {}", e);
                continue;
            }

            match self.queue.submit(&claimed).await {
                Ok(handle) => {
                    submitted += 1;
                    let root = self.root.clone();
                    self.pending.lock().await.spawn(async move {
                        let target = match handle.outcome().await {
                            Some(UploadOutcome::Processed(_)) => PROCESSED,
                            Some(UploadOutcome::Failed(reason)) => {
                                warn!(path = %claimed.display(), "upload failed: {}", reason);
                                FAILED
                            }
                            None => {
                                warn!(path = %claimed.display(), "upload abandoned");
                                return;
                            }
                        };
                        settle(&root, &claimed, target).await;
                    });
                }
                Err(QueueError::Rejected(e)) => {
                    warn!(path = %claimed.display(), "upload rejected: {}", e);
                    settle(&self.root, &claimed, FAILED).await;
                }
                Err(e @ (QueueError::Full | QueueError::Closed)) => {
                    // Leave it for a later scan
                    warn!(path = %claimed.display(), "upload deferred: {}", e);
                    if let Err(e) = tokio::fs::rename(&claimed, self.root.join(&name)).await {
                        error!(path = %claimed.display(), "failed to return file to inbox: {}", e);
                    }
                    break;
                }
            }
        }

        Ok(submitted)
    }

    /// Settle tasks not yet reaped.
    pub async fn pending_settles(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn reap_settled(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(result) = pending.try_join_next() {
            if let Err(e) = result {
                error!("inbox settle task panicked: {}", e);
            }
        }
    }

    /// Waits until every submitted file has been moved to its final directory.
    pub async fn wait_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!("inbox settle task panicked: {}", e);
            }
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

async fn settle(root: &Path, claimed: &Path, target_dir: &str) {
    let Some(name) = claimed.file_name() else {
        return;
    };
    let target = root.join(target_dir).join(name);
    match tokio::fs::rename(claimed, &target).await {
        Ok(()) => info!(path = %target.display(), "upload settled"),
        Err(e) => error!(path = %claimed.display(), "failed to move upload: {}", e),
    }
}
