//! Table of active uploads keyed by final file path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::RelayError;
use crate::upload::{StopReason, UploadTask};

/// What happens when a second upload targets a path already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Stop the older upload with an error and let the newer one through.
    #[default]
    Supersede,
    /// Refuse the newer upload.
    Reject,
}

/// Registry of in-flight uploads. At most one per path.
pub struct TransportRegistry {
    uploads: Mutex<HashMap<PathBuf, Arc<UploadTask>>>,
    policy: ConflictPolicy,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

impl TransportRegistry {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Starts `task` and installs it as the active upload for its path.
    ///
    /// An upload already registered for the same path is superseded or,
    /// under [`ConflictPolicy::Reject`], causes [`RelayError::Conflict`].
    /// An entry whose upload has already stopped is replaced under either
    /// policy. Nothing is installed if the task fails to start.
    pub async fn register_upload(&self, task: &Arc<UploadTask>) -> Result<(), RelayError> {
        let path = task.file_path().to_path_buf();
        let mut uploads = self.uploads.lock().await;

        if let Some(previous) = uploads.get(&path) {
            if Arc::ptr_eq(previous, task) {
                return Ok(());
            }
            if previous.is_stopped() {
                debug!(path = %path.display(), "replacing stopped upload");
                uploads.remove(&path);
            } else {
                match self.policy {
                    ConflictPolicy::Reject => {
                        warn!(path = %path.display(), "upload rejected, another is in progress");
                        return Err(RelayError::Conflict(path));
                    }
                    ConflictPolicy::Supersede => {
                        info!(path = %path.display(), "superseding in-flight upload");
                        if let Some(previous) = uploads.remove(&path) {
                            previous.stop(StopReason::Error).await;
                        }
                    }
                }
            }
        }

        task.start().await?;
        uploads.insert(path, Arc::clone(task));
        Ok(())
    }

    /// Returns the active upload for `path`, if any.
    pub async fn lookup_upload(&self, path: &Path) -> Option<Arc<UploadTask>> {
        self.uploads.lock().await.get(path).cloned()
    }

    /// Removes the entry for `path` only if it is still `expected`.
    ///
    /// A superseded upload finishing late must not evict its successor.
    pub async fn unregister(&self, path: &Path, expected: &Arc<UploadTask>) -> bool {
        let mut uploads = self.uploads.lock().await;
        match uploads.get(path) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                uploads.remove(path);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.uploads.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.uploads.lock().await.is_empty()
    }

    /// Stops every active upload with an error and empties the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.uploads.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "stopping active uploads");
        for (_, task) in drained {
            task.stop(StopReason::Error).await;
        }
    }
}
