//! Best-effort propagation of session mutations to disk and remote storage.
//!
//! Each project owns one worker draining an unbounded queue, so mirror
//! writes for a project are applied in mutation order while callers never
//! wait on them. Failures are logged. A failed filesystem rename (or folder
//! creation) is reverted in memory, because later reads by the new id would
//! otherwise miss the file on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::storage::RemoteStore;

use super::store::SessionHandle;

/// One mutation to replay outside memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOp {
    Save {
        id: String,
        content: String,
    },
    Create {
        id: String,
    },
    CreateDir {
        id: String,
    },
    Delete {
        id: String,
    },
    DeleteDir {
        id: String,
        files: Vec<String>,
    },
    /// File rename or move. `content` travels with the remote rename.
    Rename {
        from: String,
        to: String,
        content: String,
    },
    /// Folder rename; `files` holds `(old id, new id, content)`.
    RenameDir {
        from: String,
        to: String,
        files: Vec<(String, String, String)>,
    },
}

/// Applies [`MirrorOp`]s for one project.
pub struct Mirror {
    root: PathBuf,
    remote: Arc<dyn RemoteStore>,
}

impl Mirror {
    pub fn new(root: PathBuf, remote: Arc<dyn RemoteStore>) -> Self {
        Self { root, remote }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Write every file to disk; used once at hydration.
    pub async fn write_all(&self, files: &[(String, String)]) {
        for (id, content) in files {
            if let Err(e) = write_file(&self.path(id), content).await {
                warn!("Failed to mirror {} to disk: {}", id, e);
            }
        }
    }

    /// Drain `rx` until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<MirrorOp>, session: Weak<SessionHandle>) {
        while let Some(op) = rx.recv().await {
            self.apply(op, &session).await;
        }
        debug!("Mirror worker for {} stopped", self.root.display());
    }

    pub async fn apply(&self, op: MirrorOp, session: &Weak<SessionHandle>) {
        match op {
            MirrorOp::Save { id, content } => {
                if let Err(e) = write_file(&self.path(&id), &content).await {
                    warn!("Failed to write {} to disk: {}", id, e);
                }
                if let Err(e) = self.remote.save(&id, &content).await {
                    error!("Failed to save {} to storage: {}", id, e);
                }
            }
            MirrorOp::Create { id } => {
                if let Err(e) = write_file(&self.path(&id), "").await {
                    warn!("Failed to create {} on disk: {}", id, e);
                }
                if let Err(e) = self.remote.create(&id).await {
                    error!("Failed to create {} in storage: {}", id, e);
                }
            }
            MirrorOp::CreateDir { id } => {
                if let Err(e) = tokio::fs::create_dir_all(self.path(&id)).await {
                    warn!("Failed to create folder {} on disk, reverting: {}", id, e);
                    if let Some(session) = session.upgrade() {
                        session.forget_folder(&id).await;
                    }
                }
            }
            MirrorOp::Delete { id } => {
                if let Err(e) = tokio::fs::remove_file(self.path(&id)).await {
                    warn!("Failed to delete {} from disk: {}", id, e);
                }
                if let Err(e) = self.remote.delete(&id).await {
                    error!("Failed to delete {} from storage: {}", id, e);
                }
            }
            MirrorOp::DeleteDir { id, files } => {
                if let Err(e) = tokio::fs::remove_dir_all(self.path(&id)).await {
                    warn!("Failed to delete folder {} from disk: {}", id, e);
                }
                for file in files {
                    if let Err(e) = self.remote.delete(&file).await {
                        error!("Failed to delete {} from storage: {}", file, e);
                    }
                }
            }
            MirrorOp::Rename { from, to, content } => {
                if let Err(e) = rename_path(&self.path(&from), &self.path(&to)).await {
                    warn!("Failed to rename {} to {} on disk, reverting: {}", from, to, e);
                    if let Some(session) = session.upgrade() {
                        session.revert_rename(&from, &to).await;
                    }
                    return;
                }
                if let Err(e) = self.remote.rename(&from, &to, &content).await {
                    error!("Failed to rename {} to {} in storage: {}", from, to, e);
                }
            }
            MirrorOp::RenameDir { from, to, files } => {
                if let Err(e) = rename_path(&self.path(&from), &self.path(&to)).await {
                    warn!(
                        "Failed to rename folder {} to {} on disk, reverting: {}",
                        from, to, e
                    );
                    if let Some(session) = session.upgrade() {
                        session.revert_rename(&from, &to).await;
                    }
                    return;
                }
                for (old, new, content) in files {
                    if let Err(e) = self.remote.rename(&old, &new, &content).await {
                        error!("Failed to rename {} to {} in storage: {}", old, new, e);
                    }
                }
            }
        }
    }
}

async fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

async fn rename_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(from, to).await
}
