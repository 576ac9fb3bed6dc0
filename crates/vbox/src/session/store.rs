//! In-memory virtualbox sessions.
//!
//! A session is hydrated from remote storage the first time a project is
//! opened and lives for the rest of the process. Every mutation updates the
//! in-memory state under the session's write lock, rebuilds the tree from
//! the content map, and only then queues the matching [`MirrorOp`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock, mpsc};
use vbox_protocol::FileNode;

use crate::settings::LimitsConfig;
use crate::storage::RemoteStore;

use super::error::{SessionError, SessionResult};
use super::mirror::{Mirror, MirrorOp};
use super::tree::{
    base_name, build_tree, is_valid_relative, parent_id, project_root, relative_path,
    replace_prefix,
};

/// Concurrent object fetches during hydration.
const HYDRATE_CONCURRENCY: usize = 8;

/// Size ceilings applied to file writes.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub quota_bytes: u64,
    pub max_file_bytes: u64,
}

impl From<&LimitsConfig> for SessionLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            quota_bytes: cfg.project_quota_bytes,
            max_file_bytes: cfg.max_file_bytes,
        }
    }
}

/// File tree and contents of one project.
#[derive(Debug)]
pub struct VirtualboxSession {
    project_id: String,
    contents: HashMap<String, String>,
    /// File ids in display order.
    order: Vec<String>,
    /// Folders that exist without containing any file.
    folders: Vec<String>,
    tree: Vec<FileNode>,
    total_bytes: u64,
    last_sync: DateTime<Utc>,
}

impl VirtualboxSession {
    /// Build a session from hydrated `(id, content)` pairs and folder markers.
    pub fn new(project_id: impl Into<String>, files: Vec<(String, String)>, folders: Vec<String>) -> Self {
        let mut session = Self {
            project_id: project_id.into(),
            contents: HashMap::with_capacity(files.len()),
            order: Vec::with_capacity(files.len()),
            folders,
            tree: Vec::new(),
            total_bytes: 0,
            last_sync: Utc::now(),
        };
        for (id, content) in files {
            if session.contents.contains_key(&id) {
                continue;
            }
            session.total_bytes += content.len() as u64;
            session.order.push(id.clone());
            session.contents.insert(id, content);
        }
        // A key cannot be both a file and a folder.
        let shadowed: Vec<String> = session
            .order
            .iter()
            .filter(|id| session.file_ancestor(id).is_some())
            .cloned()
            .collect();
        for id in shadowed {
            debug!("Skipping {}: an ancestor is a file", id);
            if let Some(content) = session.contents.remove(&id) {
                session.total_bytes -= content.len() as u64;
            }
            session.order.retain(|f| *f != id);
        }
        let folders = std::mem::take(&mut session.folders);
        session.folders = folders
            .into_iter()
            .filter(|f| !session.contents.contains_key(f) && session.file_ancestor(f).is_none())
            .collect();
        session.rebuild();
        session
    }

    fn rebuild(&mut self) {
        self.tree = build_tree(
            &self.project_id,
            self.order.iter().map(String::as_str),
            self.folders.iter().map(String::as_str),
        );
        self.last_sync = Utc::now();
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn tree(&self) -> &[FileNode] {
        &self.tree
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn last_sync(&self) -> DateTime<Utc> {
        self.last_sync
    }

    pub fn file_ids(&self) -> &[String] {
        &self.order
    }

    pub fn get_file(&self, id: &str) -> Option<&str> {
        self.contents.get(id).map(String::as_str)
    }

    fn root(&self) -> String {
        project_root(&self.project_id)
    }

    fn folder_exists(&self, id: &str) -> bool {
        let prefix = format!("{id}/");
        self.folders.iter().any(|f| f == id || f.starts_with(&prefix))
            || self.order.iter().any(|f| f.starts_with(&prefix))
    }

    /// Nearest proper ancestor of `id` that is a file.
    fn file_ancestor(&self, id: &str) -> Option<String> {
        let root_len = self.root().len();
        let mut parent = parent_id(id);
        while parent.len() > root_len {
            if self.contents.contains_key(parent) {
                return Some(parent.to_string());
            }
            parent = parent_id(parent);
        }
        None
    }

    /// `id` is free for a new file or folder: nothing lives there and no
    /// ancestor is a file.
    fn ensure_vacant(&self, id: &str) -> SessionResult<()> {
        if self.contents.contains_key(id) || self.folder_exists(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }
        if let Some(file) = self.file_ancestor(id) {
            debug!("Refusing {}: {} is a file", id, file);
            return Err(SessionError::InvalidName(id.to_string()));
        }
        Ok(())
    }

    /// Validate a client-supplied id inside this project.
    fn check_id(&self, id: &str) -> SessionResult<()> {
        match relative_path(&self.project_id, id) {
            Some(rel) if is_valid_relative(rel) => Ok(()),
            _ => Err(SessionError::InvalidName(id.to_string())),
        }
    }

    fn check_name(name: &str) -> SessionResult<()> {
        if is_valid_relative(name) {
            Ok(())
        } else {
            Err(SessionError::InvalidName(name.to_string()))
        }
    }

    pub fn save_file(
        &mut self,
        id: &str,
        content: String,
        limits: SessionLimits,
    ) -> SessionResult<MirrorOp> {
        let size = content.len() as u64;
        if size > limits.max_file_bytes {
            return Err(SessionError::FileTooLarge {
                size,
                max: limits.max_file_bytes,
            });
        }
        let current = self
            .contents
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let old = current.len() as u64;
        let projected = self.total_bytes - old + size;
        if size > old && projected > limits.quota_bytes {
            return Err(SessionError::QuotaExceeded {
                used: projected,
                quota: limits.quota_bytes,
            });
        }
        *current = content.clone();
        self.total_bytes = projected;
        self.last_sync = Utc::now();
        Ok(MirrorOp::Save {
            id: id.to_string(),
            content,
        })
    }

    pub fn create_file(&mut self, name: &str, limits: SessionLimits) -> SessionResult<(String, MirrorOp)> {
        Self::check_name(name)?;
        if self.total_bytes >= limits.quota_bytes {
            return Err(SessionError::QuotaExceeded {
                used: self.total_bytes,
                quota: limits.quota_bytes,
            });
        }
        let id = format!("{}/{}", self.root(), name);
        self.ensure_vacant(&id)?;
        self.contents.insert(id.clone(), String::new());
        self.order.push(id.clone());
        self.rebuild();
        Ok((id.clone(), MirrorOp::Create { id }))
    }

    pub fn create_folder(&mut self, name: &str) -> SessionResult<(String, MirrorOp)> {
        Self::check_name(name)?;
        let id = format!("{}/{}", self.root(), name);
        self.ensure_vacant(&id)?;
        self.folders.push(id.clone());
        self.rebuild();
        Ok((id.clone(), MirrorOp::CreateDir { id }))
    }

    pub fn delete_file(&mut self, id: &str) -> SessionResult<MirrorOp> {
        let content = self
            .contents
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        self.total_bytes -= content.len() as u64;
        self.order.retain(|f| f != id);
        self.rebuild();
        Ok(MirrorOp::Delete { id: id.to_string() })
    }

    /// Remove every file whose id starts with `folder_id + "/"`.
    pub fn delete_folder(&mut self, folder_id: &str) -> SessionResult<MirrorOp> {
        self.check_id(folder_id)?;
        let prefix = format!("{folder_id}/");
        let removed: Vec<String> = self
            .order
            .iter()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        for id in &removed {
            if let Some(content) = self.contents.remove(id) {
                self.total_bytes -= content.len() as u64;
            }
        }
        self.order.retain(|id| !id.starts_with(&prefix));
        self.folders
            .retain(|f| f != folder_id && !f.starts_with(&prefix));
        self.rebuild();
        Ok(MirrorOp::DeleteDir {
            id: folder_id.to_string(),
            files: removed,
        })
    }

    /// Ids of files below `folder_id`.
    pub fn folder_files(&self, folder_id: &str) -> Vec<String> {
        let prefix = format!("{folder_id}/");
        self.order
            .iter()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Move every file and folder at or below `old` to `new`.
    ///
    /// Returns `(old id, new id, content)` for each moved file. Fails without
    /// touching state if any destination is taken.
    fn rename_ids(&mut self, old: &str, new: &str) -> SessionResult<Vec<(String, String, String)>> {
        let moves: Vec<(String, String)> = self
            .order
            .iter()
            .filter_map(|id| replace_prefix(id, old, new).map(|to| (id.clone(), to)))
            .collect();
        for (_, to) in &moves {
            if self.contents.contains_key(to) {
                return Err(SessionError::AlreadyExists(to.clone()));
            }
        }

        let mut moved = Vec::with_capacity(moves.len());
        for (from, to) in moves {
            if let Some(content) = self.contents.remove(&from) {
                moved.push((from.clone(), to.clone(), content.clone()));
                self.contents.insert(to.clone(), content);
            }
            for slot in self.order.iter_mut().filter(|id| **id == from) {
                *slot = to.clone();
            }
        }
        for folder in self.folders.iter_mut() {
            if let Some(renamed) = replace_prefix(folder, old, new) {
                *folder = renamed;
            }
        }
        self.rebuild();
        Ok(moved)
    }

    /// Move a single file from `from` to `to`.
    fn rename_one(&mut self, from: &str, to: &str) -> SessionResult<(String, String, String)> {
        let content = self
            .contents
            .remove(from)
            .ok_or_else(|| SessionError::NotFound(from.to_string()))?;
        self.contents.insert(to.to_string(), content.clone());
        for slot in self.order.iter_mut().filter(|id| **id == from) {
            *slot = to.to_string();
        }
        self.rebuild();
        Ok((from.to_string(), to.to_string(), content))
    }

    pub fn rename_file(&mut self, id: &str, new_name: &str) -> SessionResult<MirrorOp> {
        if new_name.contains('/') || !is_valid_relative(new_name) {
            return Err(SessionError::InvalidName(new_name.to_string()));
        }
        if !self.contents.contains_key(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let to = format!("{}/{}", parent_id(id), new_name);
        if to == id {
            return Ok(MirrorOp::Rename {
                from: id.to_string(),
                to,
                content: self.contents.get(id).cloned().unwrap_or_default(),
            });
        }
        self.ensure_vacant(&to)?;
        let (from, to, content) = self.rename_one(id, &to)?;
        Ok(MirrorOp::Rename { from, to, content })
    }

    /// Move a file into `dest_folder_id` (the project root id is allowed),
    /// keeping its name. `None` when the file is already there.
    pub fn move_file(&mut self, id: &str, dest_folder_id: &str) -> SessionResult<Option<MirrorOp>> {
        if !self.contents.contains_key(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        if dest_folder_id != self.root() {
            self.check_id(dest_folder_id)?;
            if self.contents.contains_key(dest_folder_id) {
                return Err(SessionError::InvalidName(dest_folder_id.to_string()));
            }
        }
        let to = format!("{}/{}", dest_folder_id, base_name(id));
        if to == id {
            return Ok(None);
        }
        self.ensure_vacant(&to)?;
        let (from, to, content) = self.rename_one(id, &to)?;
        Ok(Some(MirrorOp::Rename { from, to, content }))
    }

    pub fn rename_folder(&mut self, old_id: &str, new_id: &str) -> SessionResult<MirrorOp> {
        self.check_id(old_id)?;
        self.check_id(new_id)?;
        if new_id.starts_with(&format!("{old_id}/")) {
            return Err(SessionError::InvalidName(new_id.to_string()));
        }
        if !self.folder_exists(old_id) {
            return Err(SessionError::NotFound(old_id.to_string()));
        }
        if old_id == new_id {
            return Ok(MirrorOp::RenameDir {
                from: old_id.to_string(),
                to: new_id.to_string(),
                files: Vec::new(),
            });
        }
        self.ensure_vacant(new_id)?;
        let files = self.rename_ids(old_id, new_id)?;
        Ok(MirrorOp::RenameDir {
            from: old_id.to_string(),
            to: new_id.to_string(),
            files,
        })
    }

    /// Undo a rename whose filesystem step failed, unless something else
    /// already claimed the old id.
    pub fn revert_rename(&mut self, from: &str, to: &str) {
        if self.contents.contains_key(from) || self.folder_exists(from) {
            warn!("Not reverting {} -> {}: original id is in use", from, to);
            return;
        }
        let reverted = if self.contents.contains_key(to) {
            self.rename_one(to, from).map(|_| ())
        } else {
            self.rename_ids(to, from).map(|_| ())
        };
        if let Err(e) = reverted {
            warn!("Failed to revert {} -> {}: {}", from, to, e);
        }
    }

    /// Drop an explicit folder whose creation failed on disk.
    pub fn forget_folder(&mut self, id: &str) {
        self.folders.retain(|f| f != id);
        self.rebuild();
    }
}

/// A shared session plus the queue feeding its mirror worker.
pub struct SessionHandle {
    project_id: String,
    state: RwLock<VirtualboxSession>,
    mirror: mpsc::UnboundedSender<MirrorOp>,
    remote: Arc<dyn RemoteStore>,
    limits: SessionLimits,
}

impl SessionHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn enqueue(&self, op: MirrorOp) {
        if self.mirror.send(op).is_err() {
            warn!("Mirror worker for {} is gone; change kept in memory only", self.project_id);
        }
    }

    pub async fn tree(&self) -> Vec<FileNode> {
        self.state.read().await.tree().to_vec()
    }

    pub async fn get_file(&self, id: &str) -> Option<String> {
        self.state.read().await.get_file(id).map(str::to_string)
    }

    pub async fn total_bytes(&self) -> u64 {
        self.state.read().await.total_bytes()
    }

    pub async fn last_sync(&self) -> DateTime<Utc> {
        self.state.read().await.last_sync()
    }

    pub async fn save_file(&self, id: &str, content: String) -> SessionResult<()> {
        let op = self.state.write().await.save_file(id, content, self.limits)?;
        self.enqueue(op);
        Ok(())
    }

    /// Returns the new file id and the updated tree.
    pub async fn create_file(&self, name: &str) -> SessionResult<(String, Vec<FileNode>)> {
        let mut state = self.state.write().await;
        let (id, op) = state.create_file(name, self.limits)?;
        let tree = state.tree().to_vec();
        drop(state);
        self.enqueue(op);
        Ok((id, tree))
    }

    pub async fn create_folder(&self, name: &str) -> SessionResult<(String, Vec<FileNode>)> {
        let mut state = self.state.write().await;
        let (id, op) = state.create_folder(name)?;
        let tree = state.tree().to_vec();
        drop(state);
        self.enqueue(op);
        Ok((id, tree))
    }

    pub async fn delete_file(&self, id: &str) -> SessionResult<Vec<FileNode>> {
        let mut state = self.state.write().await;
        let op = state.delete_file(id)?;
        let tree = state.tree().to_vec();
        drop(state);
        self.enqueue(op);
        Ok(tree)
    }

    pub async fn delete_folder(&self, folder_id: &str) -> SessionResult<Vec<FileNode>> {
        let mut state = self.state.write().await;
        let op = state.delete_folder(folder_id)?;
        let tree = state.tree().to_vec();
        drop(state);
        self.enqueue(op);
        Ok(tree)
    }

    pub async fn rename_file(&self, id: &str, new_name: &str) -> SessionResult<Vec<FileNode>> {
        let mut state = self.state.write().await;
        let op = state.rename_file(id, new_name)?;
        let tree = state.tree().to_vec();
        drop(state);
        if !matches!(&op, MirrorOp::Rename { from, to, .. } if from == to) {
            self.enqueue(op);
        }
        Ok(tree)
    }

    pub async fn rename_folder(&self, old_id: &str, new_id: &str) -> SessionResult<Vec<FileNode>> {
        let mut state = self.state.write().await;
        let op = state.rename_folder(old_id, new_id)?;
        let tree = state.tree().to_vec();
        drop(state);
        if old_id != new_id {
            self.enqueue(op);
        }
        Ok(tree)
    }

    pub async fn move_file(&self, id: &str, dest_folder_id: &str) -> SessionResult<Vec<FileNode>> {
        let mut state = self.state.write().await;
        let op = state.move_file(id, dest_folder_id)?;
        let tree = state.tree().to_vec();
        drop(state);
        if let Some(op) = op {
            self.enqueue(op);
        }
        Ok(tree)
    }

    /// File ids below a folder, falling back to the remote listing when the
    /// session knows none.
    pub async fn get_folder(&self, folder_id: &str) -> SessionResult<Vec<String>> {
        let local = self.state.read().await.folder_files(folder_id);
        if !local.is_empty() {
            return Ok(local);
        }
        Ok(self.remote.list_folder(folder_id).await?)
    }

    pub(crate) async fn revert_rename(&self, from: &str, to: &str) {
        self.state.write().await.revert_rename(from, to);
    }

    pub(crate) async fn forget_folder(&self, id: &str) {
        self.state.write().await.forget_folder(id);
    }
}

/// Process-wide map of project id -> session.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    /// Per-project gates so a project is hydrated by one caller at a time.
    opening: DashMap<String, Arc<Mutex<()>>>,
    remote: Arc<dyn RemoteStore>,
    mirror_root: PathBuf,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(remote: Arc<dyn RemoteStore>, mirror_root: PathBuf, limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            opening: DashMap::new(),
            remote,
            mirror_root,
            limits,
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn mirror_root(&self) -> &PathBuf {
        &self.mirror_root
    }

    /// On-disk directory of a project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.mirror_root.join(project_root(project_id))
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(project_id).cloned()
    }

    pub async fn project_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Return the session for `project_id`, hydrating it on first use.
    ///
    /// Hydration and the initial disk mirror run outside the process-wide
    /// map lock; only callers opening the same project wait for each other.
    pub async fn open(&self, project_id: &str) -> SessionResult<Arc<SessionHandle>> {
        if let Some(existing) = self.get(project_id).await {
            return Ok(existing);
        }

        let gate = self
            .opening
            .entry(project_id.to_string())
            .or_default()
            .clone();
        let opened = {
            let _opening = gate.lock().await;
            match self.get(project_id).await {
                Some(existing) => Ok(existing),
                None => self.load(project_id).await,
            }
        };
        self.opening.remove(project_id);
        opened
    }

    async fn load(&self, project_id: &str) -> SessionResult<Arc<SessionHandle>> {
        let session = self.hydrate(project_id).await?;

        let mirror = Mirror::new(self.mirror_root.clone(), self.remote.clone());
        let files: Vec<(String, String)> = session
            .file_ids()
            .iter()
            .map(|id| (id.clone(), session.get_file(id).unwrap_or_default().to_string()))
            .collect();
        mirror.write_all(&files).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle {
            project_id: project_id.to_string(),
            state: RwLock::new(session),
            mirror: tx,
            remote: self.remote.clone(),
            limits: self.limits,
        });

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(project_id) {
            debug!("Session {} hydrated concurrently; keeping first", project_id);
            return Ok(existing.clone());
        }
        sessions.insert(project_id.to_string(), handle.clone());
        drop(sessions);

        tokio::spawn(mirror.run(rx, Arc::downgrade(&handle)));
        info!("Hydrated session {} ({} files)", project_id, files.len());
        Ok(handle)
    }

    async fn hydrate(&self, project_id: &str) -> SessionResult<VirtualboxSession> {
        let keys = self.remote.list(project_id).await?;
        let mut file_ids = Vec::new();
        let mut folders = Vec::new();
        for key in keys {
            let Some(rel) = relative_path(project_id, &key) else {
                continue;
            };
            if let Some(folder) = rel.strip_suffix('/') {
                if is_valid_relative(folder) {
                    folders.push(format!("{}/{}", project_root(project_id), folder));
                }
            } else if is_valid_relative(rel) {
                file_ids.push(key);
            } else {
                debug!("Skipping unusable object key {}", key);
            }
        }

        let remote = self.remote.clone();
        let files: Vec<(String, String)> = stream::iter(file_ids)
            .map(|id| {
                let remote = remote.clone();
                async move {
                    let content = match remote.fetch(&id).await {
                        Ok(content) => content,
                        Err(e) => {
                            warn!("Failed to fetch {} during hydration: {}", id, e);
                            String::new()
                        }
                    };
                    (id, content)
                }
            })
            .buffered(HYDRATE_CONCURRENCY)
            .collect()
            .await;

        Ok(VirtualboxSession::new(project_id, files, folders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use vbox_protocol::find_node;

    const LIMITS: SessionLimits = SessionLimits {
        quota_bytes: 1024,
        max_file_bytes: 256,
    };

    fn session() -> VirtualboxSession {
        VirtualboxSession::new(
            "p1",
            vec![
                ("projects/p1/a.txt".into(), "aaa".into()),
                ("projects/p1/dir/b.txt".into(), "bb".into()),
            ],
            Vec::new(),
        )
    }

    /// Every file in the tree has content and every content key is in the tree.
    fn assert_consistent(s: &VirtualboxSession) {
        let mut in_tree = Vec::new();
        for node in s.tree() {
            node.file_ids(&mut in_tree);
        }
        in_tree.sort();
        let mut in_contents: Vec<String> = s.contents.keys().cloned().collect();
        in_contents.sort();
        assert_eq!(in_tree, in_contents);
        let mut ordered = s.order.clone();
        ordered.sort();
        assert_eq!(ordered, in_contents);
        let total: u64 = s.contents.values().map(|c| c.len() as u64).sum();
        assert_eq!(total, s.total_bytes());
        for id in &s.order {
            assert_eq!(s.file_ancestor(id), None, "{id} sits below a file");
        }
    }

    #[test]
    fn hydrated_tree_shape() {
        let s = session();
        assert_eq!(s.tree().len(), 2);
        assert_eq!(s.tree()[0].id(), "projects/p1/a.txt");
        assert!(s.tree()[1].is_folder());
        assert_eq!(s.tree()[1].children()[0].name(), "b.txt");
        assert_consistent(&s);
    }

    #[test]
    fn move_file_into_folder() {
        let mut s = session();
        let op = s.move_file("projects/p1/a.txt", "projects/p1/dir").unwrap();
        assert_eq!(
            op,
            Some(MirrorOp::Rename {
                from: "projects/p1/a.txt".into(),
                to: "projects/p1/dir/a.txt".into(),
                content: "aaa".into(),
            })
        );
        assert_eq!(s.tree().len(), 1);
        let dir = &s.tree()[0];
        let mut names: Vec<&str> = dir.children().iter().map(FileNode::name).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(s.tree().iter().all(|n| n.is_folder()));
        assert_eq!(s.get_file("projects/p1/dir/a.txt"), Some("aaa"));
        assert_consistent(&s);
    }

    #[test]
    fn move_to_same_folder_is_noop() {
        let mut s = session();
        assert_eq!(s.move_file("projects/p1/a.txt", "projects/p1").unwrap(), None);
        assert_consistent(&s);
    }

    #[test]
    fn delete_folder_removes_only_prefixed_files() {
        let mut s = VirtualboxSession::new(
            "p1",
            vec![
                ("projects/p1/dir/a".into(), "1".into()),
                ("projects/p1/dir/sub/b".into(), "2".into()),
                ("projects/p1/dirx/c".into(), "3".into()),
                ("projects/p1/d".into(), "4".into()),
            ],
            Vec::new(),
        );
        let op = s.delete_folder("projects/p1/dir").unwrap();
        assert_eq!(
            op,
            MirrorOp::DeleteDir {
                id: "projects/p1/dir".into(),
                files: vec!["projects/p1/dir/a".into(), "projects/p1/dir/sub/b".into()],
            }
        );
        let mut left: Vec<&String> = s.contents.keys().collect();
        left.sort();
        assert_eq!(left, vec!["projects/p1/d", "projects/p1/dirx/c"]);
        assert_consistent(&s);
    }

    #[test]
    fn rename_folder_rewrites_prefix_and_keeps_suffixes() {
        let mut s = VirtualboxSession::new(
            "p1",
            vec![
                ("projects/p1/A/x.txt".into(), "x".into()),
                ("projects/p1/A/deep/y.txt".into(), "y".into()),
                ("projects/p1/AB/z.txt".into(), "z".into()),
            ],
            Vec::new(),
        );
        s.rename_folder("projects/p1/A", "projects/p1/B").unwrap();
        let mut ids: Vec<&String> = s.contents.keys().collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "projects/p1/AB/z.txt",
                "projects/p1/B/deep/y.txt",
                "projects/p1/B/x.txt",
            ]
        );
        assert!(find_node(s.tree(), "projects/p1/B/deep").is_some());
        assert!(find_node(s.tree(), "projects/p1/A").is_none());
        assert_consistent(&s);
    }

    #[test]
    fn rename_file_keeps_parent() {
        let mut s = session();
        s.rename_file("projects/p1/dir/b.txt", "c.txt").unwrap();
        assert_eq!(s.get_file("projects/p1/dir/c.txt"), Some("bb"));
        assert!(s.get_file("projects/p1/dir/b.txt").is_none());
        assert!(matches!(
            s.rename_file("projects/p1/dir/c.txt", "../x"),
            Err(SessionError::InvalidName(_))
        ));
        assert_consistent(&s);
    }

    #[test]
    fn rename_onto_existing_file_is_rejected() {
        let mut s = session();
        s.create_file("dir/c.txt", LIMITS).unwrap();
        assert!(matches!(
            s.rename_file("projects/p1/dir/c.txt", "b.txt"),
            Err(SessionError::AlreadyExists(_))
        ));
        assert_consistent(&s);
    }

    #[test]
    fn nothing_can_be_created_below_a_file() {
        let mut s = session();
        assert!(matches!(
            s.create_file("a.txt/b", LIMITS),
            Err(SessionError::InvalidName(_))
        ));
        assert!(matches!(
            s.create_folder("a.txt/sub"),
            Err(SessionError::InvalidName(_))
        ));
        assert!(matches!(
            s.rename_folder("projects/p1/dir", "projects/p1/a.txt/dir"),
            Err(SessionError::InvalidName(_))
        ));
        assert!(matches!(
            s.move_file("projects/p1/dir/b.txt", "projects/p1/a.txt"),
            Err(SessionError::InvalidName(_))
        ));
        assert!(find_node(s.tree(), "projects/p1/a.txt").is_some_and(|n| !n.is_folder()));
        assert_consistent(&s);
    }

    #[test]
    fn rename_file_moves_exactly_one_file() {
        let mut s = VirtualboxSession::new(
            "p1",
            vec![
                ("projects/p1/a.txt".into(), "a".into()),
                ("projects/p1/a.txt/b".into(), "b".into()),
                ("projects/p1/a.txtx".into(), "x".into()),
            ],
            vec!["projects/p1/a.txt".into()],
        );
        // The key below a file is dropped at hydration.
        assert!(s.get_file("projects/p1/a.txt/b").is_none());
        assert_eq!(s.total_bytes(), 2);

        let op = s.rename_file("projects/p1/a.txt", "z.txt").unwrap();
        assert_eq!(
            op,
            MirrorOp::Rename {
                from: "projects/p1/a.txt".into(),
                to: "projects/p1/z.txt".into(),
                content: "a".into(),
            }
        );
        let mut ids: Vec<&String> = s.contents.keys().collect();
        ids.sort();
        assert_eq!(ids, vec!["projects/p1/a.txtx", "projects/p1/z.txt"]);
        assert_consistent(&s);
    }

    #[test]
    fn revert_restores_original_id() {
        let mut s = session();
        s.move_file("projects/p1/a.txt", "projects/p1/dir").unwrap();
        s.revert_rename("projects/p1/a.txt", "projects/p1/dir/a.txt");
        assert_eq!(s.get_file("projects/p1/a.txt"), Some("aaa"));
        assert!(s.get_file("projects/p1/dir/a.txt").is_none());
        assert_consistent(&s);
    }

    #[test]
    fn quota_and_file_size_limits() {
        let mut s = session();
        assert!(matches!(
            s.save_file("projects/p1/a.txt", "x".repeat(300), LIMITS),
            Err(SessionError::FileTooLarge { size: 300, max: 256 })
        ));

        let limits = SessionLimits {
            quota_bytes: 10,
            max_file_bytes: 256,
        };
        assert!(matches!(
            s.save_file("projects/p1/a.txt", "x".repeat(20), limits),
            Err(SessionError::QuotaExceeded { .. })
        ));
        assert_eq!(s.get_file("projects/p1/a.txt"), Some("aaa"));
        // Shrinking is always allowed.
        s.save_file("projects/p1/a.txt", "a".into(), limits).unwrap();
        assert_eq!(s.total_bytes(), 3);

        let full = SessionLimits {
            quota_bytes: 3,
            max_file_bytes: 256,
        };
        assert!(matches!(
            s.create_file("new.txt", full),
            Err(SessionError::QuotaExceeded { .. })
        ));
        assert_consistent(&s);
    }

    #[test]
    fn create_folder_and_file_inside() {
        let mut s = session();
        let (id, op) = s.create_folder("src").unwrap();
        assert_eq!(id, "projects/p1/src");
        assert_eq!(op, MirrorOp::CreateDir { id: id.clone() });
        assert!(find_node(s.tree(), "projects/p1/src").unwrap().is_folder());
        let (file, _) = s.create_file("src/main.rs", LIMITS).unwrap();
        assert_eq!(file, "projects/p1/src/main.rs");
        assert!(matches!(
            s.create_folder("src"),
            Err(SessionError::AlreadyExists(_))
        ));
        assert_consistent(&s);
    }

    #[test]
    fn random_operation_sequence_stays_consistent() {
        let mut s = session();
        let names = ["a", "b", "c", "d", "e"];
        for round in 0..40usize {
            let name = names[round % names.len()];
            let folder = names[(round / 2) % names.len()];
            let _ = match round % 6 {
                0 => s.create_file(&format!("{folder}/{name}.txt"), LIMITS).map(|_| ()),
                1 => s
                    .move_file(
                        &format!("projects/p1/{folder}/{name}.txt"),
                        &format!("projects/p1/{name}"),
                    )
                    .map(|_| ()),
                2 => s
                    .rename_folder(&format!("projects/p1/{folder}"), &format!("projects/p1/{name}x"))
                    .map(|_| ()),
                3 => s.delete_folder(&format!("projects/p1/{name}")).map(|_| ()),
                4 => s
                    .rename_file(&format!("projects/p1/{folder}/{name}.txt"), "r.txt")
                    .map(|_| ()),
                _ => s.delete_file(&format!("projects/p1/{name}x/{name}.txt")).map(|_| ()),
            };
            assert_consistent(&s);
        }
    }

    #[tokio::test]
    async fn store_hydrates_once_and_mirrors_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::with_objects([
            ("projects/p1/a.txt", "hello"),
            ("projects/p1/dir/b.txt", "world"),
            ("projects/p1/empty/", ""),
            ("projects/p2/other.txt", "nope"),
        ]));
        let store = SessionStore::new(remote.clone(), dir.path().to_path_buf(), LIMITS);

        let first = store.open("p1").await.unwrap();
        let second = store.open("p1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let tree = first.tree().await;
        assert_eq!(tree.len(), 3);
        assert!(find_node(&tree, "projects/p1/empty").unwrap().is_folder());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("projects/p1/dir/b.txt")).unwrap(),
            "world"
        );
        assert_eq!(first.get_file("projects/p1/a.txt").await.as_deref(), Some("hello"));
        assert!(first.get_file("projects/p2/other.txt").await.is_none());
    }

    #[tokio::test]
    async fn mutations_reach_remote_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::with_objects([("projects/p1/a.txt", "hello")]));
        let store = SessionStore::new(remote.clone(), dir.path().to_path_buf(), LIMITS);
        let session = store.open("p1").await.unwrap();

        let (id, _) = session.create_file("notes.md").await.unwrap();
        session.save_file(&id, "# notes".into()).await.unwrap();
        session.rename_file(&id, "README.md").await.unwrap();
        // Visible immediately, before any mirror work.
        assert_eq!(
            session.get_file("projects/p1/README.md").await.as_deref(),
            Some("# notes")
        );

        for _ in 0..100 {
            if remote.get("projects/p1/README.md").as_deref() == Some("# notes") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(remote.get("projects/p1/README.md").as_deref(), Some("# notes"));
        assert!(remote.get("projects/p1/notes.md").is_none());
        assert!(dir.path().join("projects/p1/README.md").exists());
    }

    #[tokio::test]
    async fn failed_disk_move_is_reverted_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::with_objects([("projects/p1/a.txt", "aaa")]));
        let store = SessionStore::new(remote.clone(), dir.path().to_path_buf(), LIMITS);
        let session = store.open("p1").await.unwrap();

        // A plain file where the destination folder has to go.
        std::fs::write(dir.path().join("projects/p1/dir"), "").unwrap();

        let tree = session
            .move_file("projects/p1/a.txt", "projects/p1/dir")
            .await
            .unwrap();
        assert!(find_node(&tree, "projects/p1/dir/a.txt").is_some());

        for _ in 0..100 {
            if session.get_file("projects/p1/a.txt").await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(session.get_file("projects/p1/a.txt").await.as_deref(), Some("aaa"));
        assert!(session.get_file("projects/p1/dir/a.txt").await.is_none());
        assert!(find_node(&session.tree().await, "projects/p1/dir").is_none());
        assert!(dir.path().join("projects/p1/a.txt").exists());
        // The remote rename is skipped once the disk step failed.
        assert_eq!(remote.get("projects/p1/a.txt").as_deref(), Some("aaa"));
        assert!(remote.get("projects/p1/dir/a.txt").is_none());
    }

    /// Delegates to a [`MemoryStore`], holding the listing of `p1` until
    /// released and counting listings.
    struct GatedStore {
        inner: MemoryStore,
        release: tokio::sync::Notify,
        listings: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteStore for GatedStore {
        async fn list(&self, project_id: &str) -> crate::storage::StorageResult<Vec<String>> {
            self.listings
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if project_id == "p1" {
                self.release.notified().await;
            }
            self.inner.list(project_id).await
        }

        async fn list_folder(&self, folder_id: &str) -> crate::storage::StorageResult<Vec<String>> {
            self.inner.list_folder(folder_id).await
        }

        async fn fetch(&self, file_id: &str) -> crate::storage::StorageResult<String> {
            self.inner.fetch(file_id).await
        }

        async fn create(&self, file_id: &str) -> crate::storage::StorageResult<()> {
            self.inner.create(file_id).await
        }

        async fn save(&self, file_id: &str, data: &str) -> crate::storage::StorageResult<()> {
            self.inner.save(file_id, data).await
        }

        async fn rename(
            &self,
            file_id: &str,
            new_file_id: &str,
            data: &str,
        ) -> crate::storage::StorageResult<()> {
            self.inner.rename(file_id, new_file_id, data).await
        }

        async fn delete(&self, file_id: &str) -> crate::storage::StorageResult<()> {
            self.inner.delete(file_id).await
        }

        async fn project_size(&self, project_id: &str) -> crate::storage::StorageResult<u64> {
            self.inner.project_size(project_id).await
        }
    }

    #[tokio::test]
    async fn slow_hydration_does_not_block_other_projects() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(GatedStore {
            inner: MemoryStore::with_objects([
                ("projects/p1/a.txt", "one"),
                ("projects/p2/b.txt", "two"),
            ]),
            release: tokio::sync::Notify::new(),
            listings: std::sync::atomic::AtomicUsize::new(0),
        });
        let store = Arc::new(SessionStore::new(
            remote.clone(),
            dir.path().to_path_buf(),
            LIMITS,
        ));

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.open("p1").await.unwrap() }
        });
        let second = tokio::spawn({
            let store = store.clone();
            async move { store.open("p1").await.unwrap() }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let other = tokio::time::timeout(std::time::Duration::from_secs(2), store.open("p2"))
            .await
            .expect("p2 waited on p1")
            .unwrap();
        assert_eq!(other.get_file("projects/p2/b.txt").await.as_deref(), Some("two"));
        assert!(store.get("p1").await.is_none());

        remote.release.notify_one();
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        // One listing for p1, one for p2.
        assert_eq!(
            remote.listings.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        assert!(dir.path().join("projects/p1/a.txt").exists());
    }

    #[tokio::test]
    async fn get_folder_falls_back_to_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::with_objects([("projects/p1/a.txt", "x")]));
        let store = SessionStore::new(remote.clone(), dir.path().to_path_buf(), LIMITS);
        let session = store.open("p1").await.unwrap();
        remote.save("projects/p1/late/z.txt", "z").await.unwrap();
        assert_eq!(
            session.get_folder("projects/p1/late").await.unwrap(),
            vec!["projects/p1/late/z.txt"]
        );
    }
}
