//! Interactive shells on pseudo-terminals.
//!
//! The number of terminals is capped per process, not per project. Output
//! is read on a dedicated thread per terminal and forwarded as
//! [`TerminalEvent`]s to whoever owns the receiving end.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::project_root;
use crate::settings::TerminalConfig;

const READ_BUFFER_SIZE: usize = 4096;
const CLEAR_DELAY: Duration = Duration::from_millis(100);

pub type TerminalResult<T> = Result<T, TerminalError>;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Maximum of {0} terminals reached")]
    LimitReached(usize),

    #[error("Terminal not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn terminal: {0}")]
    Spawn(String),

    #[error("Terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Terminal table lock poisoned")]
    Poisoned,
}

/// Output and lifecycle notifications from running terminals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output {
        id: String,
        serial: u64,
        project_id: String,
        user_id: String,
        data: String,
    },
    /// The pty reached EOF; the process is gone or going.
    Closed {
        id: String,
        serial: u64,
    },
}

/// Who a terminal belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: String,
    pub serial: u64,
    pub project_id: String,
    pub user_id: String,
}

struct Terminal {
    info: TerminalInfo,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl Terminal {
    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Kill of terminal {} failed: {}", self.info.id, e);
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> TerminalResult<()> {
        self.master
            .resize(size(cols, rows))
            .map_err(|e| TerminalError::Spawn(e.to_string()))
    }
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub struct TerminalManager {
    terminals: Mutex<HashMap<String, Terminal>>,
    max_terminals: usize,
    config: TerminalConfig,
    workspace_root: PathBuf,
    events: mpsc::UnboundedSender<TerminalEvent>,
    next_serial: AtomicU64,
}

impl TerminalManager {
    pub fn new(
        config: TerminalConfig,
        max_terminals: usize,
        workspace_root: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            terminals: Mutex::new(HashMap::new()),
            max_terminals,
            config,
            workspace_root,
            events,
            next_serial: AtomicU64::new(0),
        };
        (manager, rx)
    }

    fn lock(&self) -> TerminalResult<MutexGuard<'_, HashMap<String, Terminal>>> {
        self.terminals.lock().map_err(|_| TerminalError::Poisoned)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a shell in the project's mirror directory.
    ///
    /// Returns `false` if a terminal with this id already exists.
    pub fn create(self: &Arc<Self>, id: &str, project_id: &str, user_id: &str) -> TerminalResult<bool> {
        let mut terminals = self.lock()?;
        if terminals.contains_key(id) {
            debug!("Terminal already exists: {}", id);
            return Ok(false);
        }
        if terminals.len() >= self.max_terminals {
            return Err(TerminalError::LimitReached(self.max_terminals));
        }

        let info = TerminalInfo {
            id: id.to_string(),
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
        };
        let terminal = self.spawn(info)?;
        terminals.insert(id.to_string(), terminal);
        drop(terminals);
        info!("Created terminal {} for project {}", id, project_id);

        let manager = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLEAR_DELAY).await;
            if let Err(e) = manager.write(&id, "clear\r") {
                debug!("Could not clear terminal {}: {}", id, e);
            }
        });
        Ok(true)
    }

    fn spawn(&self, info: TerminalInfo) -> TerminalResult<Terminal> {
        let spawn_err = |e: anyhow::Error| TerminalError::Spawn(e.to_string());
        let pair = native_pty_system()
            .openpty(size(self.config.cols, self.config.rows))
            .map_err(spawn_err)?;

        let cwd = self.workspace_root.join(project_root(&info.project_id));
        std::fs::create_dir_all(&cwd)?;
        let mut cmd = CommandBuilder::new(&self.config.shell);
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm");

        let child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        let writer = pair.master.take_writer().map_err(spawn_err)?;
        let reader = pair.master.try_clone_reader().map_err(spawn_err)?;
        self.spawn_reader(reader, info.clone());

        Ok(Terminal {
            info,
            master: pair.master,
            writer,
            child,
        })
    }

    fn spawn_reader(&self, mut reader: Box<dyn Read + Send>, info: TerminalInfo) {
        let events = self.events.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!("Terminal {} produced {} bytes", info.id, n);
                        let event = TerminalEvent::Output {
                            id: info.id.clone(),
                            serial: info.serial,
                            project_id: info.project_id.clone(),
                            user_id: info.user_id.clone(),
                            data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Terminal {} read ended: {}", info.id, e);
                        break;
                    }
                }
            }
            let _ = events.send(TerminalEvent::Closed {
                id: info.id,
                serial: info.serial,
            });
        });
    }

    pub fn write(&self, id: &str, data: &str) -> TerminalResult<()> {
        let mut terminals = self.lock()?;
        let terminal = terminals
            .get_mut(id)
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;
        terminal.writer.write_all(data.as_bytes())?;
        terminal.writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> TerminalResult<()> {
        let terminals = self.lock()?;
        terminals
            .get(id)
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?
            .resize(cols, rows)
    }

    /// Resize every terminal of a project.
    pub fn resize_project(&self, project_id: &str, cols: u16, rows: u16) -> TerminalResult<()> {
        let terminals = self.lock()?;
        for terminal in terminals.values().filter(|t| t.info.project_id == project_id) {
            if let Err(e) = terminal.resize(cols, rows) {
                warn!("Failed to resize terminal {}: {}", terminal.info.id, e);
            }
        }
        Ok(())
    }

    /// Kill and forget a terminal. `false` when it did not exist.
    pub fn close(&self, id: &str) -> TerminalResult<bool> {
        let removed = self.lock()?.remove(id);
        match removed {
            Some(mut terminal) => {
                terminal.kill();
                info!("Terminal closed: {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Kill every terminal of a project; returns how many were running.
    pub fn kill_project(&self, project_id: &str) -> usize {
        let Ok(mut terminals) = self.lock() else {
            error!("Terminal table poisoned; cannot tear down project {}", project_id);
            return 0;
        };
        let ids: Vec<String> = terminals
            .iter()
            .filter(|(_, t)| t.info.project_id == project_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(mut terminal) = terminals.remove(id) {
                terminal.kill();
            }
        }
        ids.len()
    }

    /// Reap a terminal whose output stream ended. Returns its owner and exit
    /// code, or `None` if it was already closed or replaced.
    pub fn reap(&self, id: &str, serial: u64) -> Option<(TerminalInfo, Option<u32>)> {
        let mut terminals = self.lock().ok()?;
        if terminals.get(id).map(|t| t.info.serial) != Some(serial) {
            return None;
        }
        let mut terminal = terminals.remove(id)?;
        drop(terminals);
        let code = match terminal.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            Ok(None) => {
                terminal.kill();
                None
            }
            Err(e) => {
                debug!("Could not read exit status of terminal {}: {}", id, e);
                None
            }
        };
        info!("Terminal {} exited with code {:?}", id, code);
        Some((terminal.info, code))
    }

    /// Owner of a running terminal.
    pub fn info(&self, id: &str) -> Option<TerminalInfo> {
        self.lock().ok()?.get(id).map(|t| t.info.clone())
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        if let Ok(terminals) = self.terminals.get_mut() {
            for terminal in terminals.values_mut() {
                terminal.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize, dir: &std::path::Path) -> (Arc<TerminalManager>, mpsc::UnboundedReceiver<TerminalEvent>) {
        let config = TerminalConfig {
            shell: "sh".into(),
            ..Default::default()
        };
        let (manager, rx) = TerminalManager::new(config, max, dir.to_path_buf());
        (Arc::new(manager), rx)
    }

    #[tokio::test]
    async fn limit_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(2, dir.path());
        assert!(manager.create("t1", "p1", "u1").unwrap());
        assert!(!manager.create("t1", "p1", "u1").unwrap());
        assert!(manager.create("t2", "p1", "u1").unwrap());
        assert!(matches!(
            manager.create("t3", "p2", "u2"),
            Err(TerminalError::LimitReached(2))
        ));
        assert!(dir.path().join("projects/p1").is_dir());

        assert_eq!(manager.kill_project("p1"), 2);
        assert!(manager.is_empty());
        assert!(manager.create("t3", "p2", "u2").unwrap());
        assert!(manager.close("t3").unwrap());
        assert!(!manager.close("t3").unwrap());
    }

    #[tokio::test]
    async fn output_is_forwarded_and_exit_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(4, dir.path());
        manager.create("t1", "p1", "u1").unwrap();
        manager.write("t1", "echo marker-$((40+2))\r").unwrap();
        manager.write("t1", "exit 3\r").unwrap();

        let mut seen = String::new();
        let serial = loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                TerminalEvent::Output { data, project_id, .. } => {
                    assert_eq!(project_id, "p1");
                    seen.push_str(&data);
                }
                TerminalEvent::Closed { serial, .. } => break serial,
            }
        };
        assert!(seen.contains("marker-42"));
        let (info, _code) = manager.reap("t1", serial).unwrap();
        assert_eq!(info.user_id, "u1");
        assert!(manager.info("t1").is_none());
        assert!(manager.reap("t1", serial).is_none());
    }

    #[tokio::test]
    async fn writes_to_unknown_terminal_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(4, dir.path());
        assert!(matches!(
            manager.write("nope", "ls\r"),
            Err(TerminalError::NotFound(_))
        ));
    }
}
