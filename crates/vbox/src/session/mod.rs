//! Per-project file sessions backed by remote storage.

pub mod error;
pub mod mirror;
pub mod store;
pub mod tree;

pub use error::{SessionError, SessionResult};
pub use mirror::{Mirror, MirrorOp};
pub use store::{SessionHandle, SessionLimits, SessionStore, VirtualboxSession};
pub use tree::{build_tree, project_root};
