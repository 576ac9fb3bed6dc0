//! Dev server preview: registry, liveness, detection and the reverse proxy.

pub mod detector;
pub mod diagnose;
pub mod health;
pub mod pages;
pub mod proxy;
pub mod registry;
pub mod rewrite;

pub use detector::{Detection, OutputScanner, detect, strip_ansi};
pub use health::{HealthChecker, probe_port};
pub use registry::{PreviewKey, PreviewTarget, ServerKind, ServerRegistry, is_valid_port};
pub use rewrite::rewrite_body;
