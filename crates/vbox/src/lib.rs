//! Collaborative virtualbox backend.
//!
//! Serves editor connections over WebSocket, keeps each open project's file
//! tree in memory with disk and remote-store mirrors, runs per-project
//! terminals and proxies the dev servers they start under `/preview`.

pub mod api;
pub mod codegen;
pub mod gateway;
pub mod identity;
pub mod preview;
pub mod session;
pub mod settings;
pub mod storage;
