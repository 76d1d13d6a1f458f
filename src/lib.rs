//! tandem coordinates many concurrent workers over one codebase: ordered
//! work claiming, isolated execution contexts, a durable message bus, and
//! flag-guarded migration between legacy and new worker implementations.

pub mod bus;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod migration;
pub mod orchestrator;
pub mod work;
pub mod worktree;
