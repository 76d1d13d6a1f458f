//! Work units, their durable store and the manager that enforces ordering.

pub mod manager;
pub mod models;
pub mod store;

pub use manager::WorkManager;
pub use models::*;
pub use store::WorkStore;
