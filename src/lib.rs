//! Realtime collaboration core for kanban boards: per-board connection
//! registry, presence tracking, ordered task mutation fan-out with
//! optimistic concurrency, and a reconnecting client.

pub mod client;
pub mod config;
pub mod db;
pub mod envelope;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
