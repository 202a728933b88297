//! Realtime services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own board state and store access so route handlers can
//! stay focused on protocol translation and auth plumbing. `dispatch` is the
//! only module that composes the others.

pub mod dispatch;
pub mod presence;
pub mod registry;
pub mod render;
pub mod sweeper;
pub mod task;
