//! Background tasks.
//!
//! - `watcher`: one completion watcher per channel, resolving jobs as results appear
//! - `reaper`: fails Waiting jobs that outlive the configured maximum age

pub mod reaper;
pub mod watcher;

pub use reaper::spawn_reaper;
pub use watcher::{CompletionWatcher, TickReport, spawn_watcher, stop_watchers};
