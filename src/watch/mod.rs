// src/watch/mod.rs

//! Dependency-aware watching.
//!
//! Workers report which files each test loaded (or looked for and missed).
//! This module indexes those reports, keeps the file-watch subscription in
//! sync with them, and turns change batches into minimal re-run plans.

pub mod backend;
pub mod census;
pub mod content_filter;
pub mod dependency_table;
pub mod engine;
pub mod expression;
pub mod filter_table;
pub mod notify_backend;

pub use backend::{ChangedFile, FileEvent, Subscription, WatchBackend};
pub use census::FilePathCensus;
pub use content_filter::{ContentChangeFilter, digest_file};
pub use dependency_table::{TestDependencyTable, WatchScope};
pub use engine::WatchEngine;
pub use expression::{CompiledExpression, Expression};
pub use filter_table::FilterTable;
pub use notify_backend::NotifyBackend;
