#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! Memory subsystem for a group-chat assistant: a short-term per-channel
//! cache of formatted messages feeding a dual-store long-term memory
//! (authoritative sqlite rows plus a reconstructible vector index).

pub mod cache;
pub mod config;
pub mod error;
pub mod fragment;
pub mod memory;
pub mod message;

pub use cache::{CacheManager, ConsentRegistry, HistorySource, MessageFormatter};
pub use config::Config;
pub use error::{CacheError, MnemosError, Result, SnapshotError};
pub use fragment::{Fragment, MemoRecord, RenderMode};
pub use message::{InboundMessage, Provenance};
