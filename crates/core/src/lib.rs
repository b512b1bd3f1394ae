//! apkforge core - shared types
//!
//! Error taxonomy, target ABIs, pipeline configuration, progress events and
//! the concurrency primitives shared by every pipeline stage.

pub mod abi;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod locks;
pub mod stage;

pub use abi::Abi;
pub use config::PipelineConfig;
pub use error::{BuildError, Result, Stage};
pub use events::{Event, EventBus, EventSubscription};
pub use fingerprint::FingerprintBuilder;
pub use locks::KeyedLocks;
pub use stage::StageRunner;

/// apkforge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tool name, embedded in package metadata
pub const TOOL_NAME: &str = "apkforge";
