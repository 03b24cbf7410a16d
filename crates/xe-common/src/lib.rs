//! Shared building blocks for the xe-runtime dispatch pipeline.
//!
//! - [`config`]: `RuntimeConfig` loaded from TOML with `XE_*` overrides
//! - [`error`]: the `XeError` taxonomy and `Result` alias
//! - [`hw_info`]: device description and the per-family traits registry
//! - [`payload`]: bounds-checked byte patching for payloads and heaps
//! - [`logging`]: rate-limited warnings

pub mod config;
pub mod error;
pub mod hw_info;
pub mod logging;
pub mod math;
pub mod payload;

pub use config::{ConfigError, DispatchMode, RuntimeConfig};
pub use error::{Result, XeError};
pub use hw_info::{FamilyTraits, HwFamily, HwInfo, WalkerKind, family_traits};
pub use payload::PayloadWriter;

/// Per-context monotonically increasing submission counter.
pub type TaskCount = u32;

/// Index of an engine context registered with the memory manager.
pub type ContextId = u32;
