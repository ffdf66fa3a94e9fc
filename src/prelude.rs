//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used items from this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use mutant_dispatch::prelude::*;
//! ```

pub use crate::dispatch::{
    CommandEngine, Coordinator, CoordinatorConfig, DispatchError, Dispatcher, DispatcherConfig,
    ExecLauncher, InProcessLauncher, JobDescriptor, JobOutcome, MemoryTransport, SharedTransport,
    SpoolTransport, StopHandle, TestEngine, TestRun, TimeoutPolicy, Transport,
};
pub use crate::logging::{LogConfig, LogFormat};
