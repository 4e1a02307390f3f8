//! Stratus Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, configuration
//! and report options used by the storage engine and the worker.

pub mod config;
pub mod error;
pub mod report;
pub mod types;

pub use config::{
    AllocationConfig, AllocatorKind, DirConfig, EvictionConfig, EvictorKind, LockConfig,
    ReserverConfig, SessionConfig, StoreConfig, TierConfig,
};
pub use error::{Error, Result};
pub use report::{WorkerInfoField, WorkerRange, WorkerReportOptions};
pub use types::*;
