//! # pinio-module — Default (safe) implementations
//!
//! This crate provides the default implementation for the pluggable
//! collaborators in `pinio-core`.
//!
//! ## Default stack
//!
//! | Trait           | Default Impl | Notes                               |
//! |-----------------|--------------|-------------------------------------|
//! | ThreadPool      | FixedPool    | N OS threads, lent one per employer |
//! | ChunkProvider   | ChunkPool    | 64KB pages under a MemoryBudget     |

pub mod fixed_pool;
pub mod chunk_pool;

pub use chunk_pool::ChunkPool;
pub use fixed_pool::FixedPool;
