//! # pinio-core — Shared types and trait boundaries for pinio
//!
//! pinio is a portable completion-port runtime: an emulated completion
//! port (`pinio-cpe`), a socket port on top of it (`pinio-sockport`) and
//! the connection-object gateway (`pinio-gateway`). This crate holds what
//! every layer agrees on:
//!
//! - [`ident::Ident`] and the generation-checked [`slot::SlotMap`]
//! - [`entry`] — completion keys, action kinds, socket kinds
//! - [`mask::ActionMask`] — in-progress / invoking / close-reason bits
//! - [`buffer`] — 64KB chunks and the shared memory budget
//! - [`pool`] — the borrowed-thread contract used for dispatch
//! - [`error`] — setup errors and per-operation error codes
//!
//! ## Design principle
//!
//! > "Every operation completes exactly once. User code never runs
//! >  under a lock."

pub mod ident;
pub mod slot;
pub mod entry;
pub mod mask;
pub mod buffer;
pub mod pool;
pub mod env;
pub mod error;

pub use buffer::{Chunk, ChunkProvider, MemoryBudget, PageRecycler, Reservation, CHUNK_SIZE, LEADER_SIZE};
pub use entry::{Action, CompletionKey, SocketKind};
pub use error::{Error, OpError, Result};
pub use ident::Ident;
pub use mask::ActionMask;
pub use pool::{BorrowedThread, Employer, ThreadPool, ThreadSignal};
pub use slot::SlotMap;
