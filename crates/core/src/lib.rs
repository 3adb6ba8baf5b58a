//! Core action model for the weft consensus architecture.
//!
//! This crate provides the boundary types between the deterministic
//! protocol state machine and its host:
//!
//! - [`Actions`]: everything the host must do after one call into the
//!   state machine
//! - [`ActionResults`]: hash, preprocess, and checkpoint results fed back
//! - [`HashOrigin`]: the tag that routes a digest back to the component
//!   that asked for it
//! - Collaborator traits ([`Link`], [`Wal`], [`RequestStore`],
//!   [`AppLog`], [`HashProvider`]) the host implements
//!
//! # Architecture
//!
//! The protocol is built on a simple synchronous model:
//!
//! ```text
//! propose/step/tick/process_results → Actions → host I/O → ActionResults
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no blocking
//! - **Deterministic**: same state + same inputs = byte-identical actions
//! - **Pure-ish**: mutates itself, performs no I/O
//!
//! The host executes each batch under the ordering rules documented on
//! [`Actions`], then feeds the results back in.

mod actions;
mod traits;

pub use actions::{
    ActionResults, Actions, CheckpointResult, CommitEntry, HashOrigin, HashRequest, HashResult,
    PreprocessResult, Request, Unicast,
};
pub use traits::{AppLog, DigestHasher, HashProvider, Link, RequestStore, Wal};
