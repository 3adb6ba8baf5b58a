//! Core types for the weft consensus protocol.
//!
//! This crate provides the foundational types used throughout the
//! protocol implementation:
//!
//! - **Primitives**: the [`Hash`] digest, [`NodeId`] / [`ClientId`]
//!   identifiers
//! - **Network**: [`NetworkConfig`] with the quorum arithmetic every
//!   component shares, durable [`NetworkState`]
//! - **Wire shapes**: client request, ordering-pipeline, and
//!   epoch-change message bodies
//! - **Persistence**: the [`Persistent`] write-ahead-log entries
//!
//! # Design Philosophy
//!
//! This crate is self-contained and depends on no other workspace crate,
//! making it the foundation layer. Everything that crosses the wire or
//! the WAL derives `BasicSbor`.

mod consensus;
mod epoch_change;
mod hash;
mod identifiers;
mod network;
mod persistent;
mod request;

pub use consensus::{Checkpoint, Commit, Prepare, Preprepare};
pub use epoch_change::{
    EpochChange, EpochChangeAck, EpochConfig, NewEpoch, NewEpochConfig, NewEpochEcho,
    NewEpochReady, RemoteEpochChange, SetEntry, Suspect,
};
pub use hash::{Hash, HexError};
pub use identifiers::{ClientId, NodeId};
pub use network::{ClientState, ConfigError, NetworkConfig, NetworkState};
pub use persistent::{CEntry, PEntry, Persistent, QEntry};
pub use request::{FetchRequest, ForwardRequest, RequestAck, RequestData};
