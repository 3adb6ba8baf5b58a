//! Client request shapes.

use crate::{ClientId, Hash};
use sbor::prelude::*;

/// A client request payload.
///
/// Clients number their requests per-client; the protocol orders each
/// `(client_id, req_no)` slot exactly once. The payload bytes are opaque
/// to the protocol.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RequestData {
    /// Submitting client.
    pub client_id: ClientId,

    /// The client's sequence number for this request.
    pub req_no: u64,

    /// Opaque payload.
    pub data: Vec<u8>,
}

/// A replica's acknowledgement that it holds a request with this digest.
///
/// An honest replica acknowledges at most one digest per `(client_id,
/// req_no)`. `f + 1` matching acks make the request *correct*; `2f + 1`
/// make it *strong* and eligible for ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct RequestAck {
    /// Submitting client.
    pub client_id: ClientId,

    /// The client's sequence number for this request.
    pub req_no: u64,

    /// Digest of the request payload.
    pub digest: Hash,
}

/// A replica's request for a payload it knows only by acknowledgement.
///
/// Answered with a [`ForwardRequest`] when the receiver holds the data.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FetchRequest {
    /// Submitting client.
    pub client_id: ClientId,

    /// The client's sequence number for this request.
    pub req_no: u64,

    /// Digest of the wanted payload.
    pub digest: Hash,
}

/// A request forwarded with its payload, so a peer missing the data can
/// verify it against the claimed digest and store it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ForwardRequest {
    /// The acknowledgement identifying `(client, req_no, digest)`.
    pub ack: RequestAck,

    /// The request payload.
    pub data: Vec<u8>,
}

impl ForwardRequest {
    /// Reconstruct the request payload shape.
    pub fn request_data(&self) -> RequestData {
        RequestData {
            client_id: self.ack.client_id,
            req_no: self.ack.req_no,
            data: self.data.clone(),
        }
    }
}
