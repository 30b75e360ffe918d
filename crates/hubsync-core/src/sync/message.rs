//! Sync protocol message types
//!
//! Messages exchanged between the hub and its runners, CBOR-encoded into
//! WebSocket binary frames. Every frame is an `Envelope`:
//!
//! - `Request`: expects exactly one `Ack` carrying the same id
//! - `Ack`: the reply to a request
//! - `Push`: fire-and-forget notification
//!
//! | Event          | Direction    | Ack                                   |
//! |----------------|--------------|---------------------------------------|
//! | `sync_request` | hub → runner | `SyncResponse` or `ErrorPayload`      |
//! | `catch_up`     | runner → hub | `CatchUpResponse` or `ErrorPayload`   |
//! | `sync_error`   | hub → runner | none                                  |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{HostId, TableBatch, Timestamp};

/// Correlates an `Ack` with its `Request` on one connection
pub type RequestId = u64;

/// Top-level frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request { id: RequestId, body: RequestBody },
    Ack { id: RequestId, body: AckBody },
    Push { body: PushBody },
}

/// Request events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RequestBody {
    SyncRequest(SyncRequest),
    CatchUp(CatchUpRequest),
}

/// Acknowledgement payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AckBody {
    Sync(SyncResponse),
    CatchUp(CatchUpResponse),
    Error(ErrorPayload),
}

/// Push events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum PushBody {
    SyncError(ErrorPayload),
}

/// Hub pull: "send me your rows changed after `since`"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub schema_version: i64,
    pub since: Timestamp,
    /// Rows from other runners piggybacked onto the pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwards: Option<TableBatch>,
}

/// Runner reply to a pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub host_id: HostId,
    pub has_more: bool,
    pub tables: TableBatch,
}

/// Runner request for everything it missed while disconnected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUpRequest {
    pub host_id: HostId,
    pub schema_version: i64,
    #[serde(rename = "lastSyncedFromHub")]
    pub last_synced_from_hub: Timestamp,
}

/// One page of catch-up rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUpResponse {
    pub has_more: bool,
    pub tables: TableBatch,
}

/// Typed error categories carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaMismatch,
    InternalError,
    OwnershipViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::OwnershipViolation => "ownership_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error ack or `sync_error` push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

impl Envelope {
    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}
