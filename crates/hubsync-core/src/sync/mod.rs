//! Replication between a hub and its runners
//!
//! Messages travel as CBOR envelopes in WebSocket binary frames. Both sides
//! speak request/ack over the same connection:
//!
//! - `sync_request` (hub → runner): pull the runner's own changes, carrying
//!   any rows forwarded from other runners
//! - `catch_up` (runner → hub): page through everything the runner missed
//! - `sync_error` (hub → runner, push): the connection has been pinned

pub mod forward;
pub mod hub;
pub mod link;
pub mod message;
pub mod runner;
pub mod transport;

pub use forward::ForwardQueue;
pub use hub::{ClientStatus, Hub, HubServer, HubSettings};
pub use link::{memory_pair, Inbound, LinkError, PeerLink};
pub use message::{
    AckBody, CatchUpRequest, CatchUpResponse, Envelope, ErrorKind, ErrorPayload, PushBody,
    RequestBody, SyncRequest, SyncResponse,
};
pub use runner::{
    spawn_runner_client, HubStatus, HubSyncState, Runner, RunnerClientConfig, RunnerClientHandle,
    RunnerCommand, RunnerSettings, SessionEnd,
};
