//! Request/ack multiplexing over a single peer connection
//!
//! A `PeerLink` is the sending half of one connection. Requests get a fresh
//! id and a `oneshot` slot; the connection's read loop hands every inbound
//! envelope to `resolve`, which completes the matching slot for acks and
//! passes requests and pushes back to the caller.
//!
//! An ack that never arrives is bounded by the request timeout, and closing
//! the link fails every outstanding request with `LinkError::Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::message::{AckBody, Envelope, PushBody, RequestBody, RequestId};

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("peer is not connected")]
    Disconnected,

    #[error("no ack received within {0:?}")]
    Timeout(Duration),
}

/// An inbound envelope that is not an ack
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request { id: RequestId, body: RequestBody },
    Push(PushBody),
}

struct LinkInner {
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<AckBody>>>,
    next_id: AtomicU64,
}

/// Sending half of a peer connection
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerLink {
    /// Wrap the channel that feeds this connection's writer
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                outbound: Mutex::new(Some(outbound)),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Send a request and wait for its ack
    pub async fn request(&self, body: RequestBody, timeout: Duration) -> Result<AckBody, LinkError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if let Err(e) = self.send(Envelope::Request { id, body }) {
            self.pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // Responder dropped by `close`
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.pending().remove(&id);
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    /// Answer a request received from the peer
    pub fn reply(&self, id: RequestId, body: AckBody) -> Result<(), LinkError> {
        self.send(Envelope::Ack { id, body })
    }

    /// Send a fire-and-forget notification
    pub fn push(&self, body: PushBody) -> Result<(), LinkError> {
        self.send(Envelope::Push { body })
    }

    /// Route an inbound envelope
    ///
    /// Acks complete their pending request and yield `None`; acks for unknown
    /// or timed-out ids are discarded.
    pub fn resolve(&self, envelope: Envelope) -> Option<Inbound> {
        match envelope {
            Envelope::Ack { id, body } => {
                match self.pending().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => debug!(id, "Discarding ack for unknown request"),
                }
                None
            }
            Envelope::Request { id, body } => Some(Inbound::Request { id, body }),
            Envelope::Push { body } => Some(Inbound::Push(body)),
        }
    }

    /// Drop the outbound channel and fail all outstanding requests
    pub fn close(&self) {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.pending().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    /// Number of requests still waiting for an ack
    pub fn pending_requests(&self) -> usize {
        self.pending().len()
    }

    fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        let outbound = self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| LinkError::Disconnected),
            None => Err(LinkError::Disconnected),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<AckBody>>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Two links wired back to back in memory
///
/// Each side gets its link plus the receiver of envelopes sent by the other
/// side. Used for in-process hubs and tests.
pub fn memory_pair() -> (
    (PeerLink, mpsc::UnboundedReceiver<Envelope>),
    (PeerLink, mpsc::UnboundedReceiver<Envelope>),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    ((PeerLink::new(b_tx), a_rx), (PeerLink::new(a_tx), b_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::epoch;
    use crate::sync::message::{CatchUpResponse, ErrorKind, ErrorPayload, SyncRequest};

    fn pull() -> RequestBody {
        RequestBody::SyncRequest(SyncRequest {
            schema_version: 1,
            since: epoch(),
            forwards: None,
        })
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_ack() {
        let ((hub, mut hub_rx), (runner, mut runner_rx)) = memory_pair();

        let responder = tokio::spawn(async move {
            let envelope = runner_rx.recv().await.unwrap();
            match runner.resolve(envelope) {
                Some(Inbound::Request { id, .. }) => {
                    let body = AckBody::CatchUp(CatchUpResponse {
                        has_more: false,
                        tables: Default::default(),
                    });
                    runner.reply(id, body).unwrap();
                }
                other => panic!("Expected request, got {:?}", other),
            }
        });

        let request = hub.request(pull(), Duration::from_secs(5));
        let pump = async {
            let ack = hub_rx.recv().await.unwrap();
            assert!(hub.resolve(ack).is_none());
        };
        let (result, _) = tokio::join!(request, pump);

        responder.await.unwrap();
        assert!(matches!(result, Ok(AckBody::CatchUp(_))));
        assert_eq!(hub.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let ((hub, _hub_rx), (_runner, _runner_rx)) = memory_pair();

        let result = hub.request(pull(), Duration::from_millis(20)).await;

        assert_eq!(result, Err(LinkError::Timeout(Duration::from_millis(20))));
        assert_eq!(hub.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let ((hub, _hub_rx), (_runner, _runner_rx)) = memory_pair();

        let closer = hub.clone();
        let request = tokio::spawn(async move { hub.request(pull(), Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        closer.close();

        assert_eq!(request.await.unwrap(), Err(LinkError::Disconnected));
        assert!(closer.is_closed());
    }

    #[test]
    fn test_send_after_close_is_disconnected() {
        let ((hub, _hub_rx), _runner) = memory_pair();
        hub.close();

        let push = PushBody::SyncError(ErrorPayload::new(ErrorKind::InternalError, "x"));
        assert_eq!(hub.push(push), Err(LinkError::Disconnected));
    }

    #[test]
    fn test_unknown_ack_is_discarded() {
        let ((hub, _hub_rx), _runner) = memory_pair();
        let ack = Envelope::Ack {
            id: 99,
            body: AckBody::Error(ErrorPayload::new(ErrorKind::InternalError, "late")),
        };
        assert!(hub.resolve(ack).is_none());
    }
}
