//! WebSocket front door for the hub
//!
//! Runners connect to `ws://<listen_addr>/?host_id=<id>`. The host id from the
//! URL is the connection's identity for ownership checks; upgrades without
//! one are refused with `400 Bad Request`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::Hub;
use crate::store::RecordStore;
use crate::sync::transport;

/// Accepts runner connections and hands them to a [`Hub`]
pub struct HubServer<S> {
    hub: Hub<S>,
    listener: TcpListener,
}

impl<S: RecordStore + 'static> HubServer<S> {
    /// Bind the listening socket
    pub async fn bind(hub: Hub<S>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind hub listener on {}", addr))?;
        Ok(Self { hub, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &Hub<S> {
        &self.hub
    }

    /// Serve connections and run the scheduler until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Hub listening on {}", self.local_addr()?);

        let scheduler = {
            let hub = self.hub.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { hub.run(shutdown).await })
        };

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let hub = self.hub.clone();
                            tokio::spawn(async move { accept_runner(hub, stream, peer).await });
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        scheduler.await.ok();
        info!("Hub stopped");
        Ok(())
    }
}

async fn accept_runner<S: RecordStore + 'static>(hub: Hub<S>, stream: TcpStream, peer: SocketAddr) {
    let mut host_id = None;
    let callback = |request: &Request, response: Response| {
        match request.uri().query().and_then(host_id_param) {
            Some(id) => {
                host_id = Some(id);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("missing host_id query parameter".into()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "WebSocket handshake failed: {}", e);
            return;
        }
    };
    let Some(host_id) = host_id else {
        return;
    };

    debug!(%peer, host_id = %host_id, "Runner handshake complete");
    let (link, inbound) = transport::attach(ws);
    hub.serve_connection(host_id, link, inbound).await;
}

/// Extract a non-empty `host_id` from a form-encoded query string
fn host_id_param(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "host_id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::host_id_param;

    #[test]
    fn test_host_id_param() {
        assert_eq!(host_id_param("host_id=runner-1"), Some("runner-1".into()));
        assert_eq!(host_id_param("a=1&host_id=r2&b=3"), Some("r2".into()));
        assert_eq!(host_id_param("host_id="), None);
        assert_eq!(host_id_param("hostid=r1"), None);
        assert_eq!(host_id_param(""), None);
    }

    #[test]
    fn test_host_id_param_decodes_value() {
        assert_eq!(host_id_param("host_id=ops%26lab"), Some("ops&lab".into()));
        assert_eq!(
            host_id_param("token=x&host_id=a+b%3Dc%231%25"),
            Some("a b=c#1%".into())
        );
        // Whitespace is part of the id
        assert_eq!(host_id_param("host_id=+r1+"), Some(" r1 ".into()));
    }
}
