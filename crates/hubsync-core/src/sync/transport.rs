//! WebSocket transport
//!
//! Splits a WebSocket into a writer task fed by the link's outbound channel
//! and a reader task that decodes binary frames into envelopes. Either side
//! ending closes the link.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::link::PeerLink;
use super::message::Envelope;

/// Attach a link to an open WebSocket
///
/// Returns the link and the stream of decoded inbound envelopes. The stream
/// ends when the socket closes.
pub fn attach<S>(ws: WebSocketStream<S>) -> (PeerLink, mpsc::UnboundedReceiver<Envelope>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let link = PeerLink::new(outbound_tx);

    let writer_link = link.clone();
    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let bytes = match envelope.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Binary(bytes)).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
        }
        writer_link.close();
        write.close().await.ok();
    });

    let reader_link = link.clone();
    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Binary(data)) => match Envelope::decode(&data) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read failed: {}", e);
                    break;
                }
            }
        }
        reader_link.close();
    });

    (link, inbound_rx)
}
