//! WebSocket framing for the duplex adapter
//!
//! Each envelope is one JSON text frame. A writer task drains the
//! outbound channel into the socket and a reader task decodes frames
//! into the inbound channel; either side ending closes the link.

use super::duplex::DuplexLink;
use crate::error::{Error, Result, TransportError};
use crate::types::Envelope;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

const CHANNEL_BUFFER: usize = 100;

/// Connect to a duplex endpoint, authenticating with a bearer token
pub async fn connect(url: &str, api_key: &str) -> Result<DuplexLink> {
    let mut request = url.into_client_request()?;
    if !api_key.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| TransportError::ConnectionFailed(format!("Invalid API key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    debug!("WebSocket handshake complete: {}", url);

    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER);

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode envelope: {}", e);
                    continue;
                }
            };
            trace!("Sending frame: {}", text);
            if let Err(e) = sink.send(Message::Text(text)).await {
                error!("Failed to write frame: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
        debug!("WebSocket writer task ended");
    });

    tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket read error: {}", e);
                    break;
                }
            };
            match decode_frame(&text) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
        debug!("WebSocket reader task ended");
    });

    Ok(DuplexLink::new(outbound_tx, inbound_rx))
}

fn decode_frame(text: &str) -> Result<Envelope> {
    serde_json::from_str(text).map_err(|e| Error::from(TransportError::InvalidMessage(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeKind;

    #[test]
    fn test_decode_frame() {
        let envelope =
            decode_frame(r#"{"type":"task_result","data":{"task_id":"t-1","success":true}}"#)
                .unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::TaskResult);
        assert_eq!(envelope.task_id(), Some("t-1"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_frame("not json").unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&format!("ws://{}/ws", addr), "key").await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::ConnectionFailed(_)))
        ));
    }
}
