//! WebSocket transport.

use super::{
    DisconnectReason, Inbound, Outbound, SessionPeer, Transport, TransportError,
    TransportErrorKind, TransportSession,
};
use cache_protocol_types::TransportFrame;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Transport speaking JSON [`TransportFrame`]s over a WebSocket.
///
/// `http`/`https` endpoints are mapped to `ws`/`wss`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> TransportSession {
        let (session, peer) = TransportSession::pair();
        tokio::spawn(run_socket(url.to_string(), self.connect_timeout, peer));
        session
    }
}

/// Map an http(s) endpoint onto the matching ws(s) scheme.
pub(crate) fn websocket_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "https" => Some("wss"),
        "http" => Some("ws"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        // Both schemes are "special", so the switch cannot be refused.
        let _ = url.set_scheme(scheme);
    }
    Ok(url)
}

fn classify(err: &tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(io) => TransportError::from_io(io),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::new(TransportErrorKind::Closed, err.to_string())
        }
        _ => TransportError::new(TransportErrorKind::Other, err.to_string()),
    }
}

fn frame_to_inbound(frame: TransportFrame) -> Option<Inbound> {
    match frame {
        TransportFrame::Event { event, args } => Some(Inbound::Event { event, args }),
        TransportFrame::Ack {
            id,
            error,
            response,
        } => Some(Inbound::Ack {
            id,
            error,
            response,
        }),
        TransportFrame::Disconnect { reason, message } => Some(Inbound::Disconnect {
            reason: DisconnectReason::parse(&reason),
            message,
        }),
        TransportFrame::Request { event, .. } => {
            debug!(event = %event, "Ignoring request frame from service");
            None
        }
    }
}

fn outbound_to_frame(message: Outbound) -> Option<TransportFrame> {
    match message {
        Outbound::Emit { event, args } => Some(TransportFrame::Event { event, args }),
        Outbound::Request { id, event, payload } => {
            Some(TransportFrame::Request { id, event, payload })
        }
        Outbound::Close => None,
    }
}

async fn run_socket(url: String, connect_timeout: Duration, mut peer: SessionPeer) {
    let ws_url = match websocket_url(&url) {
        Ok(ws_url) => ws_url,
        Err(e) => {
            let _ = peer.inbound.send(Inbound::ConnectError(TransportError::new(
                TransportErrorKind::Other,
                e.to_string(),
            )));
            return;
        }
    };

    info!(url = %ws_url, "Connecting to cache service");
    let stream = match tokio::time::timeout(connect_timeout, connect_async(ws_url.as_str())).await
    {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(error = %e, "WebSocket connect failed");
            let _ = peer.inbound.send(Inbound::ConnectError(classify(&e)));
            return;
        }
        Err(_) => {
            warn!(timeout_ms = connect_timeout.as_millis() as u64, "WebSocket connect timed out");
            let _ = peer.inbound.send(Inbound::ConnectError(TransportError::new(
                TransportErrorKind::TimedOut,
                "connect timed out",
            )));
            return;
        }
    };

    if peer.inbound.send(Inbound::Connect).is_err() {
        return;
    }
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            outbound = peer.outbound.recv() => {
                let Some(frame) = outbound.and_then(outbound_to_frame) else {
                    debug!("Closing WebSocket session");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "WebSocket send failed");
                    let _ = peer.inbound.send(Inbound::Disconnect {
                        reason: DisconnectReason::TransportError,
                        message: Some(e.to_string()),
                    });
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match TransportFrame::from_json(&text) {
                        Ok(frame) => {
                            if let Some(inbound) = frame_to_inbound(frame) {
                                if peer.inbound.send(inbound).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to parse frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .map(|r| DisconnectReason::parse(&r))
                            .unwrap_or(DisconnectReason::TransportClose);
                        info!(reason = %reason, "Service closed the WebSocket");
                        let _ = peer.inbound.send(Inbound::Disconnect { reason, message: None });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        let _ = peer.inbound.send(Inbound::Disconnect {
                            reason: DisconnectReason::TransportError,
                            message: Some(classify(&e).to_string()),
                        });
                        break;
                    }
                    None => {
                        let _ = peer.inbound.send(Inbound::Disconnect {
                            reason: DisconnectReason::TransportClose,
                            message: None,
                        });
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_websocket_url_scheme_mapping() {
        assert_eq!(
            websocket_url("https://cache.example.com").unwrap().as_str(),
            "wss://cache.example.com/"
        );
        assert_eq!(
            websocket_url("http://localhost:8445/socket").unwrap().as_str(),
            "ws://localhost:8445/socket"
        );
        assert_eq!(
            websocket_url("wss://already.example.com/").unwrap().scheme(),
            "wss"
        );
        assert!(websocket_url("not a url").is_err());
    }

    #[test]
    fn test_frame_mapping() {
        let inbound = frame_to_inbound(TransportFrame::Disconnect {
            reason: "unauthorized".into(),
            message: Some("bad signature".into()),
        });
        assert_eq!(
            inbound,
            Some(Inbound::Disconnect {
                reason: DisconnectReason::Unauthorized,
                message: Some("bad signature".into())
            })
        );

        let frame = outbound_to_frame(Outbound::Request {
            id: 1,
            event: "command".into(),
            payload: json!({"action": "get"}),
        });
        assert!(matches!(frame, Some(TransportFrame::Request { id: 1, .. })));
        assert_eq!(outbound_to_frame(Outbound::Close), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_connect_error() {
        let transport = WebSocketTransport::new(Duration::from_secs(2));
        let mut session = transport.open("http://127.0.0.1:1/");
        match session.recv().await {
            Some(Inbound::ConnectError(err)) => {
                assert_eq!(err.kind, TransportErrorKind::ConnectionRefused)
            }
            other => panic!("expected connect error, got {:?}", other),
        }
    }
}
