//! Push protocol client transport.
//!
//! Thin wrapper around `tokio-tungstenite` that speaks the relay's push
//! protocol from the client side. Used by the `listen` command and by the
//! integration tests; the relay itself serves push over axum.
//!
//! [`connect`] returns a ([`PushWriter`], [`PushReader`]) pair ready for use
//! in `tokio::select!` loops.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::push::protocol::{decode_server, ChannelEntry, ClientMessage, ServerMessage};
use crate::update::Version;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Something that arrived from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// A protocol message.
    Message(ServerMessage),
    /// The relay closed the connection.
    Closed {
        /// WebSocket close code (1005 when none was sent).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a push connection.
#[derive(Debug)]
pub struct PushWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl PushWriter {
    /// Send a protocol message.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(msg.to_text()))
            .await
            .with_context(|| format!("failed to send {}", msg.kind()))
    }

    /// Send a raw text frame, bypassing message encoding.
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("failed to send raw frame")
    }

    /// Handshake, optionally resuming `uaid`, announcing known channel versions.
    pub async fn hello(&mut self, uaid: Option<&str>, channels: &[(&str, Version)]) -> Result<()> {
        let channel_ids = channels
            .iter()
            .map(|&(chid, version)| ChannelEntry::Versioned {
                chid: chid.to_string(),
                version,
            })
            .collect();
        self.send(&ClientMessage::Hello {
            uaid: uaid.map(String::from),
            channel_ids,
        })
        .await
    }

    /// Subscribe to a channel.
    pub async fn register(&mut self, chid: &str) -> Result<()> {
        self.send(&ClientMessage::Register {
            chid: chid.to_string(),
        })
        .await
    }

    /// Acknowledge a notification.
    pub async fn ack(&mut self, chid: &str, version: Version) -> Result<()> {
        self.send(&ClientMessage::Ack {
            chid: chid.to_string(),
            version,
        })
        .await
    }

    /// Send a normal close frame and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a push connection.
#[derive(Debug)]
pub struct PushReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl PushReader {
    /// Next protocol event, or `None` once the stream ends.
    ///
    /// Transport-level ping/pong frames are handled by tungstenite and
    /// skipped here.
    pub async fn next_event(&mut self) -> Option<Result<PushEvent>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            match frame {
                tungstenite::Message::Text(text) => {
                    return Some(
                        decode_server(&text)
                            .map(PushEvent::Message)
                            .with_context(|| format!("unexpected frame: {text}")),
                    );
                }
                tungstenite::Message::Close(close_frame) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(PushEvent::Closed { code, reason }));
                }
                tungstenite::Message::Binary(_) => {
                    return Some(Err(anyhow::anyhow!("unexpected binary frame")));
                }
                tungstenite::Message::Ping(_)
                | tungstenite::Message::Pong(_)
                | tungstenite::Message::Frame(_) => continue,
            }
        }
    }

    /// Next protocol message within `timeout`. A close or end of stream is an error.
    pub async fn expect_message(&mut self, timeout: Duration) -> Result<ServerMessage> {
        match tokio::time::timeout(timeout, self.next_event()).await {
            Err(_) => bail!("no message within {timeout:?}"),
            Ok(None) => bail!("connection ended"),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(PushEvent::Message(msg)))) => Ok(msg),
            Ok(Some(Ok(PushEvent::Closed { code, reason }))) => {
                bail!("connection closed ({code}): {reason}")
            }
        }
    }

    /// Wait for the close frame within `timeout`, skipping messages. Returns its code.
    pub async fn expect_close(&mut self, timeout: Duration) -> Result<u16> {
        let wait = async {
            loop {
                match self.next_event().await {
                    Some(Ok(PushEvent::Closed { code, .. })) => return code,
                    Some(Ok(PushEvent::Message(_))) => continue,
                    // A reset without a close frame
                    Some(Err(_)) | None => return 1006,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("connection still open after {timeout:?}"))
    }
}

/// Connect to a relay's push endpoint.
pub async fn connect(url: &str) -> Result<(PushWriter, PushReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = http_to_ws_scheme(url)
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();
    Ok((PushWriter { sink }, PushReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://push.example.com"), "wss://push.example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:8080/"), "ws://localhost:8080/");
        assert_eq!(http_to_ws_scheme("ws://localhost:8080/"), "ws://localhost:8080/");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        assert!(connect("ws://127.0.0.1:1/").await.is_err());
    }
}
