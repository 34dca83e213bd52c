//! Relay connection handling.
//!
//! Connects over WebSocket, runs the HELLO exchange, and paces reconnects
//! with capped exponential backoff plus jitter so a relay restart does not
//! get a synchronized thundering herd.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use syncline_core::frame::{ClientHello, Frame, MsgType, ServerHello};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{FolderError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_JITTER_MS: u64 = 500;

/// Capped exponential backoff with jitter.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay before the next attempt, growing until the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exp = BASE_DELAY.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(MAX_DELAY);
        self.attempt = self.attempt.saturating_add(1);
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS))
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to the relay and complete the HELLO exchange.
pub async fn connect(url: &str, name: &str) -> Result<(WsStream, ServerHello)> {
    let (mut ws, _response) = connect_async(url).await?;

    let hello = ClientHello {
        name: name.to_string(),
    };
    ws.send(Message::Binary(hello.to_frame()?.encode().into()))
        .await?;

    loop {
        let message = match ws.next().await {
            Some(message) => message?,
            None => {
                return Err(FolderError::Handshake(
                    "connection closed before HELLO reply".to_string(),
                ));
            }
        };
        match message {
            Message::Binary(data) => {
                let frame = Frame::decode(&data)?;
                if frame.msg_type != MsgType::Hello {
                    return Err(FolderError::Handshake(format!(
                        "expected HELLO, got {:?}",
                        frame.msg_type
                    )));
                }
                let server = ServerHello::from_payload(&frame.payload)?;
                log::info!(
                    "connected to {} ({}), connection {}",
                    url,
                    server.banner,
                    server.connection_id
                );
                return Ok((ws, server));
            }
            Message::Close(_) => {
                return Err(FolderError::Handshake(
                    "relay closed during handshake".to_string(),
                ));
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_cap_and_resets() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= BASE_DELAY);
        assert!(second >= first.saturating_sub(Duration::from_millis(MAX_JITTER_MS)));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= MAX_DELAY + Duration::from_millis(MAX_JITTER_MS));
        }

        backoff.reset();
        assert!(backoff.next_delay() <= BASE_DELAY + Duration::from_millis(MAX_JITTER_MS));
    }
}
