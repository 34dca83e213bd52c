//! WebSocket endpoint.
//!
//! One task per connection: a single select loop multiplexing inbound
//! WebSocket messages (decoded into frames and dispatched to the session)
//! and the outbound frame queue (session replies plus forwarder fanout).
//! When the loop exits, the outbound receiver drops and every forwarder the
//! session spawned observes it and detaches.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use syncline_core::frame::Frame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{Relay, Session};

/// Outbound frames buffered per connection before senders are backpressured.
const OUTBOUND_CAPACITY: usize = 256;

/// WebSocket upgrade handler for `/sync`.
pub async fn ws_handler(State(relay): State<Arc<Relay>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
    let mut session = Session::new(relay, out_tx);

    debug!(connection_id = %session.connection_id(), "socket open");

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(connection_id = %session.connection_id(), error = %e, "closing connection");
                                break;
                            }
                        };
                        if let Err(e) = session.handle_frame(frame).await {
                            warn!(connection_id = %session.connection_id(), error = %e, "closing connection");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings and pongs are handled by the transport layer;
                    // text frames are not part of the protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %session.connection_id(), error = %e, "socket error");
                        break;
                    }
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if ws_tx
                            .send(Message::Binary(frame.encode().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    session.close();
    // out_rx drops here; forwarders observe outbound.closed() and detach.
}
