use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

use super::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};
use crate::error::SocketError;

enum Outgoing {
    Frame(String),
    Close,
}

struct WebSocketTransport {
    state: Arc<Mutex<ReadyState>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl WebSocketTransport {
    fn state(&self) -> ReadyState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, text: String) -> Result<(), SocketError> {
        if self.state() != ReadyState::Open {
            return Err(SocketError::TransportOffline("websocket is not open".to_string()));
        }
        self.outgoing
            .send(Outgoing::Frame(text))
            .map_err(|_| SocketError::TransportOffline("websocket task has exited".to_string()))
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return;
            }
            *state = ReadyState::Closing;
        }
        let _ = self.outgoing.send(Outgoing::Close);
    }

    fn ready_state(&self) -> ReadyState {
        self.state()
    }
}

/// Connects to `url` with tokio-tungstenite; one task per connection.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn open(&self) -> OpenedTransport {
        let state = Arc::new(Mutex::new(ReadyState::Connecting));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            self.url.clone(),
            state.clone(),
            outgoing_rx,
            events_tx,
        ));

        OpenedTransport {
            transport: Arc::new(WebSocketTransport {
                state,
                outgoing: outgoing_tx,
            }),
            events: events_rx,
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn set_state(state: &Mutex<ReadyState>, next: ReadyState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

async fn run_connection(
    url: String,
    state: Arc<Mutex<ReadyState>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(url = %url, "WebSocket connect failed: {}", e);
            set_state(&state, ReadyState::Closed);
            let _ = events.send(TransportEvent::Close);
            return;
        }
    };

    // close() may have been called while connecting.
    let closing = {
        let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == ReadyState::Connecting {
            *current = ReadyState::Open;
            false
        } else {
            true
        }
    };
    let (mut sink, mut stream) = ws_stream.split();
    if closing {
        let _ = sink.send(WsMessage::Close(None)).await;
        set_state(&state, ReadyState::Closed);
        let _ = events.send(TransportEvent::Close);
        return;
    }
    let _ = events.send(TransportEvent::Open);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message(text.to_owned()));
                    }
                    Err(_) => debug!(url = %url, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(_))) => {
                    debug!(url = %url, "WebSocket received close frame");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(url = %url, "WebSocket read error: {}", e);
                    break;
                }
                None => break,
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!(url = %url, "WebSocket write error: {}", e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }

    set_state(&state, ReadyState::Closed);
    let _ = events.send(TransportEvent::Close);
}
