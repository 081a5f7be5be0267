use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    Connection, ConnectionId, Connector, TransportError, TransportEvent, TransportEventKind,
};
use crate::config::ClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one tokio-tungstenite client per wavelength. A failed connect is
/// reported once and never retried.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Frame(Message),
    Close,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug)]
struct WebSocketConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<LinkState>,
}

impl WebSocketConnection {
    fn queue(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_valid() {
            return Err(TransportError::Closed(self.id));
        }
        self.outbound
            .send(Outbound::Frame(message))
            .map_err(|_| TransportError::Closed(self.id))
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.state.connected.load(Ordering::Acquire) && !self.state.closed.load(Ordering::Acquire)
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.queue(Message::Text(text.into()))
    }

    fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.queue(Message::Binary(data))
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.queue(Message::Ping(Bytes::new()))
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        url: &str,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Connection> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(LinkState::default());

        tokio::spawn(run_connection(
            url.to_owned(),
            id,
            self.clone(),
            Arc::clone(&state),
            outbound_rx,
            events,
        ));

        Arc::new(WebSocketConnection {
            id,
            outbound: outbound_tx,
            state,
        })
    }
}

async fn run_connection(
    url: String,
    id: ConnectionId,
    connector: WebSocketConnector,
    state: Arc<LinkState>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |kind| {
        let _ = events.send(TransportEvent {
            connection: id,
            kind,
        });
    };

    if let Err(err) = Url::parse(&url) {
        error!(connection = id, url = %url, "invalid relay url: {err}");
        emit(TransportEventKind::Error(format!("invalid relay url: {err}")));
        emit(TransportEventKind::Disconnected);
        return;
    }

    let ws_stream = match connect_once(&url, id, &connector, &state).await {
        Ok(stream) => stream,
        Err(err) => {
            emit(TransportEventKind::Error(err));
            emit(TransportEventKind::Disconnected);
            return;
        }
    };

    info!(connection = id, url = %url, "connected");
    state.connected.store(true, Ordering::Release);
    emit(TransportEventKind::Connected);

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(message) => {
                    if ws_write.send(message).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(next) = ws_read.next().await {
        match next {
            Ok(Message::Text(text)) => emit(TransportEventKind::Text(text.as_str().to_owned())),
            Ok(Message::Binary(data)) => emit(TransportEventKind::Binary(data)),
            Ok(Message::Close(frame)) => {
                debug!(connection = id, ?frame, "close frame received");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if !state.closed.load(Ordering::Acquire) {
                    warn!(connection = id, "read failed: {err}");
                    emit(TransportEventKind::Error(format!("read failed: {err}")));
                }
                break;
            }
        }
    }

    state.connected.store(false, Ordering::Release);
    send_task.abort();
    emit(TransportEventKind::Disconnected);
    debug!(connection = id, "transport finished");
}

async fn connect_once(
    url: &str,
    id: ConnectionId,
    connector: &WebSocketConnector,
    state: &LinkState,
) -> Result<WsStream, String> {
    if state.closed.load(Ordering::Acquire) {
        return Err("connection closed before it was established".to_owned());
    }

    info!(connection = id, url = %url, "connecting");
    let failure = match timeout(connector.connect_timeout, connect_async(url)).await {
        Ok(Ok((stream, _))) => return Ok(stream),
        Ok(Err(err)) => format!("connect failed: {err}"),
        Err(_) => format!("connect timed out after {:?}", connector.connect_timeout),
    };
    error!(connection = id, url = %url, "{failure}");
    Err(failure)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn refused_connect_is_reported_without_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local port");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let connector = WebSocketConnector::new(&ClientConfig::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connection = connector.open(&format!("ws://127.0.0.1:{port}"), 3, events_tx);

        let first = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("error arrives promptly")
            .expect("event");
        assert_eq!(first.connection, 3);
        assert!(
            matches!(&first.kind, TransportEventKind::Error(reason) if reason.starts_with("connect failed")),
            "unexpected event: {first:?}"
        );

        let second = timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("disconnect follows")
            .expect("event");
        assert_eq!(second.kind, TransportEventKind::Disconnected);
        assert!(!connection.is_valid());
    }

    #[tokio::test]
    async fn invalid_url_fails_before_connecting() {
        let connector = WebSocketConnector::new(&ClientConfig::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _connection = connector.open("not a url", 1, events_tx);

        let first = events_rx.recv().await.expect("event");
        assert!(matches!(first.kind, TransportEventKind::Error(_)));
        let second = events_rx.recv().await.expect("event");
        assert_eq!(second.kind, TransportEventKind::Disconnected);
    }
}
