use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, Utf8Bytes, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wavelength_core::{
    AmplitudeUpdate, ChatMessage, DEFAULT_PTT_DENIED_REASON, ERR_INVALID_PASSWORD,
    ERR_PASSWORD_REQUIRED, ERR_WAVELENGTH_EXISTS, ERR_WAVELENGTH_MISSING, Envelope, ErrorNotice,
    Frequency, FrequencyRef, HandshakeResult, JoinWavelength, Presence, PttNotice,
    RegisterWavelength, Timestamp, decode_envelope, encode_envelope, hash_password,
    pcm_rms_amplitude,
};

/// Upper bound for a single inbound frame; base64 file payloads travel inline.
pub const MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const SEEN_MESSAGE_CAPACITY: usize = 1000;

type ConnId = u64;
type Outbound = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone)]
struct Member {
    client_id: String,
    tx: Outbound,
}

#[derive(Debug)]
struct Wavelength {
    host: ConnId,
    host_id: String,
    password_hash: Option<String>,
    members: HashMap<ConnId, Member>,
    seen_messages: HashSet<String>,
    seen_order: VecDeque<String>,
    floor: Option<ConnId>,
}

impl Wavelength {
    fn others(&self, conn: ConnId) -> Vec<Outbound> {
        self.members
            .iter()
            .filter(|(id, _)| **id != conn)
            .map(|(_, member)| member.tx.clone())
            .collect()
    }

    fn everyone(&self) -> Vec<Outbound> {
        self.members.values().map(|member| member.tx.clone()).collect()
    }

    /// Returns false when the id was already relayed on this wavelength.
    fn remember_message(&mut self, message_id: &str) -> bool {
        if !self.seen_messages.insert(message_id.to_owned()) {
            return false;
        }
        self.seen_order.push_back(message_id.to_owned());
        while self.seen_order.len() > SEEN_MESSAGE_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_messages.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct RelayState {
    wavelengths: HashMap<Frequency, Wavelength>,
}

impl RelayState {
    fn joined_mut(&mut self, frequency: &str, conn: ConnId) -> Option<&mut Wavelength> {
        self.wavelengths
            .get_mut(frequency)
            .filter(|wavelength| wavelength.members.contains_key(&conn))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn wavelength_count(&self) -> usize {
        self.inner.read().await.wavelengths.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// Per-socket bookkeeping owned by the reader loop.
struct Session {
    conn: ConnId,
    client_id: Option<String>,
    frequency: Option<Frequency>,
    tx: Outbound,
    rate_limiter: TokenBucket,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "wavelengths": state.wavelength_count().await,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_MESSAGE_BYTES)
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(state: AppState, socket: WebSocket) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut session = Session {
        conn: state.next_conn.fetch_add(1, Ordering::Relaxed),
        client_id: None,
        frequency: None,
        tx: outbound_tx,
        rate_limiter: TokenBucket::new(24.0, 12.0),
    };
    debug!(conn = session.conn, "socket connected");

    let mut result = Ok(());
    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                result = Err(err.to_string());
                break;
            }
        };

        match message {
            Message::Text(text) => handle_text(&state, &mut session, text.as_str()).await,
            Message::Binary(data) => forward_audio(&state, &session, data).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    leave(&state, &mut session).await;
    send_task.abort();
    debug!(conn = session.conn, "socket disconnected");
    result
}

async fn handle_text(state: &AppState, session: &mut Session, text: &str) {
    let envelope = match decode_envelope(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(conn = session.conn, "rejecting frame: {}", err);
            reply_error(&session.tx, &err.to_string());
            return;
        }
    };

    match envelope {
        Envelope::RegisterWavelength(request) => register(state, session, request).await,
        Envelope::JoinWavelength(request) => join(state, session, request).await,
        Envelope::SendMessage(chat) | Envelope::SendFile(chat) => {
            relay_chat(state, session, chat).await
        }
        Envelope::LeaveWavelength(_) => leave(state, session).await,
        Envelope::CloseWavelength(_) => close(state, session).await,
        Envelope::RequestPtt(_) => request_floor(state, session).await,
        Envelope::ReleasePtt(_) => release_floor(state, session).await,
        other => {
            warn!(conn = session.conn, "unsupported envelope {}", other.kind());
            reply_error(&session.tx, &format!("Unsupported message type: {}", other.kind()));
        }
    }
}

async fn register(state: &AppState, session: &mut Session, request: RegisterWavelength) {
    let frequency = request.frequency.trim().to_owned();
    let failure = |error: &str| {
        Envelope::RegisterResult(HandshakeResult {
            success: false,
            frequency: Some(frequency.clone()),
            host_id: None,
            error: Some(error.to_owned()),
        })
    };

    if frequency.is_empty() {
        send_envelope(&session.tx, &failure("Frequency is required"));
        return;
    }
    if session.frequency.is_some() {
        send_envelope(&session.tx, &failure("Connection already bound to a wavelength"));
        return;
    }

    let mut relay = state.inner.write().await;
    if relay.wavelengths.contains_key(&frequency) {
        drop(relay);
        send_envelope(&session.tx, &failure(ERR_WAVELENGTH_EXISTS));
        return;
    }

    let host_id = if request.host_id.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        request.host_id
    };
    let password_hash = (request.is_password_protected && !request.password.is_empty())
        .then(|| hash_password(&request.password));

    let mut members = HashMap::new();
    members.insert(
        session.conn,
        Member {
            client_id: host_id.clone(),
            tx: session.tx.clone(),
        },
    );
    relay.wavelengths.insert(
        frequency.clone(),
        Wavelength {
            host: session.conn,
            host_id: host_id.clone(),
            password_hash,
            members,
            seen_messages: HashSet::new(),
            seen_order: VecDeque::new(),
            floor: None,
        },
    );
    drop(relay);

    info!(frequency = %frequency, host = %host_id, "wavelength registered");
    session.client_id = Some(host_id.clone());
    session.frequency = Some(frequency.clone());
    send_envelope(
        &session.tx,
        &Envelope::RegisterResult(HandshakeResult {
            success: true,
            frequency: Some(frequency),
            host_id: Some(host_id),
            error: None,
        }),
    );
}

async fn join(state: &AppState, session: &mut Session, request: JoinWavelength) {
    let frequency = request.frequency.trim().to_owned();
    let failure = |error: &str| {
        Envelope::JoinResult(HandshakeResult {
            success: false,
            frequency: Some(frequency.clone()),
            host_id: None,
            error: Some(error.to_owned()),
        })
    };

    if session.frequency.is_some() {
        send_envelope(&session.tx, &failure("Connection already bound to a wavelength"));
        return;
    }

    let client_id = if request.client_id.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        request.client_id
    };

    let mut relay = state.inner.write().await;
    let Some(wavelength) = relay.wavelengths.get_mut(&frequency) else {
        drop(relay);
        send_envelope(&session.tx, &failure(ERR_WAVELENGTH_MISSING));
        return;
    };

    if let Some(expected) = &wavelength.password_hash {
        let rejection = match request.password.as_deref() {
            None | Some("") => Some(ERR_PASSWORD_REQUIRED),
            Some(password) if hash_password(password) != *expected => Some(ERR_INVALID_PASSWORD),
            Some(_) => None,
        };
        if let Some(rejection) = rejection {
            drop(relay);
            warn!(frequency = %frequency, "join rejected: {}", rejection);
            send_envelope(&session.tx, &failure(rejection));
            return;
        }
    }

    wavelength.members.insert(
        session.conn,
        Member {
            client_id: client_id.clone(),
            tx: session.tx.clone(),
        },
    );
    let host_id = wavelength.host_id.clone();
    let recipients = wavelength.others(session.conn);
    drop(relay);

    info!(frequency = %frequency, client = %client_id, "client joined wavelength");
    session.client_id = Some(client_id.clone());
    session.frequency = Some(frequency.clone());
    send_envelope(
        &session.tx,
        &Envelope::JoinResult(HandshakeResult {
            success: true,
            frequency: Some(frequency.clone()),
            host_id: Some(host_id),
            error: None,
        }),
    );
    broadcast(
        &recipients,
        &Envelope::UserJoined(Presence {
            user_id: Some(client_id),
            frequency: Some(frequency),
        }),
    );
}

async fn relay_chat(state: &AppState, session: &mut Session, mut chat: ChatMessage) {
    let Some(frequency) = session.frequency.clone() else {
        reply_error(&session.tx, "Not joined to a wavelength");
        return;
    };
    if !session.rate_limiter.consume(1.0) {
        warn!(conn = session.conn, frequency = %frequency, "rate limit exceeded");
        return;
    }

    let message_id = chat
        .message_id
        .take()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut relay = state.inner.write().await;
    let Some(wavelength) = relay.joined_mut(&frequency, session.conn) else {
        drop(relay);
        reply_error(&session.tx, ERR_WAVELENGTH_MISSING);
        return;
    };
    if !wavelength.remember_message(&message_id) {
        debug!(frequency = %frequency, message_id = %message_id, "duplicate message dropped");
        return;
    }
    let recipients = wavelength.others(session.conn);
    drop(relay);

    chat.frequency = Some(frequency);
    chat.message_id = Some(message_id);
    chat.sender_id = session.client_id.clone();
    chat.timestamp = Some(Timestamp::Millis(chrono::Utc::now().timestamp_millis()));
    chat.is_self = false;

    let mut echo = chat.clone();
    echo.is_self = true;
    echo.attachment_data = None;

    send_envelope(&session.tx, &Envelope::Message(echo));
    broadcast(&recipients, &Envelope::Message(chat));
}

/// Removes the session from its wavelength. A departing host closes the wavelength.
async fn leave(state: &AppState, session: &mut Session) {
    let Some(frequency) = session.frequency.take() else {
        return;
    };

    let mut relay = state.inner.write().await;
    let is_host = match relay.joined_mut(&frequency, session.conn) {
        Some(wavelength) => wavelength.host == session.conn,
        None => return,
    };

    if is_host {
        let recipients = relay
            .wavelengths
            .remove(&frequency)
            .map(|wavelength| wavelength.others(session.conn))
            .unwrap_or_default();
        drop(relay);
        info!(frequency = %frequency, "host left, wavelength closed");
        broadcast(
            &recipients,
            &Envelope::WavelengthClosed(FrequencyRef::new(frequency)),
        );
        return;
    }

    let Some(wavelength) = relay.wavelengths.get_mut(&frequency) else {
        return;
    };
    let departed = wavelength.members.remove(&session.conn);
    let dropped_floor = wavelength.floor == Some(session.conn);
    if dropped_floor {
        wavelength.floor = None;
    }
    let recipients = wavelength.everyone();
    drop(relay);

    if dropped_floor {
        broadcast(
            &recipients,
            &Envelope::PttStopReceiving(PttNotice {
                frequency: Some(frequency.clone()),
                ..PttNotice::default()
            }),
        );
    }
    broadcast(
        &recipients,
        &Envelope::UserLeft(Presence {
            user_id: departed.map(|member| member.client_id),
            frequency: Some(frequency.clone()),
        }),
    );
    info!(frequency = %frequency, conn = session.conn, "client left wavelength");
}

async fn close(state: &AppState, session: &mut Session) {
    let Some(frequency) = session.frequency.clone() else {
        reply_error(&session.tx, "Not joined to a wavelength");
        return;
    };

    let mut relay = state.inner.write().await;
    let is_host = relay
        .joined_mut(&frequency, session.conn)
        .is_some_and(|wavelength| wavelength.host == session.conn);
    if !is_host {
        drop(relay);
        reply_error(&session.tx, "Only the host can close the wavelength");
        return;
    }

    let recipients = relay
        .wavelengths
        .remove(&frequency)
        .map(|wavelength| wavelength.others(session.conn))
        .unwrap_or_default();
    drop(relay);

    session.frequency = None;
    info!(frequency = %frequency, "wavelength closed by host");
    broadcast(
        &recipients,
        &Envelope::WavelengthClosed(FrequencyRef::new(frequency)),
    );
}

async fn request_floor(state: &AppState, session: &Session) {
    let Some(frequency) = session.frequency.clone() else {
        reply_error(&session.tx, "Not joined to a wavelength");
        return;
    };

    let mut relay = state.inner.write().await;
    let Some(wavelength) = relay.joined_mut(&frequency, session.conn) else {
        return;
    };
    if wavelength.floor.is_some_and(|holder| holder != session.conn) {
        drop(relay);
        send_envelope(
            &session.tx,
            &Envelope::PttDenied(PttNotice {
                frequency: Some(frequency),
                reason: Some(DEFAULT_PTT_DENIED_REASON.to_owned()),
                sender_id: None,
            }),
        );
        return;
    }
    wavelength.floor = Some(session.conn);
    let recipients = wavelength.others(session.conn);
    drop(relay);

    debug!(frequency = %frequency, conn = session.conn, "floor granted");
    send_envelope(
        &session.tx,
        &Envelope::PttGranted(PttNotice {
            frequency: Some(frequency.clone()),
            ..PttNotice::default()
        }),
    );
    broadcast(
        &recipients,
        &Envelope::PttStartReceiving(PttNotice {
            frequency: Some(frequency),
            reason: None,
            sender_id: session.client_id.clone(),
        }),
    );
}

async fn release_floor(state: &AppState, session: &Session) {
    let Some(frequency) = session.frequency.clone() else {
        return;
    };

    let mut relay = state.inner.write().await;
    let Some(wavelength) = relay.joined_mut(&frequency, session.conn) else {
        return;
    };
    if wavelength.floor != Some(session.conn) {
        return;
    }
    wavelength.floor = None;
    let recipients = wavelength.others(session.conn);
    drop(relay);

    debug!(frequency = %frequency, conn = session.conn, "floor released");
    broadcast(
        &recipients,
        &Envelope::PttStopReceiving(PttNotice {
            frequency: Some(frequency),
            ..PttNotice::default()
        }),
    );
}

async fn forward_audio(state: &AppState, session: &Session, data: axum::body::Bytes) {
    let Some(frequency) = session.frequency.as_deref() else {
        return;
    };

    let recipients = {
        let relay = state.inner.read().await;
        match relay.wavelengths.get(frequency) {
            Some(wavelength) if wavelength.floor == Some(session.conn) => {
                wavelength.others(session.conn)
            }
            _ => {
                debug!(conn = session.conn, "dropping audio from non-holder");
                return;
            }
        }
    };

    let amplitude = f64::from(pcm_rms_amplitude(&data));
    for tx in &recipients {
        let _ = tx.send(Message::Binary(data.clone()));
    }
    broadcast(
        &recipients,
        &Envelope::AudioAmplitude(AmplitudeUpdate {
            frequency: Some(frequency.to_owned()),
            amplitude,
        }),
    );
}

fn reply_error(tx: &Outbound, message: &str) {
    send_envelope(
        tx,
        &Envelope::Error(ErrorNotice {
            error: message.to_owned(),
        }),
    );
}

fn send_envelope(tx: &Outbound, envelope: &Envelope) {
    broadcast(std::slice::from_ref(tx), envelope);
}

fn broadcast(recipients: &[Outbound], envelope: &Envelope) {
    let text = match encode_envelope(envelope) {
        Ok(text) => Utf8Bytes::from(text),
        Err(err) => {
            error!("failed to serialize {} envelope: {}", envelope.kind(), err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Text(text.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wavelength() -> Wavelength {
        Wavelength {
            host: 1,
            host_id: "host".to_owned(),
            password_hash: None,
            members: HashMap::new(),
            seen_messages: HashSet::new(),
            seen_order: VecDeque::new(),
            floor: None,
        }
    }

    #[test]
    fn duplicate_message_ids_are_rejected() {
        let mut wavelength = wavelength();
        assert!(wavelength.remember_message("m1"));
        assert!(!wavelength.remember_message("m1"));
        assert!(wavelength.remember_message("m2"));
    }

    #[test]
    fn seen_messages_are_bounded() {
        let mut wavelength = wavelength();
        for index in 0..=SEEN_MESSAGE_CAPACITY {
            assert!(wavelength.remember_message(&format!("m{index}")));
        }
        assert_eq!(wavelength.seen_order.len(), SEEN_MESSAGE_CAPACITY);
        assert!(wavelength.remember_message("m0"), "oldest id should be forgotten");
    }

    #[test]
    fn token_bucket_empties_and_refuses() {
        let mut bucket = TokenBucket::new(2.0, 0.0);
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }
}
