use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use wavelength_client::{
    ClientConfig, EventKind, EventSubscription, SessionError, SessionEvent, SessionHandle,
    events::AuthFailure, ptt::NullAudio, spawn_session, transport::WebSocketConnector,
};
use wavelength_relay::{AppState, build_router};

async fn start_relay() -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let port = listener.local_addr().expect("relay local addr").port();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(AppState::new())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (port, shutdown_tx)
}

fn start_client(port: u16) -> (SessionHandle, EventSubscription) {
    let config = ClientConfig {
        relay_host: "127.0.0.1".to_owned(),
        relay_port: port,
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    let connector = Arc::new(WebSocketConnector::new(&config));
    let (handle, events, _task) = spawn_session(config, connector, Box::new(NullAudio));
    let subscription = events.subscribe_kinds(&[
        EventKind::Lifecycle,
        EventKind::Failure,
        EventKind::Chat,
        EventKind::Presence,
        EventKind::Ptt,
        EventKind::Audio,
    ]);
    (handle, subscription)
}

async fn wait_for(
    events: &mut EventSubscription,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event arrives in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_and_guest_chat_then_host_closes() {
    let (port, shutdown_tx) = start_relay().await;
    let (host, mut host_events) = start_client(port);
    let (guest, mut guest_events) = start_client(port);

    host.create_wavelength("145.8", Some("secret"))
        .await
        .expect("create accepted");
    wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::WavelengthCreated { frequency } if frequency == "145.8")
    })
    .await;

    guest
        .join_wavelength("145.8", Some("secret"))
        .await
        .expect("join accepted");
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::WavelengthJoined { .. })
    })
    .await;
    wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::PresenceChanged { joined: true, .. })
    })
    .await;

    host.send_text("hello from the host").await.expect("sent");
    let received = wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::MessageReceived { .. })
    })
    .await;
    let SessionEvent::MessageReceived { message, .. } = received else {
        unreachable!();
    };
    assert_eq!(message.sender_label, "Host");
    assert_eq!(message.content, "hello from the host");
    assert!(!message.is_self);

    let echo = wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::MessageReceived { .. })
    })
    .await;
    let SessionEvent::MessageReceived { message, .. } = echo else {
        unreachable!();
    };
    assert!(message.is_self);

    guest.send_text("hi host").await.expect("sent");
    let from_guest = wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::MessageReceived { message, .. } if !message.is_self)
    })
    .await;
    let SessionEvent::MessageReceived { message, .. } = from_guest else {
        unreachable!();
    };
    assert!(message.sender_label.starts_with("User "));

    host.close_wavelength("145.8").await.expect("closed");
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::WavelengthClosed { frequency } if frequency == "145.8")
    })
    .await;
    assert_eq!(guest.active_wavelength().await.expect("loop alive"), None);

    host.shutdown().await.expect("host shutdown");
    guest.shutdown().await.expect("guest shutdown");
    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_password_is_reported_as_auth_failure() {
    let (port, shutdown_tx) = start_relay().await;
    let (host, mut host_events) = start_client(port);
    let (guest, mut guest_events) = start_client(port);

    host.create_wavelength("99.9", Some("secret"))
        .await
        .expect("create accepted");
    wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::WavelengthCreated { .. })
    })
    .await;

    guest
        .join_wavelength("99.9", Some("wrong"))
        .await
        .expect("join accepted");
    let failure = wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::AuthenticationFailed { .. })
    })
    .await;
    assert_eq!(
        failure,
        SessionEvent::AuthenticationFailed {
            frequency: "99.9".to_owned(),
            reason: AuthFailure::InvalidPassword,
        }
    );
    assert!(guest.frequencies().await.expect("loop alive").is_empty());

    host.shutdown().await.expect("host shutdown");
    guest.shutdown().await.expect("guest shutdown");
    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_to_talk_reaches_the_other_member() {
    let (port, shutdown_tx) = start_relay().await;
    let (host, mut host_events) = start_client(port);
    let (guest, mut guest_events) = start_client(port);

    host.create_wavelength("7", None).await.expect("create");
    wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::WavelengthCreated { .. })
    })
    .await;
    guest.join_wavelength("7", None).await.expect("join");
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::WavelengthJoined { .. })
    })
    .await;

    host.press_ptt().await.expect("press");
    wait_for(&mut host_events, |event| {
        matches!(event, SessionEvent::PttGranted { .. })
    })
    .await;
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::PttStartReceiving { .. })
    })
    .await;

    // The guest is receiving, so its talk button is locked.
    assert!(matches!(
        guest.press_ptt().await,
        Err(SessionError::PttBusy)
    ));

    host.push_captured_audio(Bytes::from_static(&[0, 32, 0, 32, 0, 32]))
        .expect("loop alive");
    let audio = wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::AudioReceived { .. })
    })
    .await;
    assert_eq!(
        audio,
        SessionEvent::AudioReceived {
            frequency: "7".to_owned(),
            data: Bytes::from_static(&[0, 32, 0, 32, 0, 32]),
        }
    );

    host.release_ptt().await.expect("release");
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::PttStopReceiving { .. })
    })
    .await;

    host.shutdown().await.expect("host shutdown");
    guest.shutdown().await.expect("guest shutdown");
    let _ = shutdown_tx.send(());
}
