//! End-to-end tests for the gateway client against a scripted server
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use cordlink_gateway::protocol::{GatewayMessage, Intents};
use cordlink_gateway::{
    drive, ConnectionState, FixedDelay, GatewayClient, GatewayError, GatewayExtension, PollOutcome,
};
use integration_tests::{fixtures, test_config, MockGateway, Peer, TEST_TOKEN};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

type Events = mpsc::UnboundedReceiver<(String, Value)>;

fn client_for(gateway: &MockGateway) -> (GatewayClient, Events) {
    client_with(gateway, |_| {})
}

fn client_with(
    gateway: &MockGateway,
    configure: impl FnOnce(&mut cordlink_gateway::GatewayConfig),
) -> (GatewayClient, Events) {
    let mut config = test_config(&gateway.url());
    configure(&mut config);

    let (tx, rx) = mpsc::unbounded_channel();
    let client = GatewayClient::new(config).with_dispatcher(move |event, data| {
        let _ = tx.send((event.to_string(), data.clone()));
    });
    (client, rx)
}

/// Connect a fresh client and deliver READY
async fn ready_client(gateway: &mut MockGateway) -> (GatewayClient, Events, Peer) {
    let (mut client, events) = client_for(gateway);

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(45_000));
    connected.expect("connect failed");
    let (mut peer, identify) = accepted.expect("server script failed");
    assert_eq!(identify["op"], 2);

    peer.send_json(&fixtures::ready(1, "abc")).await.unwrap();
    assert!(client.poll_once().await.is_continue());

    (client, events, peer)
}

async fn poll_with_timeout(client: &mut GatewayClient) -> PollOutcome {
    tokio::time::timeout(Duration::from_secs(5), client.poll_once())
        .await
        .expect("poll_once hung")
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_identify_and_ready() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, mut events) = client_for(&gateway);

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(45_000));
    connected.unwrap();
    let (mut peer, identify) = accepted.unwrap();

    assert!(peer.uri().contains("v=9"));
    assert!(peer.uri().contains("encoding=json"));
    assert!(peer.uri().contains("compress=zlib-stream"));

    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], TEST_TOKEN);
    assert_eq!(
        identify["d"]["intents"],
        (Intents::GUILDS | Intents::GUILD_MESSAGES).bits()
    );
    assert_eq!(identify["d"]["properties"]["browser"], "cordlink");
    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(!client.is_closed());

    peer.send_json(&fixtures::ready(1, "abc")).await.unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    assert_eq!(client.session().session_id(), Some("abc"));
    assert_eq!(client.session().sequence(), Some(1));

    let (event, data) = events.recv().await.unwrap();
    assert_eq!(event, "READY");
    assert_eq!(data["session_id"], "abc");
}

#[tokio::test]
async fn test_ready_with_bare_session_id() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, mut events) = client_for(&gateway);

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(30_000));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();

    peer.send_json(&json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "abc"}}))
        .await
        .unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    assert_eq!(client.session().session_id(), Some("abc"));
    assert_eq!(client.session().sequence(), Some(1));
    assert_eq!(events.recv().await.unwrap(), ("READY".to_string(), json!({"session_id": "abc"})));

    peer.send_close(4000).await.unwrap();
    assert!(matches!(poll_with_timeout(&mut client).await, PollOutcome::Reconnect(_)));

    let (connected, accepted) = tokio::join!(client.connect(true), gateway.accept_with_hello(30_000));
    connected.unwrap();
    let (_peer, resume) = accepted.unwrap();
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 1);
}

#[tokio::test]
async fn test_hello_with_zero_interval_is_rejected() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);

    let server = async {
        let mut peer = gateway.accept().await?;
        peer.send_json(&fixtures::hello(0)).await?;
        peer.recv_close().await
    };

    let (connected, close_code) = tokio::join!(client.connect(false), server);

    let error = connected.unwrap_err();
    assert!(matches!(error, GatewayError::Protocol(_)));
    assert!(!error.is_reconnectable());
    assert_eq!(close_code.unwrap(), Some(4000));
    assert!(client.is_closed());
    assert!(client.latency().is_none());
}

#[tokio::test]
async fn test_hello_without_interval_is_rejected() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);

    let server = async {
        let mut peer = gateway.accept().await?;
        peer.send_json(&json!({"op": 10, "d": {}})).await?;
        peer.recv_close().await
    };

    let (connected, close_code) = tokio::join!(client.connect(false), server);

    assert!(matches!(connected, Err(GatewayError::Protocol(_))));
    assert!(close_code.unwrap().is_some());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dispatch_updates_sequence() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, mut events, mut peer) = ready_client(&mut gateway).await;
    events.recv().await.unwrap();

    peer.send_json(&fixtures::dispatch("MESSAGE_CREATE", 2, json!({"content": "hi"})))
        .await
        .unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    let (event, data) = events.recv().await.unwrap();
    assert_eq!(event, "MESSAGE_CREATE");
    assert_eq!(data["content"], "hi");
    assert_eq!(client.session().sequence(), Some(2));
}

#[tokio::test]
async fn test_first_message_must_be_hello() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);

    let server = async {
        let mut peer = gateway.accept().await?;
        peer.send_json(&fixtures::ready(1, "abc")).await?;
        peer.recv_close().await
    };

    let (connected, close_code) = tokio::join!(client.connect(false), server);

    let error = connected.unwrap_err();
    assert!(matches!(error, GatewayError::UnexpectedFirstMessage(0)));
    assert!(!error.is_reconnectable());
    assert!(close_code.unwrap().is_some());
    assert!(client.is_closed());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_compressed_stream() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, mut events) = client_for(&gateway);

    let server = async {
        let mut peer = gateway.accept().await?;
        peer.send_compressed(&fixtures::hello(45_000), 1).await?;
        let identify = peer.recv_json().await?;
        Ok::<_, anyhow::Error>((peer, identify))
    };

    let (connected, accepted) = tokio::join!(client.connect(false), server);
    connected.unwrap();
    let (mut peer, identify) = accepted.unwrap();
    assert_eq!(identify["op"], 2);

    // Split across frames and sharing the stream's dictionary with Hello
    peer.send_compressed(&fixtures::ready(1, "abc"), 3).await.unwrap();
    for _ in 0..3 {
        assert!(poll_with_timeout(&mut client).await.is_continue());
    }
    assert_eq!(client.session().session_id(), Some("abc"));

    let big = "x".repeat(64 * 1024);
    peer.send_compressed(&fixtures::dispatch("GUILD_CREATE", 2, json!({"blob": big})), 1)
        .await
        .unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    events.recv().await.unwrap();
    let (event, data) = events.recv().await.unwrap();
    assert_eq!(event, "GUILD_CREATE");
    assert_eq!(data["blob"].as_str().map(str::len), Some(64 * 1024));
    assert_eq!(client.session().sequence(), Some(2));
}

// ============================================================================
// Close handling
// ============================================================================

#[tokio::test]
async fn test_resumable_close_requests_reconnect() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_close(4000).await.unwrap();

    match poll_with_timeout(&mut client).await {
        PollOutcome::Reconnect(GatewayError::Closed { code, .. }) => assert_eq!(code, 4000),
        other => panic!("expected reconnect, got {other:?}"),
    }
    assert!(client.is_closed());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.session().can_resume());
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_close(4004).await.unwrap();

    match poll_with_timeout(&mut client).await {
        PollOutcome::Fatal(error) => {
            assert_eq!(error.peer_code(), Some(4004));
            assert!(!error.allows_reidentify());
        }
        other => panic!("expected fatal, got {other:?}"),
    }
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_reconnect_opcode_closes_normally() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_json(&fixtures::reconnect()).await.unwrap();

    let (outcome, close_code) = tokio::join!(poll_with_timeout(&mut client), peer.recv_close());
    assert!(matches!(outcome, PollOutcome::Reconnect(GatewayError::ReconnectRequested)));
    assert_eq!(close_code.unwrap(), Some(1000));
}

#[tokio::test]
async fn test_resumable_invalid_session() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_json(&fixtures::invalid_session(true)).await.unwrap();

    let (outcome, close_code) = tokio::join!(poll_with_timeout(&mut client), peer.recv_close());
    assert!(matches!(
        outcome,
        PollOutcome::Reconnect(GatewayError::InvalidSession { resumable: true })
    ));
    assert_eq!(close_code.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_non_resumable_invalid_session() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_json(&fixtures::invalid_session(false)).await.unwrap();

    let (outcome, close_code) = tokio::join!(poll_with_timeout(&mut client), peer.recv_close());
    match outcome {
        PollOutcome::Fatal(error) => assert!(error.allows_reidentify()),
        other => panic!("expected fatal, got {other:?}"),
    }
    assert_eq!(close_code.unwrap(), Some(1000));
}

#[tokio::test]
async fn test_client_close_is_idempotent() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    let (_, close_code) = tokio::join!(client.close(None), peer.recv_close());
    assert_eq!(close_code.unwrap(), Some(4000));
    assert!(client.is_closed());

    client.close(None).await;
    client.close(Some(1000)).await;
    assert!(client.is_closed());

    assert!(matches!(
        poll_with_timeout(&mut client).await,
        PollOutcome::Reconnect(GatewayError::NotConnected)
    ));
}

// ============================================================================
// Heartbeat and timeouts
// ============================================================================

#[tokio::test]
async fn test_heartbeat_ack_measures_latency() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(100));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();
    assert!(client.latency().is_none());

    let server = async {
        let heartbeat = peer.recv_op(1).await?;
        peer.send_json(&fixtures::heartbeat_ack()).await?;
        Ok::<_, anyhow::Error>(heartbeat)
    };

    let (outcome, heartbeat) = tokio::join!(poll_with_timeout(&mut client), server);
    assert!(outcome.is_continue());
    assert_eq!(heartbeat.unwrap(), json!({"op": 1, "d": null}));

    let latency = client.latency().expect("latency after ACK");
    assert!(latency < Duration::from_secs(1));
}

#[tokio::test]
async fn test_heartbeat_carries_last_sequence() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(100));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();

    peer.send_json(&fixtures::ready(7, "abc")).await.unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    let heartbeat = peer.recv_op(1).await.unwrap();
    assert_eq!(heartbeat["d"], 7);
}

#[tokio::test]
async fn test_heartbeat_silence_forces_close() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_with(&gateway, |config| {
        config.heartbeat_grace_factor = 1.5;
    });

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(200));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();

    // Never ack and never send: the supervisor gives up after 1.5 intervals
    let (outcome, close_code) = tokio::join!(poll_with_timeout(&mut client), peer.recv_close());

    assert!(matches!(outcome, PollOutcome::Reconnect(GatewayError::HeartbeatTimeout)));
    assert_eq!(close_code.unwrap(), Some(4900));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_read_timeout_requests_reconnect() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_with(&gateway, |config| {
        config.read_timeout_slack = Duration::ZERO;
        config.heartbeat_grace_factor = 20.0;
    });

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(100));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();

    let (outcome, close_code) = tokio::join!(poll_with_timeout(&mut client), peer.recv_close());

    match outcome {
        PollOutcome::Reconnect(GatewayError::ReadTimeout(wait)) => {
            assert_eq!(wait, Duration::from_millis(200));
        }
        other => panic!("expected read timeout, got {other:?}"),
    }
    assert_eq!(close_code.unwrap(), Some(4000));
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_resume_sends_session_and_sequence() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    peer.send_json(&fixtures::dispatch("MESSAGE_CREATE", 2, json!({})))
        .await
        .unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());

    peer.send_close(4000).await.unwrap();
    assert!(matches!(poll_with_timeout(&mut client).await, PollOutcome::Reconnect(_)));

    let (connected, accepted) = tokio::join!(client.connect(true), gateway.accept_with_hello(45_000));
    connected.unwrap();
    let (mut peer, resume) = accepted.unwrap();

    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["token"], TEST_TOKEN);
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 2);

    peer.send_json(&fixtures::resumed(3)).await.unwrap();
    assert!(poll_with_timeout(&mut client).await.is_continue());
    assert_eq!(client.session().session_id(), Some("abc"));
    assert_eq!(client.session().sequence(), Some(3));
}

#[tokio::test]
async fn test_fresh_connect_discards_session() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events, mut peer) = ready_client(&mut gateway).await;

    let (_, _) = tokio::join!(client.close(None), peer.recv_close());
    assert_eq!(client.session().session_id(), Some("abc"));

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(45_000));
    connected.unwrap();
    let (_peer, identify) = accepted.unwrap();

    assert_eq!(identify["op"], 2);
    assert_eq!(client.session().session_id(), None);
    assert_eq!(client.session().sequence(), None);
}

// ============================================================================
// Extension hooks
// ============================================================================

struct Recorder(mpsc::UnboundedSender<u8>);

impl GatewayExtension for Recorder {
    fn unknown_payload(&mut self, message: &GatewayMessage) {
        let _ = self.0.send(message.op);
    }
}

#[tokio::test]
async fn test_unhandled_payloads_reach_extension() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (tx, mut forwarded) = mpsc::unbounded_channel();
    let mut client = GatewayClient::new(test_config(&gateway.url())).with_extension(Recorder(tx));

    let (connected, accepted) = tokio::join!(client.connect(false), gateway.accept_with_hello(45_000));
    connected.unwrap();
    let (mut peer, _identify) = accepted.unwrap();

    peer.send_json(&fixtures::heartbeat_request()).await.unwrap();
    peer.send_json(&json!({"op": 42, "d": {"hello": "world"}})).await.unwrap();

    assert!(poll_with_timeout(&mut client).await.is_continue());
    assert!(poll_with_timeout(&mut client).await.is_continue());

    assert_eq!(forwarded.recv().await, Some(1));
    assert_eq!(forwarded.recv().await, Some(42));
    assert!(!client.is_closed());
}

// ============================================================================
// Reconnect loop
// ============================================================================

#[tokio::test]
async fn test_drive_resumes_until_fatal_close() {
    let mut gateway = MockGateway::start().await.unwrap();
    let (mut client, _events) = client_for(&gateway);
    let strategy = FixedDelay::new(Duration::from_millis(10), Some(5));

    let server = async {
        let (mut first, identify) = gateway.accept_with_hello(45_000).await?;
        first.send_json(&fixtures::ready(1, "abc")).await?;
        first.send_close(4000).await?;

        let (mut second, resume) = gateway.accept_with_hello(45_000).await?;
        second.send_close(4004).await?;
        Ok::<_, anyhow::Error>((identify, resume))
    };

    let (result, script) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(10), drive(&mut client, &strategy)),
        server
    );

    let (identify, resume) = script.unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 1);

    let error = result.expect("drive hung").unwrap_err();
    assert_eq!(error.peer_code(), Some(4004));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_drive_gives_up_when_strategy_is_exhausted() {
    // Nothing listens on a port released right after binding
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut client = GatewayClient::new(test_config(&url));
    let strategy = FixedDelay::new(Duration::from_millis(1), Some(2));

    let result = tokio::time::timeout(Duration::from_secs(10), drive(&mut client, &strategy))
        .await
        .expect("drive hung");

    assert!(matches!(result, Err(GatewayError::WebSocket(_))));
}
