// End-to-end tests for the voice session lifecycle
//
// Each session runs against scripted microphones, in-memory peers, the mock
// WHIP endpoint and an in-memory orchestrator link.

mod common;

use common::{
    negotiator_config, spawn_whip, FakeDevices, FakePeerFactory, Grant, MemoryConnector,
    SeenOffers, ServerEnd, WhipReply,
};
use loqa_voice::audio::ConnectionQuality;
use loqa_voice::error::ErrorKind;
use loqa_voice::negotiation::ConnectionState;
use loqa_voice::pipeline::PipelineStep;
use loqa_voice::session::{SessionConfig, SessionSnapshot, Speaker, VoiceSession};
use loqa_voice::signaling::{ChannelConfig, Frame};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Harness {
    session: Arc<VoiceSession>,
    devices: Arc<FakeDevices>,
    peers: Arc<FakePeerFactory>,
    connector: Arc<MemoryConnector>,
    offers: SeenOffers,
}

async fn harness_custom(
    grant: Grant,
    peers: Arc<FakePeerFactory>,
    configure: impl FnOnce(&mut SessionConfig),
) -> Harness {
    let (url, offers) = spawn_whip(WhipReply::Answer).await;
    let devices = FakeDevices::new(grant);
    let connector = MemoryConnector::new();

    let mut config = SessionConfig {
        negotiator: negotiator_config(&url),
        channel: ChannelConfig {
            url: "memory://orchestrator".into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
        },
        ..SessionConfig::default()
    };
    configure(&mut config);
    let session = VoiceSession::new(config, devices.clone(), peers.clone(), connector.clone())
        .unwrap();

    Harness {
        session: Arc::new(session),
        devices,
        peers,
        connector,
        offers,
    }
}

async fn harness_with(grant: Grant, reconnect_delay: Duration) -> Harness {
    harness_custom(grant, FakePeerFactory::new(), |config| {
        config.reconnect_delay = reconnect_delay
    })
    .await
}

/// Wait until the transport is back up on peer number `peers`
async fn wait_for_peer(h: &Harness, peers: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.peers.created() < peers
            || h.session.connection_state() != ConnectionState::Connected
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("renegotiated");
}

async fn harness(grant: Grant) -> Harness {
    harness_with(grant, Duration::from_secs(5)).await
}

/// Start and accept the orchestrator connection, skipping the bootstrap
async fn started(h: &Harness) -> (String, ServerEnd) {
    let id = h.session.start().await.unwrap();
    let mut server = h.connector.next_server().await;
    let info = server.next_json().await.unwrap();
    assert_eq!(info["type"], "session_info");
    assert_eq!(info["session_id"], id.as_str());
    (id, server)
}

async fn wait_for_snapshot(
    session: &VoiceSession,
    condition: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut snapshots = session.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(condition))
        .await
        .expect("snapshot condition")
        .unwrap()
        .clone();
    snapshot
}

#[tokio::test]
async fn test_start_connects_and_bootstraps_channel() {
    let h = harness(Grant::Allow).await;

    let (id, _server) = started(&h).await;

    assert!(id.starts_with("session-"));
    assert!(h.session.is_active().await);
    assert!(h.session.is_capturing().await);
    assert!(h.session.is_channel_open().await);
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);

    let snap = h.session.snapshot();
    assert!(snap.is_active);
    assert_eq!(snap.session_id.as_deref(), Some(id.as_str()));
    assert_eq!(snap.connection_state, ConnectionState::Connected);
    assert!(snap.error.is_none());

    let offers = h.offers.lock().unwrap().clone();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].1.as_deref(), Some(id.as_str()));

    let snap = wait_for_snapshot(&h.session, |s| s.transport.is_some()).await;
    assert_eq!(snap.quality, Some(ConnectionQuality::Excellent));
}

#[tokio::test]
async fn test_second_start_returns_current_session() {
    let h = harness(Grant::Allow).await;
    let (id, _server) = started(&h).await;

    assert_eq!(h.session.start().await.unwrap(), id);
    assert_eq!(h.peers.created(), 1);
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn test_denied_microphone_fails_without_channel() {
    let h = harness(Grant::Deny).await;

    let err = h.session.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MediaAcquisition);
    assert_eq!(h.session.connection_state(), ConnectionState::Failed);
    assert_eq!(h.connector.attempts(), 0);
    assert_eq!(h.peers.created(), 0);
    assert!(!h.session.is_active().await);

    let snap = h.session.snapshot();
    assert_eq!(snap.connection_state, ConnectionState::Failed);
    assert_eq!(snap.error.map(|e| e.kind), Some(ErrorKind::MediaAcquisition));
}

#[tokio::test]
async fn test_refused_channel_releases_media() {
    let h = harness(Grant::Allow).await;
    h.connector.refuse_attempt(1);

    let err = h.session.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChannelOpenFailed);
    assert!(h.peers.last().unwrap().is_closed());
    assert_eq!(h.devices.live_tracks(), 0);
    assert!(!h.session.is_capturing().await);
    assert!(!h.session.is_active().await);
    assert_eq!(
        h.session.snapshot().error.map(|e| e.kind),
        Some(ErrorKind::ChannelOpenFailed)
    );
}

#[tokio::test]
async fn test_stop_during_permission_prompt_cancels_start() {
    let h = harness(Grant::After(Duration::from_secs(2))).await;

    let pending = {
        let session = h.session.clone();
        tokio::spawn(async move { session.start().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.session.stop().await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(h.devices.tracks_handed_out(), 0);
    assert_eq!(h.peers.created(), 0);
    assert_eq!(h.connector.attempts(), 0);
    assert!(!h.session.is_active().await);
    assert!(h.session.snapshot().error.is_none());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_closes_gracefully() {
    let h = harness(Grant::Allow).await;
    let (id, mut server) = started(&h).await;

    h.session.stop().await;
    h.session.stop().await;

    let shutdown = server.next_json().await.unwrap();
    assert_eq!(shutdown["type"], "shutdown");
    assert_eq!(shutdown["session_id"], id.as_str());
    assert!(matches!(
        server.next_frame().await,
        Some(Frame::Close { code: 1000, .. })
    ));

    assert!(!h.session.is_active().await);
    assert!(!h.session.is_channel_open().await);
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert!(h.peers.last().unwrap().is_closed());
    assert_eq!(h.devices.live_tracks(), 0);

    let snap = h.session.snapshot();
    assert!(!snap.is_active);
    assert!(snap.session_id.is_none());
    assert_eq!(snap.audio_level, 0.0);
    assert!(snap.error.is_none());
}

#[tokio::test]
async fn test_intents_reach_orchestrator() {
    let h = harness(Grant::Allow).await;
    let (id, mut server) = started(&h).await;

    h.session.start_listening().await.unwrap();
    let listen = server.next_json().await.unwrap();
    assert_eq!(listen["event"], "start_listening");
    assert_eq!(listen["session_id"], id.as_str());
    assert_eq!(
        h.session.snapshot().pipeline.state.current_step,
        PipelineStep::Listening
    );

    server.send_text(r#"{"event":"final_transcript","text":"turn on the lights","confidence":0.95}"#);
    wait_for_snapshot(&h.session, |s| s.transcript == "turn on the lights").await;

    h.session.trigger_llm().await.unwrap();
    let trigger = server.next_json().await.unwrap();
    assert_eq!(trigger["event"], "trigger_llm");
    assert_eq!(trigger["final_transcript"], "turn on the lights");

    h.session.stop_listening().await.unwrap();
    assert_eq!(server.next_json().await.unwrap()["event"], "stop_listening");
}

#[tokio::test]
async fn test_intents_require_active_session() {
    let h = harness(Grant::Allow).await;

    let err = h.session.start_listening().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotActive);
    assert!(h.session.trigger_llm().await.is_err());
}

#[tokio::test]
async fn test_inbound_conversation_updates_snapshot() {
    let h = harness(Grant::Allow).await;
    let (_id, server) = started(&h).await;

    server.send_text(r#"{"event":"interim_transcript","text":"what is"}"#);
    server.send_text(r#"{"event":"final_transcript","text":"what is the weather"}"#);
    server.send_text(r#"{"type":"llm_response_text","response_text":"Sunny all day."}"#);

    let snap = wait_for_snapshot(&h.session, |s| s.ai_response.is_some()).await;

    assert_eq!(snap.transcript, "what is the weather");
    assert!(snap.interim_transcript.is_empty());
    assert_eq!(snap.ai_response.as_deref(), Some("Sunny all day."));

    let turns: Vec<_> = snap.history.turns().collect();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].speaker, Speaker::User);
    assert_eq!(turns[0].text, "what is the weather");
    assert_eq!(turns[1].speaker, Speaker::Assistant);
}

#[tokio::test]
async fn test_emergency_stop_mid_response() {
    let h = harness(Grant::Allow).await;
    let (_id, server) = started(&h).await;
    h.session.start_listening().await.unwrap();

    server.send_text(r#"{"type":"service_status","service":"tts","state":"executing","progress":0.5}"#);
    let snap = wait_for_snapshot(&h.session, |s| {
        s.pipeline.state.current_step == PipelineStep::TtsProcessing
    })
    .await;
    assert!(snap.pipeline.state.progress >= 0.5);

    h.session.emergency_stop().await;

    let snap = h.session.snapshot();
    assert_eq!(snap.pipeline.state.current_step, PipelineStep::Idle);
    assert_eq!(snap.pipeline.state.progress, 0.0);
    assert!(!snap.pipeline.state.is_listening);
    assert!(!snap.is_active);
    assert_eq!(h.devices.live_tracks(), 0);
    assert!(h.peers.last().unwrap().is_closed());
}

#[tokio::test]
async fn test_backend_error_does_not_end_session() {
    let h = harness(Grant::Allow).await;
    let (_id, server) = started(&h).await;
    h.session.start_listening().await.unwrap();

    server.send_text(r#"{"type":"error","message":"llm overloaded"}"#);
    let snap = wait_for_snapshot(&h.session, |s| {
        s.pipeline.state.current_step == PipelineStep::Error
    })
    .await;
    assert_eq!(snap.pipeline.state.error.as_deref(), Some("llm overloaded"));
    assert!(h.session.is_active().await);

    h.session.clear_error().await;
    let snap = h.session.snapshot();
    assert_eq!(snap.pipeline.state.current_step, PipelineStep::Idle);
    assert!(snap.pipeline.state.error.is_none());
}

#[tokio::test]
async fn test_single_reconnect_then_fatal() {
    let h = harness(Grant::Allow).await;
    let (_id, first) = started(&h).await;
    tokio::time::pause();

    let closed_at = Instant::now();
    first.close(1006);
    let mut second = h.connector.next_server().await;
    assert!(closed_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(second.next_json().await.unwrap()["type"], "session_info");

    // Still live between the two closes
    assert!(h.session.is_active().await);
    assert!(h.session.snapshot().error.is_none());

    second.close(1006);
    let snap = wait_for_snapshot(&h.session, |s| s.error.is_some()).await;
    assert_eq!(
        snap.error.map(|e| e.kind),
        Some(ErrorKind::ChannelClosedUnexpectedly)
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempts(), 2);
    assert!(!h.session.is_active().await);
    assert_eq!(h.devices.live_tracks(), 0);
}

#[tokio::test]
async fn test_traffic_after_reconnect_restores_budget() {
    let h = harness(Grant::Allow).await;
    let (_id, first) = started(&h).await;
    tokio::time::pause();

    first.close(1011);
    let second = h.connector.next_server().await;
    second.send_text(r#"{"type":"info","message":"welcome back"}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;

    second.close(1011);
    let _third = h.connector.next_server().await;
    assert_eq!(h.connector.attempts(), 3);
    assert!(h.session.is_active().await);
}

#[tokio::test]
async fn test_normal_close_from_server_is_not_retried() {
    let h = harness(Grant::Allow).await;
    let (_id, first) = started(&h).await;
    tokio::time::pause();

    first.close(1000);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.connector.attempts(), 1);
    assert!(!h.session.is_channel_open().await);
    assert!(h.session.snapshot().error.is_none());
}

#[tokio::test]
async fn test_transport_failure_is_renegotiated() {
    let h = harness_with(Grant::Allow, Duration::from_millis(100)).await;
    let (id, _server) = started(&h).await;

    h.peers.last().unwrap().fail_transport();
    wait_for_peer(&h, 2).await;

    let peers = h.peers.peers.lock().unwrap().clone();
    assert!(peers[0].is_closed());
    assert!(!peers[1].is_closed());

    let offers = h.offers.lock().unwrap().clone();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[1].1.as_deref(), Some(id.as_str()));

    // Same microphone, same session
    assert_eq!(h.devices.tracks_handed_out(), 1);
    assert!(h.session.is_active().await);
    assert!(h.session.snapshot().error.is_none());
}

#[tokio::test]
async fn test_failed_renegotiation_is_transport_failure() {
    let h = harness_custom(Grant::Allow, FakePeerFactory::limited(1), |config| {
        config.reconnect_delay = Duration::from_millis(100)
    })
    .await;
    let (id, mut server) = started(&h).await;

    h.peers.last().unwrap().fail_transport();

    let snap = wait_for_snapshot(&h.session, |s| s.error.is_some()).await;
    assert_eq!(snap.error.map(|e| e.kind), Some(ErrorKind::TransportFailure));

    // Full teardown
    assert!(!h.session.is_active().await);
    assert_eq!(h.devices.live_tracks(), 0);
    assert!(h.peers.last().unwrap().is_closed());
    assert_eq!(h.peers.created(), 1);
    let shutdown = server.next_json().await.unwrap();
    assert_eq!(shutdown["type"], "shutdown");
    assert_eq!(shutdown["session_id"], id.as_str());
}

#[tokio::test]
async fn test_transport_relapse_before_stable_is_fatal() {
    let h = harness_with(Grant::Allow, Duration::from_millis(100)).await;
    let (_id, _server) = started(&h).await;

    h.peers.last().unwrap().fail_transport();
    wait_for_peer(&h, 2).await;

    // Fails again well inside the stable period
    h.peers.last().unwrap().fail_transport();

    let snap = wait_for_snapshot(&h.session, |s| s.error.is_some()).await;
    assert_eq!(snap.error.map(|e| e.kind), Some(ErrorKind::TransportFailure));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.peers.created(), 2);
    assert!(!h.session.is_active().await);
    assert_eq!(h.devices.live_tracks(), 0);
}

#[tokio::test]
async fn test_stable_transport_restores_budget() {
    let h = harness_custom(Grant::Allow, FakePeerFactory::new(), |config| {
        config.reconnect_delay = Duration::from_millis(100);
        config.transport_stable_period = Duration::from_millis(200);
    })
    .await;
    let (_id, _server) = started(&h).await;

    h.peers.last().unwrap().fail_transport();
    wait_for_peer(&h, 2).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    h.peers.last().unwrap().fail_transport();
    wait_for_peer(&h, 3).await;

    assert!(h.session.is_active().await);
    assert!(h.session.snapshot().error.is_none());
    assert_eq!(h.devices.tracks_handed_out(), 1);
}

#[tokio::test]
async fn test_tts_audio_reaches_subscribers_in_order() {
    let h = harness(Grant::Allow).await;
    let (id, server) = started(&h).await;
    let mut chunks = h.session.tts_audio();

    server.send_binary(&[1, 2, 3]);
    server.send_text(r#"{"type":"tts_audio_chunk","audio_data":"BAUG"}"#);
    server.send_text(r#"{"event":"tts_audio_chunk","audio_data":"Bwg="}"#);

    let expected: [&[u8]; 3] = [&[1, 2, 3], &[4, 5, 6], &[7, 8]];
    for (sequence, audio) in expected.into_iter().enumerate() {
        let chunk = tokio::time::timeout(Duration::from_secs(2), chunks.recv())
            .await
            .expect("tts chunk")
            .unwrap();
        assert_eq!(chunk.session_id, id);
        assert_eq!(chunk.sequence, sequence as u64);
        assert_eq!(chunk.audio.as_ref(), audio);
    }
}

#[tokio::test]
async fn test_event_keyed_greeting_and_reply() {
    let h = harness(Grant::Allow).await;
    let (_id, server) = started(&h).await;

    server.send_text(r#"{"event":"greeting","text":"Hello! How may I help you today?"}"#);
    server.send_text(r#"{"event":"llm_response_text","text":"Sunny all day."}"#);

    let snap = wait_for_snapshot(&h.session, |s| s.ai_response.is_some()).await;
    assert_eq!(snap.ai_response.as_deref(), Some("Sunny all day."));
    let turns: Vec<_> = snap.history.turns().map(|t| (t.speaker, t.text.clone())).collect();
    assert_eq!(
        turns,
        vec![
            (Speaker::Assistant, "Hello! How may I help you today?".to_string()),
            (Speaker::Assistant, "Sunny all day.".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_dropping_session_releases_microphone_and_peer() {
    let h = harness(Grant::Allow).await;
    let (_id, _server) = started(&h).await;
    assert_eq!(h.devices.live_tracks(), 1);

    let Harness { session, devices, peers, .. } = h;
    drop(session);

    assert_eq!(devices.live_tracks(), 0);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !peers.last().unwrap().is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer closed");
}

#[test]
fn test_default_timings() {
    let config = SessionConfig::default();
    assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    assert_eq!(config.transport_stable_period, Duration::from_secs(30));
    assert_eq!(config.sample_interval, Duration::from_millis(100));
    assert_eq!(config.channel.heartbeat_interval, Duration::from_secs(30));
}
