use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use avatar_relay::agent::{
    AgentConnection, AgentError, AgentEvent, ReconnectPolicy, StaticUrl,
};
use avatar_relay::events::Subscription;

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Connect the agent while the server side accepts
async fn connected(agent: &AgentConnection, listener: &TcpListener) -> ServerSocket {
    let (result, server) = tokio::join!(agent.connect(), accept(listener));
    result.unwrap();
    server
}

/// Next JSON text frame from the client
async fn next_json(socket: &mut ServerSocket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("client went quiet")
            .expect("client closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        base_delay_ms: 20,
        max_delay_ms: 100,
    }
}

fn agent(url: &str) -> Arc<AgentConnection> {
    AgentConnection::new(Arc::new(StaticUrl(url.to_string())), fast_policy())
}

fn collect(agent: &AgentConnection) -> (mpsc::UnboundedReceiver<AgentEvent>, Subscription) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = agent.events().subscribe(move |e| {
        let _ = tx.send(e.clone());
    });
    (rx, sub)
}

async fn next_event<F>(rx: &mut mpsc::UnboundedReceiver<AgentEvent>, matches: F) -> AgentEvent
where
    F: Fn(&AgentEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

#[tokio::test]
async fn test_announces_input_format_on_open() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    agent.set_input_format("pcm_48000");

    let mut server = connected(&agent, &listener).await;

    let init = next_json(&mut server).await;
    assert_eq!(init["type"], "conversation_initiation_client_data");
    assert_eq!(
        init["conversation_config_override"]["agent"]["asr"]["user_input_audio_format"],
        "pcm_48000"
    );
    agent.disconnect().await;
}

#[tokio::test]
async fn test_ping_answered_with_same_event_id() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let mut server = connected(&agent, &listener).await;

    server
        .send(Message::Text(
            json!({ "type": "ping", "ping_event": { "event_id": 5, "ping_ms": 30 } })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let pong = next_json(&mut server).await;
    assert_eq!(pong, json!({ "type": "pong", "event_id": 5 }));
    agent.disconnect().await;
}

#[tokio::test]
async fn test_pong_waits_for_requested_delay() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let mut server = connected(&agent, &listener).await;

    let sent_at = std::time::Instant::now();
    server
        .send(Message::Text(
            json!({ "type": "ping", "ping_event": { "event_id": 9, "ping_ms": 300 } })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    // nothing before the delay
    assert!(tokio::time::timeout(Duration::from_millis(200), server.next())
        .await
        .is_err());

    let pong = next_json(&mut server).await;
    assert!(sent_at.elapsed() >= Duration::from_millis(300));
    assert_eq!(pong, json!({ "type": "pong", "event_id": 9 }));
    agent.disconnect().await;
}

#[tokio::test]
async fn test_metadata_rate_applies_to_binary_audio() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let mut server = connected(&agent, &listener).await;
    assert_eq!(agent.output_sample_rate(), 16000);

    server
        .send(Message::Text(
            json!({
                "type": "conversation_initiation_metadata",
                "conversation_initiation_metadata_event": { "agent_output_audio_format": "pcm_22050" }
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    server.send(Message::Binary(vec![1u8, 2, 3, 4].into())).await.unwrap();
    server
        .send(Message::Text(
            json!({ "type": "audio", "audio_event": { "audio_base_64": "BQYHCA==" } })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let started = next_event(&mut events, |e| matches!(e, AgentEvent::ConversationStarted { .. })).await;
    assert_eq!(started, AgentEvent::ConversationStarted { output_sample_rate: 22050 });

    let first = next_event(&mut events, |e| matches!(e, AgentEvent::Audio { .. })).await;
    assert_eq!(first, AgentEvent::Audio { pcm: vec![1, 2, 3, 4], sample_rate: 22050 });
    let second = next_event(&mut events, |e| matches!(e, AgentEvent::Audio { .. })).await;
    assert_eq!(second, AgentEvent::Audio { pcm: vec![5, 6, 7, 8], sample_rate: 22050 });
    assert_eq!(agent.output_sample_rate(), 22050);

    agent.disconnect().await;
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let mut server = connected(&agent, &listener).await;

    for message in [
        json!({ "type": "user_transcript", "user_transcription_event": { "user_transcript": "hello" } }),
        json!({ "type": "internal_tentative_agent_response" }),
        json!({ "type": "agent_response", "agent_response_event": { "agent_response": "Hi there" } }),
        json!({ "type": "interruption" }),
        json!({ "type": "agent_response_end" }),
    ] {
        server.send(Message::Text(message.to_string().into())).await.unwrap();
    }
    server.send(Message::Text("{not json".to_string().into())).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let event = next_event(&mut events, |e| {
            !matches!(e, AgentEvent::Connected)
        })
        .await;
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            AgentEvent::UserTranscript("hello".into()),
            AgentEvent::AgentResponse("Hi there".into()),
            AgentEvent::Interruption,
            AgentEvent::AgentResponseEnd,
        ]
    );
    assert_eq!(agent.state().last_transcript.as_deref(), Some("hello"));
    assert!(!agent.state().is_speaking);
    agent.disconnect().await;
}

#[tokio::test]
async fn test_user_audio_is_base64_wrapped() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    assert!(!agent.send_user_audio(&[1, 2, 3]));

    let mut server = connected(&agent, &listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;

    assert!(agent.send_user_audio(&[1, 2, 3]));
    assert_eq!(next_json(&mut server).await, json!({ "user_audio_chunk": "AQID" }));
    agent.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_after_abnormal_close() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let server = connected(&agent, &listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;
    // dropped without a close frame
    drop(server);

    let reconnecting = next_event(&mut events, |e| matches!(e, AgentEvent::Reconnecting { .. })).await;
    assert_eq!(
        reconnecting,
        AgentEvent::Reconnecting { attempt: 1, delay: Duration::from_millis(20) }
    );

    let _server = accept(&listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;
    assert!(agent.is_connected());
    assert_eq!(agent.state().reconnect_attempts, 0);
    agent.disconnect().await;
}

#[tokio::test]
async fn test_gives_up_after_three_failed_reconnects() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let server = connected(&agent, &listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;
    drop(listener);
    drop(server);

    let mut attempts = Vec::new();
    let fatal = loop {
        match next_event(&mut events, |e| {
            matches!(e, AgentEvent::Reconnecting { .. } | AgentEvent::Error { .. })
        })
        .await
        {
            AgentEvent::Reconnecting { attempt, .. } => attempts.push(attempt),
            AgentEvent::Error { error, fatal } => break (error, fatal),
            _ => unreachable!(),
        }
    };

    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(fatal, (AgentError::ReconnectExhausted(3), true));
    assert_eq!(agent.last_error(), Some(AgentError::ReconnectExhausted(3)));

    // no fourth attempt
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert!(!agent.is_connected());
}

#[tokio::test]
async fn test_disconnect_closes_normally_without_retry() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let mut server = connected(&agent, &listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;

    agent.disconnect().await;

    let close = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match server.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(close.map(|f| u16::from(f.code)), Some(1000));

    let disconnected = next_event(&mut events, |e| matches!(e, AgentEvent::Disconnected { .. })).await;
    assert!(matches!(disconnected, AgentEvent::Disconnected { code: 1000, .. }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    assert!(!agent.is_connected());
}

#[tokio::test]
async fn test_other_close_codes_are_reported_not_retried() {
    let (listener, url) = listen().await;
    let agent = agent(&url);
    let (mut events, _sub) = collect(&agent);
    let mut server = connected(&agent, &listener).await;
    next_event(&mut events, |e| *e == AgentEvent::Connected).await;

    server
        .close(Some(CloseFrame {
            code: CloseCode::from(4001),
            reason: Utf8Bytes::from_static("policy"),
        }))
        .await
        .unwrap();

    let error = next_event(&mut events, |e| matches!(e, AgentEvent::Error { .. })).await;
    assert_eq!(
        error,
        AgentEvent::Error {
            error: AgentError::Closed { code: 4001, reason: "policy".into() },
            fatal: false,
        }
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_first_connect_failure_is_returned() {
    let (listener, url) = listen().await;
    drop(listener);
    let agent = agent(&url);

    assert!(matches!(agent.connect().await, Err(AgentError::Connect(_))));
    assert!(!agent.state().is_connecting);
}
