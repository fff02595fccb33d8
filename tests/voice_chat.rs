mod common;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use avatar_relay::session::{SessionConfig, SessionController, SessionError};
use avatar_relay::voice_chat::{
    VoiceChatConfig, VoiceChatError, VoiceChatEvent, VoiceChatMode, VoiceChatState,
};
use common::{wait_until, ScriptedApi, ScriptedRoom};

async fn started(room: &Arc<ScriptedRoom>, voice_chat: VoiceChatConfig) -> SessionController {
    let session = SessionController::new(
        room.clone(),
        Arc::new(ScriptedApi::default()),
        SessionConfig {
            voice_chat: Some(voice_chat),
        },
    );
    session.start().await.unwrap();
    session
}

fn push_to_talk() -> VoiceChatConfig {
    VoiceChatConfig {
        mode: VoiceChatMode::PushToTalk,
        ..VoiceChatConfig::default()
    }
}

#[tokio::test]
async fn test_start_publishes_microphone() {
    let room = ScriptedRoom::new();
    let session = started(&room, VoiceChatConfig::default()).await;

    assert_eq!(session.voice_chat().state(), VoiceChatState::Active);
    assert_eq!(session.voice_chat().mode(), VoiceChatMode::Default);
    assert!(!session.voice_chat().is_muted());
    assert_eq!(room.published.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_default_muted_and_mute_events() {
    let room = ScriptedRoom::new();
    let session = started(
        &room,
        VoiceChatConfig {
            default_muted: true,
            ..VoiceChatConfig::default()
        },
    )
    .await;
    let voice_chat = session.voice_chat();
    assert!(voice_chat.is_muted());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = voice_chat.events().subscribe(move |e| s.lock().push(*e));

    voice_chat.unmute();
    voice_chat.unmute();
    voice_chat.mute();
    assert_eq!(*seen.lock(), vec![VoiceChatEvent::Unmuted, VoiceChatEvent::Muted]);
}

#[tokio::test]
async fn test_failed_publish_fails_session_start() {
    let room = ScriptedRoom::new();
    room.fail_publish.store(true, Ordering::SeqCst);
    let session = SessionController::new(
        room.clone(),
        Arc::new(ScriptedApi::default()),
        SessionConfig {
            voice_chat: Some(VoiceChatConfig::default()),
        },
    );

    let result = session.start().await;
    assert!(matches!(
        result,
        Err(SessionError::VoiceChat(VoiceChatError::Publish(_)))
    ));
    assert_eq!(session.voice_chat().state(), VoiceChatState::Inactive);
    assert_eq!(room.events.handler_count(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_unpublishes() {
    let room = ScriptedRoom::new();
    let session = started(&room, VoiceChatConfig::default()).await;

    session.voice_chat().stop();
    session.voice_chat().stop();
    assert_eq!(session.voice_chat().state(), VoiceChatState::Inactive);
    wait_until(|| room.unpublished.lock().len() == 1).await;
    assert_eq!(room.unpublished.lock()[0], "TR_0");

    // mute on an inactive voice chat is a logged no-op
    session.voice_chat().mute();
    assert!(!session.voice_chat().is_muted());
}

#[tokio::test]
async fn test_stop_during_publish_withdraws_new_track() {
    let room = ScriptedRoom::new();
    room.fail_unpublish.store(true, Ordering::SeqCst);
    let gate = room.hold_publish();
    let session = SessionController::new(
        room.clone(),
        Arc::new(ScriptedApi::default()),
        SessionConfig { voice_chat: None },
    );
    session.start().await.unwrap();

    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start(VoiceChatConfig::default()).await })
    };
    wait_until(|| room.published.load(Ordering::SeqCst) == 1).await;
    assert_eq!(session.voice_chat().state(), VoiceChatState::Starting);

    session.voice_chat().stop();
    gate.notify_one();

    // the failed unpublish is only logged
    assert!(matches!(starting.await.unwrap(), Err(VoiceChatError::Cancelled)));
    assert_eq!(*room.unpublished.lock(), vec!["TR_0".to_string()]);
    assert_eq!(session.voice_chat().state(), VoiceChatState::Inactive);
}

#[tokio::test]
async fn test_push_to_talk_resolves_on_success_event() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start_push_to_talk().await })
    };
    wait_until(|| room.commands().contains(&"user.start_push_to_talk".to_string())).await;

    room.server_event(json!({ "event_type": "user.push_to_talk_started" }));
    waiting.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_push_to_talk_ignores_unrelated_then_rejects_on_failure() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().stop_push_to_talk().await })
    };
    wait_until(|| room.commands().contains(&"user.stop_push_to_talk".to_string())).await;

    room.server_event(json!({ "event_type": "avatar.speak_started" }));
    room.server_event(json!({ "event_type": "user.push_to_talk_started" }));
    tokio::task::yield_now().await;
    assert!(!waiting.is_finished());

    room.server_event(json!({
        "event_type": "user.push_to_talk_stop_failed",
        "message": "not talking"
    }));
    match waiting.await.unwrap() {
        Err(VoiceChatError::Rejected(message)) => assert_eq!(message, "not talking"),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_push_to_talk_cancelled_by_stop() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start_push_to_talk().await })
    };
    wait_until(|| room.commands().contains(&"user.start_push_to_talk".to_string())).await;

    session.voice_chat().stop();
    assert!(matches!(waiting.await.unwrap(), Err(VoiceChatError::Cancelled)));

    // a late confirmation has nobody to resolve
    room.server_event(json!({ "event_type": "user.push_to_talk_started" }));
}

#[tokio::test]
async fn test_quick_press_and_release_both_confirmed() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let press = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start_push_to_talk().await })
    };
    wait_until(|| room.commands().contains(&"user.start_push_to_talk".to_string())).await;

    // released before the press is confirmed
    let release = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().stop_push_to_talk().await })
    };
    wait_until(|| room.commands().contains(&"user.stop_push_to_talk".to_string())).await;

    room.server_event(json!({ "event_type": "user.push_to_talk_started" }));
    room.server_event(json!({ "event_type": "user.push_to_talk_stopped" }));

    assert!(matches!(press.await.unwrap(), Ok(())));
    assert!(matches!(release.await.unwrap(), Ok(())));
}

#[tokio::test]
async fn test_stop_cancels_every_pending_wait() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let press = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start_push_to_talk().await })
    };
    let release = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().stop_push_to_talk().await })
    };
    wait_until(|| {
        let commands = room.commands();
        commands.contains(&"user.start_push_to_talk".to_string())
            && commands.contains(&"user.stop_push_to_talk".to_string())
    })
    .await;

    session.voice_chat().stop();
    assert!(matches!(press.await.unwrap(), Err(VoiceChatError::Cancelled)));
    assert!(matches!(release.await.unwrap(), Err(VoiceChatError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_push_to_talk_times_out() {
    let room = ScriptedRoom::new();
    let session = started(&room, push_to_talk()).await;

    let result = session.voice_chat().start_push_to_talk().await;
    assert!(matches!(result, Err(VoiceChatError::Timeout)));

    // the waiter is gone: a second request works normally
    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.voice_chat().start_push_to_talk().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    room.server_event(json!({ "event_type": "user.push_to_talk_started" }));
    waiting.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_push_to_talk_needs_mode_and_active_chat() {
    let room = ScriptedRoom::new();
    let session = started(&room, VoiceChatConfig::default()).await;
    assert!(matches!(
        session.voice_chat().start_push_to_talk().await,
        Err(VoiceChatError::NotPushToTalkMode)
    ));

    session.voice_chat().stop();
    assert!(matches!(
        session.voice_chat().stop_push_to_talk().await,
        Err(VoiceChatError::NotActive)
    ));
    assert!(!room.commands().iter().any(|c| c.contains("push_to_talk")));
}

#[tokio::test]
async fn test_session_stop_stops_voice_chat() {
    let room = ScriptedRoom::new();
    let session = started(&room, VoiceChatConfig::default()).await;
    session.stop().await.unwrap();
    assert_eq!(session.voice_chat().state(), VoiceChatState::Inactive);
}
