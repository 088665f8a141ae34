use super::*;

struct PrefixVerifier;

#[async_trait]
impl IdentityVerifier for PrefixVerifier {
    async fn verify(&self, credential: &str) -> Result<UserId, CoreError> {
        credential
            .strip_prefix("token-")
            .map(UserId::from)
            .ok_or_else(|| CoreError::Authentication("bad credential".to_string()))
    }
}

fn registry() -> ChannelRegistry {
    ChannelRegistry::new(Box::new(PrefixVerifier))
}

fn message_event() -> ServerEvent {
    ServerEvent::MessagesRead {
        thread_id: shared::domain::ThreadId::from("u1_u2"),
        read_by: UserId::from("u2"),
        read_at: Utc::now(),
        count: 1,
    }
}

#[tokio::test]
async fn bind_refuses_bad_credentials() {
    let registry = registry();
    let err = registry.bind("garbage").await.expect_err("must refuse");
    assert!(matches!(err, CoreError::Authentication(_)));
    assert!(!registry.is_online(&UserId::from("garbage")).await);
}

#[tokio::test]
async fn send_to_unbound_identity_is_a_silent_noop() {
    let registry = registry();
    let delivered = registry.send(&UserId::from("u1"), message_event()).await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn send_reaches_every_bound_channel() {
    let registry = registry();
    let mut first = registry.bind("token-u1").await.expect("bind");
    let mut second = registry.bind("token-u1").await.expect("bind");
    assert_eq!(registry.bound_channel_count(&UserId::from("u1")).await, 2);

    let delivered = registry.send(&UserId::from("u1"), message_event()).await;
    assert_eq!(delivered, 2);
    assert!(first.events.try_recv().is_ok());
    assert!(second.events.try_recv().is_ok());
}

#[tokio::test]
async fn send_except_skips_the_originating_channel() {
    let registry = registry();
    let mut origin = registry.bind("token-u1").await.expect("bind");
    let mut other = registry.bind("token-u1").await.expect("bind");

    let delivered = registry
        .send_except(&UserId::from("u1"), origin.handle, message_event())
        .await;
    assert_eq!(delivered, 1);
    assert!(other.events.try_recv().is_ok());
    assert!(origin.events.try_recv().is_err());
}

#[tokio::test]
async fn unbind_is_idempotent_and_stops_delivery() {
    let registry = registry();
    let bound = registry.bind("token-u1").await.expect("bind");

    registry.unbind(bound.handle).await;
    registry.unbind(bound.handle).await;

    assert!(!registry.is_online(&UserId::from("u1")).await);
    let delivered = registry.send(&UserId::from("u1"), message_event()).await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn presence_is_broadcast_to_other_identities_only() {
    let registry = registry();
    let mut observer = registry.bind("token-u1").await.expect("bind");

    let joined = registry.bind("token-u2").await.expect("bind");
    let event = observer.events.try_recv().expect("online event");
    match event {
        ServerEvent::UserOnline { user_id, .. } => assert_eq!(user_id, UserId::from("u2")),
        other => panic!("expected user_online, got {other:?}"),
    }

    registry.unbind(joined.handle).await;
    let event = observer.events.try_recv().expect("offline event");
    assert!(matches!(event, ServerEvent::UserOffline { user_id, .. } if user_id == UserId::from("u2")));
}

#[tokio::test]
async fn second_session_does_not_rebroadcast_online() {
    let registry = registry();
    let mut observer = registry.bind("token-u1").await.expect("bind");

    let first = registry.bind("token-u2").await.expect("bind");
    let _ = observer.events.try_recv().expect("online event");

    let _second = registry.bind("token-u2").await.expect("bind");
    assert!(
        observer.events.try_recv().is_err(),
        "second binding must not re-announce presence"
    );

    registry.unbind(first.handle).await;
    assert!(
        observer.events.try_recv().is_err(),
        "identity still online through its second channel"
    );
}
