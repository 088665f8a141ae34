use super::*;

#[test]
fn thread_id_is_symmetric() {
    let a = UserId::from("u1");
    let b = UserId::from("u2");
    let forward = ThreadId::between(&a, &b).expect("thread id");
    let backward = ThreadId::between(&b, &a).expect("thread id");
    assert_eq!(forward, backward);
    assert_eq!(forward.as_str(), "u1_u2");
}

#[test]
fn thread_id_sorts_lexicographically() {
    let id = ThreadId::between(&UserId::from("zed"), &UserId::from("amy")).expect("thread id");
    assert_eq!(id.as_str(), "amy_zed");
}

#[test]
fn thread_id_rejects_degenerate_pair() {
    let u = UserId::from("u1");
    let err = ThreadId::between(&u, &u).expect_err("must reject");
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[test]
fn terminal_states_are_terminal() {
    assert!(CallState::Ended.is_terminal());
    assert!(CallState::Failed.is_terminal());
    assert!(!CallState::Connected.is_terminal());
    assert!(!CallState::Idle.is_terminal());
}

#[test]
fn message_kind_round_trips_through_storage_text() {
    for kind in [MessageKind::Text, MessageKind::Image, MessageKind::File] {
        assert_eq!(MessageKind::parse(kind.as_str()), kind);
    }
}
