use super::*;

#[test]
fn websocket_url_maps_http_schemes_and_carries_the_token() {
    let url = websocket_url("http://127.0.0.1:8443", "abc123").expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws?token=abc123");

    let url = websocket_url("https://chat.example.com", "abc123").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.com/ws?token=abc123");
}

#[test]
fn websocket_url_refuses_unknown_schemes() {
    assert!(websocket_url("ftp://example.com", "abc").is_err());
    assert!(websocket_url("not a url", "abc").is_err());
}

#[tokio::test]
async fn missing_signaling_outbound_refuses_frames() {
    let outbound = MissingSignalingOutbound;
    let refused = outbound
        .relay(ClientFrame::CallEnded {
            to: UserId::from("bob"),
            end: shared::protocol::CallEndPayload {
                call_id: shared::domain::CallId::fresh(),
                reason: shared::protocol::CallEndReason::Hangup,
            },
        })
        .await;
    assert!(refused.is_err());
}
