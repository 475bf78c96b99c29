// Integration tests for the connect handshake over a real WebSocket.
//
// A scripted in-process platform (tests/support) accepts real
// tokio-tungstenite connections, so these exercise the production transport
// rather than the in-crate fake.

mod support;

use std::time::Duration;

use tether::{ConnectorError, SessionClient, SessionSettings, SessionState, StageStatus};

use support::{MockPlatform, PlatformScript};

fn make_client(url: &str, source: &str) -> SessionClient {
    SessionClient::new(SessionSettings::new(url, "token-1", source))
}

/// The full handshake walks to SourceConnected and sends the right frames in
/// the right order.
#[tokio::test]
async fn full_handshake_reaches_source_connected() {
    let platform = MockPlatform::start(PlatformScript::accept_all()).await;
    let client = make_client(&platform.url(), "sensor-a");

    client.connect(Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.state(), SessionState::SourceConnected);

    let frames = platform.received();
    assert_eq!(frames[0]["op"], "authenticate");
    assert_eq!(frames[0]["token"], "token-1");
    assert_eq!(frames[1]["op"], "bindSource");
    assert_eq!(frames[1]["sourceName"], "sensor-a");

    assert_eq!(client.socket_open_stage().current(), StageStatus::Succeeded);
    assert_eq!(client.auth_stage().current(), StageStatus::Succeeded);
    assert_eq!(client.bind_stage().current(), StageStatus::Succeeded);

    client.close("test done").await;
}

/// An auth rejection comes back as an error naming the reason, with the auth
/// stage marked failed and the session back in Disconnected.
#[tokio::test]
async fn auth_rejection_is_diagnosable_per_stage() {
    let script = PlatformScript {
        accept_auth: false,
        ..PlatformScript::default()
    };
    let platform = MockPlatform::start(script).await;
    let client = make_client(&platform.url(), "sensor-a");

    let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, ConnectorError::AuthRejected(_)));
    assert_eq!(client.state(), SessionState::Disconnected);

    assert_eq!(client.socket_open_stage().current(), StageStatus::Succeeded);
    match client.auth_stage().current() {
        StageStatus::Failed(reason) => {
            assert!(reason.contains("token refused"), "got: {reason}")
        }
        other => panic!("expected failed auth stage, got {other:?}"),
    }
    // The bind stage was never attempted.
    assert_eq!(client.bind_stage().current(), StageStatus::Pending);
}

/// A bind rejection fails after a successful authentication.
#[tokio::test]
async fn bind_rejection_fails_the_last_stage() {
    let script = PlatformScript {
        accept_bind: false,
        ..PlatformScript::default()
    };
    let platform = MockPlatform::start(script).await;
    let client = make_client(&platform.url(), "sensor-b");

    let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, ConnectorError::BindRejected(_)));
    assert_eq!(client.auth_stage().current(), StageStatus::Succeeded);
    assert!(matches!(
        client.bind_stage().current(),
        StageStatus::Failed(_)
    ));

    let ops = platform.received_ops();
    assert_eq!(ops, vec!["authenticate", "bindSource"]);
}

/// A platform that never answers trips the connect deadline, and the error
/// names the stage that was waiting.
#[tokio::test]
async fn silent_platform_times_out_at_the_auth_stage() {
    let script = PlatformScript {
        mute: true,
        ..PlatformScript::default()
    };
    let platform = MockPlatform::start(script).await;
    let client = make_client(&platform.url(), "sensor-a");

    let err = client.connect(Duration::from_millis(300)).await.unwrap_err();
    match err {
        ConnectorError::HandshakeTimeout { stage, .. } => {
            assert_eq!(stage.to_string(), "authenticate");
        }
        other => panic!("expected a handshake timeout, got {other}"),
    }
    assert_eq!(client.state(), SessionState::Disconnected);
}

/// Nothing is listening: the dial itself fails and the socket stage carries
/// the failure.
#[tokio::test]
async fn refused_dial_fails_the_socket_stage() {
    // Bind and immediately drop a listener to get a dead port.
    let dead = MockPlatform::start(PlatformScript::accept_all()).await;
    let url = dead.url();
    dead.shut_down();
    drop(dead);

    let client = make_client(&url, "sensor-a");
    let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, ConnectorError::ConnectionFailed(_)));
    assert!(matches!(
        client.socket_open_stage().current(),
        StageStatus::Failed(_)
    ));
}
