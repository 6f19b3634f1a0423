use std::sync::Arc;

use anyhow::Result;
use supportdesk_chats::{MessageStatus, Sender, SenderKind, SessionPhase};
use supportdesk_config::AppConfig;
use supportdesk_runtime::ClientServices;
use supportdesk_transport::{ConnectionState, LoopbackTransport};

fn identity() -> Sender {
    Sender::new("agent-1", SenderKind::Agent).named("Dana")
}

fn build_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.transport.workspace_id = "acme".into();
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_services_round_trip_a_message() -> Result<()> {
    let services = ClientServices::offline(&build_config(), identity());
    services.start("any-token").await?;
    assert_eq!(services.sessions.connection_state(), ConnectionState::Connected);

    services.sessions.open_conversation("c1").await?;
    services
        .sessions
        .send_message("c1", "hello from the runtime", Vec::new())
        .await?;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        let messages = services.sessions.messages("c1");
        if messages.len() == 1 && !messages[0].local_echo {
            assert_eq!(messages[0].status, MessageStatus::Sent);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "echo never arrived");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    services.shutdown().await;
    assert_eq!(services.sessions.phase("c1"), Some(SessionPhase::Closed));
    assert_eq!(
        services.transport.state(),
        ConnectionState::Disconnected
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn start_reports_rejected_credentials() -> Result<()> {
    let loopback = LoopbackTransport::new();
    loopback.require_token("tok_valid");
    let services =
        ClientServices::with_transport(&build_config(), Arc::new(loopback), identity());

    let error = match services.start("tok_wrong").await {
        Ok(_) => panic!("expected the connection to be refused"),
        Err(error) => error,
    };
    let message = format!("{error:?}");
    assert!(
        message.contains("failed to connect to the realtime backend"),
        "expected connection context, got {message}"
    );
    assert_eq!(services.sessions.connection_state(), ConnectionState::Failed);
    Ok(())
}

#[test]
fn credentials_use_the_configured_workspace() {
    let services = ClientServices::with_transport(
        &build_config(),
        Arc::new(LoopbackTransport::new()),
        identity(),
    );
    let credentials = services.credentials("secret");
    assert_eq!(credentials.workspace_id, "acme");
    assert_eq!(credentials.token, "secret");
}
