mod common;

use common::*;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;
use tether_rpc::{
    CallbackEnvelope, CallbackOptions, ClientCallbackHandler, ClientConfig, ClientInvoker,
    DeliveryMode, Metadata, ServerConfig,
};
use tokio::time::sleep;

fn leased_config(period_ms: u64) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.lease_period = Some(Duration::from_millis(period_ms));
    config
}

#[rstest]
fn test_lease_expiry_notifies_exactly_once(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let failures = FailureCounter::new();
        server.add_connection_listener(failures.clone());

        let client = ClientInvoker::new(locator, leased_config(150)).expect("client");
        client.connect().await.expect("connect");
        let session = client.session();

        // the pinger keeps the lease alive well past the period
        sleep(Duration::from_millis(500)).await;
        assert_eq!(failures.count(), 0);

        // a client that silently stops renewing gets swept
        client.stop_lease_pinger();
        sleep(Duration::from_millis(900)).await;
        assert_eq!(failures.count(), 1);
        assert_eq!(failures.last_session(), Some(session));

        // no repeat notification for the same session
        sleep(Duration::from_millis(400)).await;
        assert_eq!(failures.count(), 1);

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_invocations_renew_implicitly(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let failures = FailureCounter::new();
        server.add_connection_listener(failures.clone());

        let client = ClientInvoker::new(locator, leased_config(200)).expect("client");
        client.connect().await.expect("connect");
        client.stop_lease_pinger();

        // steady request traffic substitutes for renewal pings
        for _ in 0..10 {
            sleep(Duration::from_millis(100)).await;
            client.invoke("echo", b"tick".to_vec(), Metadata::new()).await.expect("invoke");
        }
        assert_eq!(failures.count(), 0);

        // traffic stops, the lease dies
        sleep(Duration::from_millis(900)).await;
        assert_eq!(failures.count(), 1);

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_lease_expiry_closes_push_registration(runner: TestRunner) {
    runner.block_on(async {
        let (server, handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, leased_config(150)).expect("client");
        client.connect().await.expect("connect");

        let noop: Arc<dyn ClientCallbackHandler> =
            Arc::new(|_env: CallbackEnvelope| -> Result<Vec<u8>, String> { Ok(Vec::new()) });
        client
            .register_callbacks(Some("echo"), CallbackOptions::new(DeliveryMode::Push), noop)
            .await
            .expect("register");
        assert_eq!(handler.sink_count(), 1);

        // the expiring session takes its push registration down with it
        client.stop_lease_pinger();
        sleep(Duration::from_millis(900)).await;
        assert_eq!(handler.sink_count(), 0);

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_clean_disconnect_stays_quiet(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let failures = FailureCounter::new();
        server.add_connection_listener(failures.clone());

        let client = ClientInvoker::new(locator, leased_config(150)).expect("client");
        client.connect().await.expect("connect");
        client.disconnect().await;

        // the explicit Disconnect terminated the lease before it could expire
        sleep(Duration::from_millis(800)).await;
        assert_eq!(failures.count(), 0);

        server.stop().await;
    });
}

#[rstest]
fn test_client_detects_dead_server(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let failures = FailureCounter::new();

        let client = ClientInvoker::new(locator, leased_config(300)).expect("client");
        client.add_connection_listener(failures.clone());
        client.connect().await.expect("connect");

        server.stop().await;
        // the next renewal ping fails and fires the client-side listener
        sleep(Duration::from_millis(1200)).await;
        assert_eq!(failures.count(), 1);

        client.disconnect().await;
    });
}
