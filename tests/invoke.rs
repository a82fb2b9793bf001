mod common;

use common::*;
use rstest::rstest;
use std::time::Duration;
use tether_rpc::{ClientConfig, ClientInvoker, Fault, InvokeError, Metadata, ServerConfig};
use tokio::time::sleep;

#[rstest]
fn test_echo_round_trip(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, ClientConfig::default()).expect("client");
        client.connect().await.expect("connect");
        assert!(client.session() > 0);

        let resp = client.invoke("echo", b"hello".to_vec(), Metadata::new()).await.expect("invoke");
        assert_eq!(resp, b"hello");

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_handler_error_does_not_poison_connection(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, ClientConfig::default()).expect("client");
        client.connect().await.expect("connect");

        let err = client
            .invoke("echo", b"trigger-error".to_vec(), Metadata::new())
            .await
            .expect_err("handler failure");
        match err {
            InvokeError::Handler(msg) => assert!(msg.contains("simulated")),
            other => panic!("expected handler error, got {:?}", other),
        }

        // the same invoker keeps working after a handler failure
        let resp = client.invoke("echo", b"still alive".to_vec(), Metadata::new()).await.unwrap();
        assert_eq!(resp, b"still alive");

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_unknown_subsystem(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, ClientConfig::default()).expect("client");
        client.connect().await.expect("connect");

        let err = client
            .invoke("no-such-subsystem", b"x".to_vec(), Metadata::new())
            .await
            .expect_err("unknown subsystem");
        assert_eq!(err, InvokeError::Fault(Fault::Subsystem));

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_invoke_requires_connected(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, ClientConfig::default()).expect("client");

        // before connect
        let err = client.invoke("echo", b"x".to_vec(), Metadata::new()).await.unwrap_err();
        assert_eq!(err, InvokeError::Fault(Fault::Closed));

        client.connect().await.expect("connect");
        let first_session = client.session();
        client.invoke("echo", b"x".to_vec(), Metadata::new()).await.expect("invoke");

        // after disconnect
        client.disconnect().await;
        let err = client.invoke("echo", b"x".to_vec(), Metadata::new()).await.unwrap_err();
        assert_eq!(err, InvokeError::Fault(Fault::Closed));

        // reconnect gets a fresh session and works again
        client.connect().await.expect("reconnect");
        assert_ne!(client.session(), first_session);
        let resp = client.invoke("echo", b"back".to_vec(), Metadata::new()).await.unwrap();
        assert_eq!(resp, b"back");

        client.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_worker_pool_evicts_lru_connection(runner: TestRunner) {
    runner.block_on(async {
        let mut config = ServerConfig::default();
        config.max_worker_pool_size = 1;
        let (server, _handler, locator) = start_echo_server(config).await;

        let first = ClientInvoker::new(locator.clone(), ClientConfig::default()).expect("first");
        first.connect().await.expect("connect first");
        first.invoke("echo", b"warm".to_vec(), Metadata::new()).await.expect("invoke");

        // a second connection displaces the first client's worker
        let second = ClientInvoker::new(locator, ClientConfig::default()).expect("second");
        second.connect().await.expect("connect second");
        sleep(Duration::from_millis(300)).await;

        let err = first.invoke("echo", b"denied".to_vec(), Metadata::new()).await.unwrap_err();
        assert_eq!(err, InvokeError::Fault(Fault::Evicted));

        // the evicted connection was discarded; the next call redials
        let resp = first.invoke("echo", b"retry".to_vec(), Metadata::new()).await.unwrap();
        assert_eq!(resp, b"retry");

        second.disconnect().await;
        first.disconnect().await;
        server.stop().await;
    });
}

#[rstest]
fn test_server_stop_is_idempotent(runner: TestRunner) {
    runner.block_on(async {
        let (server, _handler, locator) = start_echo_server(ServerConfig::default()).await;
        let client = ClientInvoker::new(locator, ClientConfig::default()).expect("client");
        client.connect().await.expect("connect");
        client.disconnect().await;

        server.stop().await;
        server.stop().await;
    });
}
