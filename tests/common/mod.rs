#![allow(dead_code)]

use async_trait::async_trait;
use captains_log::*;
use rstest::fixture;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_rpc::callback::CallbackSink;
use tether_rpc::error::CallbackError;
use tether_rpc::{
    Callback, ConnectionListener, InvocationHandler, InvocationRequest, InvokeError, Locator,
    ServerConfig, ServerInvoker, SessionInfo,
};
use tokio::runtime::Runtime;

pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/tether_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()>>(&self, f: F) {
        self.rt.block_on(f);
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

/// Echoes the payload back; `trigger-error` fails the invocation. Keeps
/// every callback sink it is handed so tests can emit callbacks on demand.
pub struct EchoHandler {
    sinks: Mutex<Vec<CallbackSink>>,
}

impl EchoHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sinks: Mutex::new(Vec::new()) })
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    /// Deliver one callback through every attached sink
    pub fn emit(&self, payload: &[u8]) -> Vec<Result<u64, CallbackError>> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.deliver(Callback::new(payload.to_vec())))
            .collect()
    }

    pub fn emit_with_handback(&self, payload: &[u8], handback: &str) {
        for s in self.sinks.lock().unwrap().iter() {
            s.deliver(Callback::new(payload.to_vec()).with_handback(handback)).expect("deliver");
        }
    }
}

#[async_trait]
impl InvocationHandler for EchoHandler {
    async fn invoke(&self, req: InvocationRequest) -> Result<Vec<u8>, String> {
        if req.payload == b"trigger-error" {
            return Err("simulated handler failure".to_string());
        }
        Ok(req.payload)
    }

    fn add_listener(&self, sink: CallbackSink) {
        self.sinks.lock().unwrap().push(sink);
    }

    fn remove_listener(&self, handler_id: u64) {
        self.sinks.lock().unwrap().retain(|s| s.handler_id() != handler_id);
    }
}

/// Counts connection failure notifications per session
pub struct FailureCounter {
    count: AtomicUsize,
    last_session: Mutex<Option<u64>>,
}

impl FailureCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { count: AtomicUsize::new(0), last_session: Mutex::new(None) })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn last_session(&self) -> Option<u64> {
        *self.last_session.lock().unwrap()
    }
}

impl ConnectionListener for FailureCounter {
    fn connection_failed(&self, _err: &InvokeError, session: &SessionInfo) {
        self.count.fetch_add(1, Ordering::AcqRel);
        *self.last_session.lock().unwrap() = Some(session.session);
    }
}

/// Bind an echo server on an ephemeral port; returns the locator clients
/// should dial.
pub async fn start_echo_server(
    config: ServerConfig,
) -> (Arc<ServerInvoker>, Arc<EchoHandler>, Locator) {
    let locator = Locator::from_str("tcp://127.0.0.1:0").expect("locator");
    let server = ServerInvoker::new(locator, config).expect("server");
    let handler = EchoHandler::new();
    server.add_invocation_handler("echo", handler.clone());
    server.start().await.expect("start");
    let port = server.bound_port().expect("bound port");
    let client_locator =
        Locator::from_str(&format!("tcp://127.0.0.1:{}", port)).expect("client locator");
    (server, handler, client_locator)
}
