//! # tether-rpc
//!
//! A transport-agnostic remote invocation runtime: clients invoke named
//! subsystems on a server through pooled point-to-point connections, keep
//! their sessions alive with a lease protocol, and receive server-originated
//! callbacks by pulling, polling or server push. The bisocket transport lets
//! clients behind one-way networks receive pushes over connections they
//! dialed themselves.
//!
//! Endpoints are described by [Locator] URIs such as
//! `tcp://host:7800/?lease-period=2000`; the parameter bag participates in
//! configuration resolution together with per-invoker config and per-call
//! metadata.

pub mod bisocket;
pub mod callback;
pub mod client;
mod codec;
pub mod config;
pub mod error;
mod handler;
pub mod locator;
pub mod net;
pub mod proto;
mod registry;
pub mod server;

pub use callback::{
    Callback, CallbackEnvelope, CallbackListener, CallbackOptions, CallbackSink,
    ClientCallbackHandler, DeliveryMode,
};
pub use client::ClientInvoker;
pub use codec::{Codec, MsgpCodec};
pub use config::{ClientConfig, Metadata, OverridePolicy, ParamKey, ServerConfig, TimeoutSetting};
pub use error::{CallbackError, Fault, InvokeError};
pub use handler::{ConnectionListener, InvocationHandler, InvocationRequest, SessionInfo};
pub use locator::Locator;
pub use registry::InvokerRegistry;
pub use server::ServerInvoker;
