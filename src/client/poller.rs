use super::ClientInvoker;
use crate::callback::ClientCallbackHandler;
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use log::*;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;

/// POLL-mode driver: periodically drains pending callbacks from the server
/// and dispatches each to the locally registered handler. Holding only a
/// Weak invoker reference lets the invoker drop (and the poller die) without
/// an unregister round trip.
pub(crate) struct CallbackPoller {
    abort: AbortHandle,
}

impl CallbackPoller {
    pub fn start(
        invoker: Weak<ClientInvoker>, handler_id: u64,
        handler: Arc<dyn ClientCallbackHandler>, poll_period: Duration, ack_required: bool,
    ) -> Self {
        let (abort, reg) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                debug!("callback poller {} every {:?}", handler_id, poll_period);
                loop {
                    sleep(poll_period).await;
                    let Some(invoker) = invoker.upgrade() else {
                        return;
                    };
                    let envelopes = match invoker.get_callbacks(handler_id).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("poller {} drain failed: {}", handler_id, e);
                            continue;
                        }
                    };
                    for envelope in envelopes {
                        let callback_id = envelope.id;
                        let result = handler.handle_callback(envelope);
                        if ack_required {
                            let response = match result {
                                Ok(v) => v,
                                Err(text) => text.into_bytes(),
                            };
                            if let Err(e) =
                                invoker.acknowledge(handler_id, callback_id, response).await
                            {
                                warn!("poller {} ack of cb {} failed: {}", handler_id, callback_id, e);
                            }
                        }
                    }
                }
            },
            reg,
        )
        .map(|_| ());
        tokio::spawn(task);
        Self { abort }
    }

    pub fn stop(&self) {
        self.abort.abort();
    }
}

impl Drop for CallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
