use super::pool::ConnPool;
use crate::codec::MsgpCodec;
use crate::config::TimeoutSetting;
use crate::error::{Fault, InvokeError};
use crate::handler::{ConnectionListener, SessionInfo};
use crate::proto::{read_frame, write_frame, Frame, FrameKind};
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use log::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Client half of the keep-alive protocol.
///
/// Fires a renewal ping at a third of the lease period so that transient
/// loss of one or two pings does not expire the lease. Detecting a dead
/// server notifies the invoker's connection listeners exactly once, then
/// the pinger exits; it never resurrects the lease on its own.
pub(crate) struct LeasePinger {
    abort: AbortHandle,
    terminated: Arc<AtomicBool>,
}

impl LeasePinger {
    pub fn start(
        pool: Arc<ConnPool>, session: u64, period: Duration, seq: Arc<AtomicU64>,
        timeout: TimeoutSetting,
        listeners: Arc<Mutex<Vec<Arc<dyn ConnectionListener>>>>, peer: String,
    ) -> Self {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        let (abort, reg) = AbortHandle::new_pair();
        let interval = period / 3;
        let task = Abortable::new(
            async move {
                let codec = MsgpCodec::default();
                debug!("lease pinger for session {} every {:?}", session, interval);
                loop {
                    sleep(interval).await;
                    if flag.load(Ordering::Acquire) {
                        return;
                    }
                    match Self::ping_once(&pool, &codec, session, period, &seq, &timeout).await {
                        Ok(_) => {
                            trace!("lease renewed for session {}", session);
                        }
                        Err(e) => {
                            warn!("lease ping failed for session {}: {}", session, e);
                            let info = SessionInfo { session, peer: peer.clone() };
                            let err = InvokeError::Fault(e);
                            for l in listeners.lock().unwrap().iter() {
                                l.connection_failed(&err, &info);
                            }
                            return;
                        }
                    }
                }
            },
            reg,
        )
        .map(|_| ());
        tokio::spawn(task);
        Self { abort, terminated }
    }

    async fn ping_once(
        pool: &ConnPool, codec: &MsgpCodec, session: u64, period: Duration,
        seq: &AtomicU64, timeout: &TimeoutSetting,
    ) -> Result<(), Fault> {
        let mut conn = pool.acquire().await?;
        let ping = Frame::ping(seq.fetch_add(1, Ordering::AcqRel), session, Some(period));
        write_frame(&mut conn.stream, codec, &ping, timeout.write_timeout, true).await?;
        let resp =
            read_frame(&mut conn.stream, codec, timeout.read_timeout, timeout.read_timeout)
                .await?;
        if resp.kind != FrameKind::Pong || resp.seq != ping.seq {
            return Err(Fault::Internal);
        }
        pool.release(conn);
        Ok(())
    }

    /// Stop pinging without any notification; idempotent
    pub fn stop(&self) {
        self.terminated.store(true, Ordering::Release);
        self.abort.abort();
    }
}

impl Drop for LeasePinger {
    fn drop(&mut self) {
        self.stop();
    }
}
