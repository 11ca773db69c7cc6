//! Periodic full-state polling.
//!
//! Every tick opens a fresh session and sends it a terminal-tagged
//! AskAllUpdates. Ticks never wait for the previous poll's session to close,
//! so several polling sessions may be outstanding at once.

use crate::broker::Broker;
use crate::session::{Envelope, ReplyChannel};
use broker_core::{Request, SessionId};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle to a running polling task. The task stops when this is dropped.
pub struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    /// Start polling `broker` every `period`, with replies going to `reply_to`.
    ///
    /// The first poll fires immediately. Polling stops on its own once the
    /// receiver behind `reply_to` is dropped.
    pub fn spawn(broker: Broker, period: Duration, reply_to: ReplyChannel) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Polling every {:?}", period);

            loop {
                ticker.tick().await;
                if reply_to.is_closed() {
                    debug!("Poll reply channel closed, stopping poller");
                    break;
                }
                poll_once(&broker, &reply_to).await;
            }
        });

        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Issue one AskAllUpdates through a fresh self-terminating session.
///
/// Returns the session used, or `None` if no session could be opened or it
/// refused the request.
pub async fn poll_once(broker: &Broker, reply_to: &ReplyChannel) -> Option<SessionId> {
    let session = match broker.open_session() {
        Ok(session) => session,
        Err(e) => {
            warn!("Skipping poll: {}", e);
            return None;
        }
    };

    let id = session.id();
    let envelope = Envelope::new(Request::AskAllUpdates)
        .reply_to(reply_to.clone())
        .terminal(id);

    if session.send(envelope).await {
        debug!("Poll issued on session {}", id);
        Some(id)
    } else {
        // Never reached the worker, so nobody else will reclaim it
        broker.close_session(id);
        None
    }
}
