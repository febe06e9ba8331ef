use pi_proto::pi::v1::{self as pb, session_event::Payload};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::warn;

const BROADCAST_CAPACITY: usize = 256;
const SUBSCRIBER_BUFFER: usize = 64;

pub(crate) async fn stopped(mut stopping: watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stop| *stop).await;
}

#[derive(Clone, Debug)]
pub(crate) struct UserSessionEvent {
    pub(crate) user_id: i32,
    pub(crate) event: pb::SessionEvent,
}

/// Fan-out of install-session and op-mode events to every watcher.
#[derive(Clone)]
pub(crate) struct EventHub {
    sessions: broadcast::Sender<UserSessionEvent>,
    ops: broadcast::Sender<pb::OpChanged>,
    stopping: watch::Receiver<bool>,
}

impl EventHub {
    pub(crate) fn new(stopping: watch::Receiver<bool>) -> Self {
        let (sessions, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (ops, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sessions,
            ops,
            stopping,
        }
    }

    pub(crate) fn publish_session(&self, user_id: i32, payload: Payload) {
        let _ = self.sessions.send(UserSessionEvent {
            user_id,
            event: pb::SessionEvent {
                payload: Some(payload),
            },
        });
    }

    pub(crate) fn publish_op(&self, event: pb::OpChanged) {
        let _ = self.ops.send(event);
    }

    pub(crate) fn watch_sessions(
        &self,
        user_id: i32,
    ) -> ReceiverStream<Result<pb::SessionEvent, Status>> {
        self.forward(self.sessions.subscribe(), move |item: UserSessionEvent| {
            (item.user_id == user_id).then_some(item.event)
        })
    }

    /// Empty `package_name` matches every package.
    pub(crate) fn watch_op_mode(
        &self,
        op: i32,
        package_name: String,
    ) -> ReceiverStream<Result<pb::OpChanged, Status>> {
        self.forward(self.ops.subscribe(), move |event: pb::OpChanged| {
            let matches = event.op == op
                && (package_name.is_empty() || event.package_name == package_name);
            matches.then_some(event)
        })
    }

    fn forward<T, U, F>(
        &self,
        mut rx: broadcast::Receiver<T>,
        select: F,
    ) -> ReceiverStream<Result<U, Status>>
    where
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> Option<U> + Send + 'static,
    {
        let (tx, out) = mpsc::channel(SUBSCRIBER_BUFFER);
        let stop = stopped(self.stopping.clone());
        tokio::spawn(async move {
            tokio::pin!(stop);
            loop {
                let item = tokio::select! {
                    _ = &mut stop => break,
                    _ = tx.closed() => break,
                    item = rx.recv() => item,
                };
                match item {
                    Ok(item) => {
                        if let Some(event) = select(item) {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event watcher lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ReceiverStream::new(out)
    }
}
