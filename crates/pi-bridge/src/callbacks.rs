use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    error::BridgeError,
    proxy::{listener_key, OpModeCallback, OpModeCallbackProxy, SessionCallback, SessionCallbackProxy},
    remote::{EventStream, RemoteService},
};

struct Registration<P> {
    proxy: Arc<P>,
    task: JoinHandle<()>,
}

trait Detach {
    fn detach(&self);
}

impl Detach for SessionCallbackProxy {
    fn detach(&self) {
        SessionCallbackProxy::detach(self);
    }
}

impl Detach for OpModeCallbackProxy {
    fn detach(&self) {
        OpModeCallbackProxy::detach(self);
    }
}

impl<P: Detach> Registration<P> {
    fn cancel(self) {
        self.proxy.detach();
        self.task.abort();
    }
}

type Table<P> = Mutex<HashMap<usize, Registration<P>>>;

/// Callback subscriptions living on one privileged channel. Closing the
/// registry detaches every proxy and stops every forwarding task.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    sessions: Table<SessionCallbackProxy>,
    ops: Table<OpModeCallbackProxy>,
    closed: AtomicBool,
}

fn lock<P>(table: &Table<P>) -> std::sync::MutexGuard<'_, HashMap<usize, Registration<P>>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_forwarder<T, P>(
    mut stream: EventStream<T>,
    proxy: Arc<P>,
    deliver: fn(&P, T),
) -> JoinHandle<()>
where
    T: Send + 'static,
    P: Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => deliver(&proxy, event),
                Err(err) => {
                    debug!("callback stream ended: {err}");
                    break;
                }
            }
        }
    })
}

impl CallbackRegistry {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn insert<P: Detach>(
        &self,
        table: &Table<P>,
        key: usize,
        registration: Registration<P>,
    ) -> Result<(), BridgeError> {
        let mut guard = lock(table);
        if self.is_closed() {
            drop(guard);
            registration.cancel();
            return Err(BridgeError::NotConnected);
        }
        if guard.contains_key(&key) {
            drop(guard);
            registration.cancel();
            return Ok(());
        }
        guard.insert(key, registration);
        Ok(())
    }

    pub(crate) async fn register_session(
        &self,
        remote: &Arc<dyn RemoteService>,
        listener: Arc<dyn SessionCallback>,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::NotConnected);
        }
        let key = listener_key(&listener);
        if lock(&self.sessions).contains_key(&key) {
            return Ok(());
        }
        let stream = remote.watch_sessions(user_id).await?;
        let proxy = Arc::new(SessionCallbackProxy::new(listener));
        let task = spawn_forwarder(stream, Arc::clone(&proxy), SessionCallbackProxy::dispatch);
        self.insert(&self.sessions, key, Registration { proxy, task })
    }

    pub(crate) fn unregister_session(&self, listener: &Arc<dyn SessionCallback>) -> bool {
        let removed = lock(&self.sessions).remove(&listener_key(listener));
        match removed {
            Some(registration) => {
                registration.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn register_op_mode(
        &self,
        remote: &Arc<dyn RemoteService>,
        op: i32,
        package_name: Option<String>,
        listener: Arc<dyn OpModeCallback>,
    ) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::NotConnected);
        }
        let key = listener_key(&listener);
        if lock(&self.ops).contains_key(&key) {
            return Ok(());
        }
        let stream = remote.watch_op_mode(op, package_name).await?;
        let proxy = Arc::new(OpModeCallbackProxy::new(listener));
        let task = spawn_forwarder(stream, Arc::clone(&proxy), OpModeCallbackProxy::dispatch);
        self.insert(&self.ops, key, Registration { proxy, task })
    }

    pub(crate) fn unregister_op_mode(&self, listener: &Arc<dyn OpModeCallback>) -> bool {
        let removed = lock(&self.ops).remove(&listener_key(listener));
        match removed {
            Some(registration) => {
                registration.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.sessions).len() + lock(&self.ops).len()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, r)| r).collect();
        let ops: Vec<_> = lock(&self.ops).drain().map(|(_, r)| r).collect();
        let count = sessions.len() + ops.len();
        sessions.into_iter().for_each(Registration::cancel);
        ops.into_iter().for_each(Registration::cancel);
        if count > 0 {
            debug!("dropped {count} callback registrations");
        }
    }
}
