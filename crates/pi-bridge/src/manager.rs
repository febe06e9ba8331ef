use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures_util::{
    future::{self, BoxFuture, FutureExt, Shared},
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::{
    sync::{broadcast, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, Bound, BrokerBackend, SuperuserBackend},
    config::BridgeConfig,
    descriptor::ServiceDescriptor,
    error::BridgeError,
    preference::PreferenceStore,
    provider::{DelegatedProvider, Link, Liveness, Provider, ServiceProvider},
    remote::EventStream,
    state::{ProviderChoice, ServiceState},
};

const STATE_BROADCAST_CAPACITY: usize = 64;

type Attempt = Shared<BoxFuture<'static, ServiceState>>;

#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Upper bound for one bind + handshake.
    pub connect_timeout: Duration,
    /// Upper bound for releasing a channel; slower teardowns are abandoned.
    pub teardown_timeout: Duration,
    /// Reconnect to the same backend after the remote dies.
    pub auto_reconnect: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(5),
            auto_reconnect: false,
        }
    }
}

struct Connection {
    generation: u64,
    choice: ProviderChoice,
    backend: Arc<dyn Backend>,
    link: Option<Arc<Link>>,
    provider: Arc<dyn Provider>,
    liveness: Liveness,
    watcher: JoinHandle<()>,
}

struct Current {
    state: ServiceState,
    connection: Option<Connection>,
}

struct Inner {
    backends: HashMap<ProviderChoice, Arc<dyn Backend>>,
    descriptor: ServiceDescriptor,
    options: ManagerOptions,
    current: Mutex<Current>,
    events: broadcast::Sender<ServiceState>,
    attempt: Mutex<Option<Attempt>>,
    // Serializes connect start, recreate, shutdown and death handling.
    lifecycle: AsyncMutex<()>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the privileged channel and publishes its [`ServiceState`].
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct ServiceManagerBuilder {
    backends: HashMap<ProviderChoice, Arc<dyn Backend>>,
    descriptor: ServiceDescriptor,
    options: ManagerOptions,
}

impl ServiceManagerBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.choice(), backend);
        self
    }

    pub fn descriptor(mut self, descriptor: ServiceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> ServiceManager {
        let (events, _) = broadcast::channel(STATE_BROADCAST_CAPACITY);
        ServiceManager {
            inner: Arc::new(Inner {
                backends: self.backends,
                descriptor: self.descriptor,
                options: self.options,
                current: Mutex::new(Current {
                    state: ServiceState::Pending,
                    connection: None,
                }),
                events,
                attempt: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl ServiceManager {
    pub fn builder() -> ServiceManagerBuilder {
        ServiceManagerBuilder::default()
    }

    /// Broker and superuser backends wired from `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::builder()
            .backend(Arc::new(BrokerBackend::new(config.broker())))
            .backend(Arc::new(SuperuserBackend::new(config.superuser())))
            .options(config.manager_options())
            .build()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.descriptor
    }

    pub fn state(&self) -> ServiceState {
        self.inner.current().state.clone()
    }

    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        self.state().provider()
    }

    /// Backend of the live channel, if any.
    pub fn active_choice(&self) -> Option<ProviderChoice> {
        self.inner
            .current()
            .connection
            .as_ref()
            .map(|connection| connection.choice)
    }

    /// Current state first, then every later transition.
    pub fn observe_state(&self) -> BoxStream<'static, ServiceState> {
        let (snapshot, rx) = {
            let current = self.inner.current();
            (current.state.clone(), self.inner.events.subscribe())
        };
        let live = BroadcastStream::new(rx).filter_map(|item| {
            future::ready(match item {
                Ok(state) => Some(state),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("state observer lagged, skipped {skipped} transitions");
                    None
                }
            })
        });
        stream::once(future::ready(snapshot)).chain(live).boxed()
    }

    /// Start (or join) a connection attempt and wait for its outcome.
    ///
    /// The attempt runs on its own task, so dropping the returned future does
    /// not cancel it. Failures come back as [`ServiceState::Failure`].
    pub async fn connect(&self, choice: ProviderChoice) -> ServiceState {
        let attempt = {
            let _guard = self.inner.lifecycle.lock().await;
            Inner::begin_attempt(&self.inner, choice)
        };
        attempt.await
    }

    /// Tear down whatever is there and connect to `choice` afresh.
    pub async fn recreate(&self, choice: ProviderChoice) -> ServiceState {
        let attempt = {
            let _guard = self.inner.lifecycle.lock().await;
            self.inner.settle().await;
            self.inner.teardown().await;
            self.inner.publish(ServiceState::Pending);
            Inner::begin_attempt(&self.inner, choice)
        };
        attempt.await
    }

    /// Release the channel and go back to `Pending`.
    pub async fn shutdown(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.settle().await;
        self.inner.teardown().await;
        self.inner.publish(ServiceState::Pending);
    }

    /// Keep the connection in line with the stored provider preference.
    pub fn follow_preferences(&self, store: &PreferenceStore) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let choice = rx.borrow_and_update().provider;
                manager.apply_preference(choice).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    async fn apply_preference(&self, choice: ProviderChoice) {
        if self.state().is_succeed() {
            if self.active_choice() != Some(choice) {
                info!("preferred provider changed to {choice}");
                self.recreate(choice).await;
            }
        } else {
            self.connect(choice).await;
        }
    }
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Current> {
        lock(&self.current)
    }

    fn publish(&self, state: ServiceState) {
        let mut current = self.current();
        self.publish_locked(&mut current, state);
    }

    fn publish_locked(&self, current: &mut Current, state: ServiceState) {
        if current.state.is_pending() && state.is_pending() {
            return;
        }
        info!("service state: {state:?}");
        current.state = state.clone();
        let _ = self.events.send(state);
    }

    fn begin_attempt(this: &Arc<Self>, choice: ProviderChoice) -> Attempt {
        let mut slot = lock(&this.attempt);
        if let Some(attempt) = slot.as_ref() {
            debug!("joining connection attempt in flight");
            return attempt.clone();
        }
        {
            let current = this.current();
            if current.state.is_succeed() {
                return future::ready(current.state.clone()).boxed().shared();
            }
        }

        let inner = Arc::clone(this);
        let task = tokio::spawn(async move {
            let state = inner.establish(choice).await;
            lock(&inner.attempt).take();
            state
        });
        let attempt = async move {
            match task.await {
                Ok(state) => state,
                Err(err) => ServiceState::Failure(BridgeError::ConnectionFailure(format!(
                    "connection task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        *slot = Some(attempt.clone());
        attempt
    }

    /// Wait out an attempt that is already running.
    async fn settle(&self) {
        let in_flight = lock(&self.attempt).clone();
        if let Some(attempt) = in_flight {
            attempt.await;
        }
    }

    async fn establish(self: &Arc<Self>, choice: ProviderChoice) -> ServiceState {
        if choice == ProviderChoice::None {
            self.teardown().await;
            self.publish(ServiceState::Pending);
            return ServiceState::Pending;
        }
        let Some(backend) = self.backends.get(&choice).cloned() else {
            let state = ServiceState::Failure(BridgeError::ConnectionFailure(format!(
                "no {choice} backend configured"
            )));
            self.publish(state.clone());
            return state;
        };

        self.publish(ServiceState::Pending);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = self.options.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.open(generation, choice, &backend)).await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ConnectionFailure(format!(
                "{choice} did not connect within {timeout:?}"
            ))),
        };

        match result {
            Ok(connection) => {
                let state = ServiceState::Success(Arc::clone(&connection.provider));
                let liveness = connection.liveness.clone();
                {
                    let mut current = self.current();
                    current.connection = Some(connection);
                    self.publish_locked(&mut current, state.clone());
                }
                // The watcher may have fired before the connection was stored.
                if !liveness.get() {
                    tokio::spawn(Arc::clone(self).on_remote_death(generation));
                }
                state
            }
            Err(err) => {
                warn!("connecting to {choice} failed: {err}");
                let state = ServiceState::Failure(err);
                self.publish(state.clone());
                state
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        generation: u64,
        choice: ProviderChoice,
        backend: &Arc<dyn Backend>,
    ) -> Result<Connection, BridgeError> {
        let requested = self.descriptor.requested_version();
        let mut rebound = false;
        loop {
            match backend.bind(&self.descriptor).await? {
                Bound::Delegated { uid, heartbeat } => {
                    let liveness = Liveness::new(true);
                    let provider: Arc<dyn Provider> =
                        Arc::new(DelegatedProvider::new(uid, liveness.clone()));
                    provider.init().await?;
                    let watcher = self.spawn_watcher(generation, heartbeat, liveness.clone());
                    return Ok(Connection {
                        generation,
                        choice,
                        backend: Arc::clone(backend),
                        link: None,
                        provider,
                        liveness,
                        watcher,
                    });
                }
                Bound::Service(remote) => {
                    let identity = remote.identity().await?;
                    if identity.version != requested {
                        warn!(
                            "{choice} service reports version {}, wanted {requested}",
                            identity.version
                        );
                        if let Err(err) = backend.unbind(Some(&remote), &self.descriptor, true).await
                        {
                            warn!("releasing stale {choice} service failed: {err}");
                        }
                        if rebound {
                            return Err(BridgeError::VersionMismatch {
                                requested,
                                actual: identity.version,
                            });
                        }
                        rebound = true;
                        continue;
                    }
                    debug!(
                        "{choice} identity: uid={} pid={} context={}",
                        identity.uid, identity.pid, identity.se_linux_context
                    );

                    let heartbeat = remote.watch_alive().await?;
                    let link = Link::new(remote);
                    let liveness = Liveness::new(true);
                    let provider: Arc<dyn Provider> =
                        Arc::new(ServiceProvider::new(identity, &link, liveness.clone()));
                    provider.init().await?;
                    let watcher = self.spawn_watcher(generation, heartbeat, liveness.clone());
                    return Ok(Connection {
                        generation,
                        choice,
                        backend: Arc::clone(backend),
                        link: Some(link),
                        provider,
                        liveness,
                        watcher,
                    });
                }
            }
        }
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        generation: u64,
        mut heartbeat: EventStream<()>,
        liveness: Liveness,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(beat) = heartbeat.next().await {
                if let Err(err) = beat {
                    debug!("heartbeat failed: {err}");
                    break;
                }
            }
            liveness.set(false);
            // Separate task: teardown aborts this watcher.
            if let Some(inner) = inner.upgrade() {
                tokio::spawn(inner.on_remote_death(generation));
            }
        })
    }

    async fn on_remote_death(self: Arc<Self>, generation: u64) {
        let _guard = self.lifecycle.lock().await;
        let connection = {
            let mut current = self.current();
            let matches = current
                .connection
                .as_ref()
                .is_some_and(|connection| connection.generation == generation);
            if matches {
                current.connection.take()
            } else {
                None
            }
        };
        let Some(connection) = connection else {
            debug!("ignoring stale death notice for connection {generation}");
            return;
        };

        let choice = connection.choice;
        warn!("{choice} service died: {}", BridgeError::RemoteDeath);
        connection.liveness.set(false);
        self.dispose(connection).await;
        self.publish(ServiceState::Pending);

        if self.options.auto_reconnect {
            info!("reconnecting to {choice}");
            let manager = ServiceManager {
                inner: Arc::clone(&self),
            };
            tokio::spawn(async move {
                manager.connect(choice).await;
            });
        }
    }

    async fn teardown(&self) {
        let connection = self.current().connection.take();
        if let Some(connection) = connection {
            self.dispose(connection).await;
        }
    }

    async fn dispose(&self, connection: Connection) {
        let Connection {
            choice,
            backend,
            link,
            provider,
            watcher,
            ..
        } = connection;
        watcher.abort();
        provider.destroy().await;
        if let Some(link) = &link {
            link.callbacks.close();
        }

        let remote = link.as_ref().map(|link| Arc::clone(&link.remote));
        let remove = !self.descriptor.is_daemon();
        let release = backend.unbind(remote.as_ref(), &self.descriptor, remove);
        match tokio::time::timeout(self.options.teardown_timeout, release).await {
            Ok(Ok(())) => info!("released {choice} channel"),
            Ok(Err(err)) => warn!("releasing {choice} channel failed: {err}"),
            Err(_) => warn!(
                "releasing {choice} channel timed out after {:?}",
                self.options.teardown_timeout
            ),
        }
    }
}
