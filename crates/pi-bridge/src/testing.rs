//! In-memory remotes and backends for exercising the bridge without a device.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::StreamExt;
use pi_proto::pi::v1 as pb;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    archive::ArchiveInfo,
    backend::{Backend, Bound},
    descriptor::ServiceDescriptor,
    error::BridgeError,
    remote::{EventStream, Identity, RemoteService, UserFilter},
    state::ProviderChoice,
};

type Senders<T> = Mutex<Vec<mpsc::UnboundedSender<Result<T, BridgeError>>>>;

fn open<T: Send + 'static>(senders: &Senders<T>) -> EventStream<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    senders.lock().unwrap().push(tx);
    UnboundedReceiverStream::new(rx).boxed()
}

fn emit<T: Clone>(senders: &Senders<T>, event: T) -> usize {
    let mut guard = senders.lock().unwrap();
    guard.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    guard.len()
}

pub(crate) struct FakeRemote {
    pub(crate) identity: Identity,
    session_events: Senders<pb::SessionEvent>,
    ops: Senders<pb::OpChanged>,
    heartbeats: Senders<()>,
    pub(crate) installs: Mutex<Vec<(ArchiveInfo, String, i32)>>,
    /// `(package, permission, user, granted)`
    pub(crate) permissions: Mutex<Vec<(String, String, i32, bool)>>,
    pub(crate) resets: Mutex<Vec<(i32, Option<String>)>>,
    pub(crate) shutdowns: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn new(uid: i32, pid: i32) -> Arc<Self> {
        Self::with_version(uid, pid, pi_proto::PROTOCOL_VERSION)
    }

    pub(crate) fn with_version(uid: i32, pid: i32, version: i32) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity {
                uid,
                pid,
                version,
                se_linux_context: "u:r:su:s0".into(),
            },
            session_events: Mutex::default(),
            ops: Mutex::default(),
            heartbeats: Mutex::default(),
            installs: Mutex::default(),
            permissions: Mutex::default(),
            resets: Mutex::default(),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// Returns how many subscribers received the event.
    pub(crate) fn emit_session(&self, event: pb::SessionEvent) -> usize {
        emit(&self.session_events, event)
    }

    pub(crate) fn emit_op(&self, event: pb::OpChanged) -> usize {
        emit(&self.ops, event)
    }

    /// Simulate the remote process dying: every open stream ends.
    pub(crate) fn kill(&self) {
        self.heartbeats.lock().unwrap().clear();
        self.session_events.lock().unwrap().clear();
        self.ops.lock().unwrap().clear();
    }
}

#[tonic::async_trait]
impl RemoteService for FakeRemote {
    async fn identity(&self) -> Result<Identity, BridgeError> {
        Ok(self.identity.clone())
    }

    async fn install(
        &self,
        archive: ArchiveInfo,
        installer_package_name: String,
        user_id: i32,
    ) -> Result<i32, BridgeError> {
        self.installs
            .lock()
            .unwrap()
            .push((archive, installer_package_name, user_id));
        Ok(pi_proto::status::SUCCESS)
    }

    async fn uninstall(&self, _package_name: String, _user_id: i32) -> Result<i32, BridgeError> {
        Ok(pi_proto::status::SUCCESS)
    }

    async fn package_info(
        &self,
        package_name: String,
        _flags: i32,
        _user_id: i32,
    ) -> Result<pb::PackageInfo, BridgeError> {
        Ok(pb::PackageInfo {
            package_name,
            uid: 10_001,
            version_code: 1,
            installer: String::new(),
        })
    }

    async fn installed_packages(
        &self,
        _flags: i32,
        _user_id: i32,
    ) -> Result<Vec<pb::PackageInfo>, BridgeError> {
        Ok(vec![])
    }

    async fn packages_for_uid(&self, _uid: i32) -> Result<Vec<String>, BridgeError> {
        Ok(vec![])
    }

    async fn package_uid(
        &self,
        package_name: String,
        _flags: i32,
        _user_id: i32,
    ) -> Result<i32, BridgeError> {
        match package_name.as_str() {
            "com.example.app" => Ok(10_001),
            _ => Err(BridgeError::Remote(format!("package not found: {package_name}"))),
        }
    }

    async fn session_info(&self, session_id: i32) -> Result<pb::SessionInfo, BridgeError> {
        self.sessions(-1)
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| BridgeError::Remote(format!("session not found: {session_id}")))
    }

    async fn sessions(&self, user_id: i32) -> Result<Vec<pb::SessionInfo>, BridgeError> {
        let session = pb::SessionInfo {
            session_id: 7,
            user_id: 0,
            active: true,
            staged: false,
            committed: false,
            installer_package_name: "io.privinstall.app".into(),
            app_package_name: "com.example.app".into(),
            progress: 0.5,
        };
        Ok(if user_id == -1 || user_id == session.user_id {
            vec![session]
        } else {
            vec![]
        })
    }

    async fn grant_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        self.permissions
            .lock()
            .unwrap()
            .push((package_name, permission, user_id, true));
        Ok(())
    }

    async fn revoke_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        self.permissions
            .lock()
            .unwrap()
            .push((package_name, permission, user_id, false));
        Ok(())
    }

    async fn users(&self, _filter: UserFilter) -> Result<Vec<pb::UserInfo>, BridgeError> {
        Ok(vec![pb::UserInfo {
            id: 0,
            name: "Owner".into(),
            flags: 0x13,
            running: true,
        }])
    }

    async fn user_info(&self, user_id: i32) -> Result<pb::UserInfo, BridgeError> {
        Ok(pb::UserInfo {
            id: user_id,
            name: format!("user{user_id}"),
            flags: 0,
            running: true,
        })
    }

    async fn check_operation(
        &self,
        _code: i32,
        _uid: i32,
        _package_name: String,
    ) -> Result<i32, BridgeError> {
        Ok(0)
    }

    async fn set_mode(
        &self,
        code: i32,
        uid: i32,
        package_name: String,
        _mode: i32,
    ) -> Result<(), BridgeError> {
        self.emit_op(pb::OpChanged {
            op: code,
            uid,
            package_name,
        });
        Ok(())
    }

    async fn ops_for_package(
        &self,
        _uid: i32,
        _package_name: String,
        ops: Vec<i32>,
    ) -> Result<Vec<pb::OpEntry>, BridgeError> {
        Ok(ops
            .into_iter()
            .map(|op| pb::OpEntry {
                op,
                name: format!("OP_{op}"),
                mode: 0,
            })
            .collect())
    }

    async fn set_uid_mode(&self, code: i32, uid: i32, _mode: i32) -> Result<(), BridgeError> {
        self.emit_op(pb::OpChanged {
            op: code,
            uid,
            package_name: String::new(),
        });
        Ok(())
    }

    async fn reset_all_modes(
        &self,
        user_id: i32,
        package_name: Option<String>,
    ) -> Result<(), BridgeError> {
        self.resets.lock().unwrap().push((user_id, package_name));
        Ok(())
    }

    async fn watch_sessions(
        &self,
        _user_id: i32,
    ) -> Result<EventStream<pb::SessionEvent>, BridgeError> {
        Ok(open(&self.session_events))
    }

    async fn watch_op_mode(
        &self,
        _op: i32,
        _package_name: Option<String>,
    ) -> Result<EventStream<pb::OpChanged>, BridgeError> {
        Ok(open(&self.ops))
    }

    async fn watch_alive(&self) -> Result<EventStream<()>, BridgeError> {
        Ok(open(&self.heartbeats))
    }

    async fn shutdown(&self) -> Result<(), BridgeError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.kill();
        Ok(())
    }
}

pub(crate) enum Script {
    Remote(Arc<FakeRemote>),
    Delegated(i32, mpsc::UnboundedReceiver<Result<(), BridgeError>>),
    Fail(BridgeError),
}

pub(crate) struct FakeBackend {
    choice: ProviderChoice,
    script: Mutex<VecDeque<Script>>,
    pub(crate) bind_delay: Mutex<Option<Duration>>,
    pub(crate) binds: AtomicUsize,
    pub(crate) unbinds: Mutex<Vec<bool>>,
    pub(crate) fail_unbind: bool,
}

impl FakeBackend {
    pub(crate) fn new(choice: ProviderChoice) -> Self {
        Self {
            choice,
            script: Mutex::default(),
            bind_delay: Mutex::default(),
            binds: AtomicUsize::new(0),
            unbinds: Mutex::default(),
            fail_unbind: false,
        }
    }

    pub(crate) fn failing_unbind(mut self) -> Self {
        self.fail_unbind = true;
        self
    }

    pub(crate) fn delayed(self, delay: Duration) -> Self {
        *self.bind_delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn then(self, step: Script) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub(crate) fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub(crate) fn unbind_calls(&self) -> Vec<bool> {
        self.unbinds.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Backend for FakeBackend {
    fn choice(&self) -> ProviderChoice {
        self.choice
    }

    async fn bind(&self, _descriptor: &ServiceDescriptor) -> Result<Bound, BridgeError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.bind_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Script::Remote(remote)) => Ok(Bound::Service(remote)),
            Some(Script::Delegated(uid, rx)) => Ok(Bound::Delegated {
                uid,
                heartbeat: UnboundedReceiverStream::new(rx).boxed(),
            }),
            Some(Script::Fail(err)) => Err(err),
            None => Err(BridgeError::ConnectionFailure("nothing scripted".into())),
        }
    }

    async fn unbind(
        &self,
        remote: Option<&Arc<dyn RemoteService>>,
        _descriptor: &ServiceDescriptor,
        remove: bool,
    ) -> Result<(), BridgeError> {
        self.unbinds.lock().unwrap().push(remove);
        if self.fail_unbind {
            return Err(BridgeError::Remote("unbind exploded".into()));
        }
        if remove {
            if let Some(remote) = remote {
                remote.shutdown().await?;
            }
        }
        Ok(())
    }
}

pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
