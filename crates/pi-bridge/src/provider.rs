use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use pi_proto::pi::v1 as pb;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    archive::ArchiveInfo,
    callbacks::CallbackRegistry,
    error::BridgeError,
    proxy::{OpModeCallback, SessionCallback},
    remote::{Identity, RemoteService, UserFilter},
};

/// Liveness flag shared between a provider and the watcher of its channel.
#[derive(Clone)]
pub(crate) struct Liveness(Arc<watch::Sender<bool>>);

impl Liveness {
    pub(crate) fn new(alive: bool) -> Self {
        Self(Arc::new(watch::Sender::new(alive)))
    }

    /// Returns true when the value changed.
    pub(crate) fn set(&self, alive: bool) -> bool {
        self.0.send_if_modified(|current| {
            if *current == alive {
                return false;
            }
            *current = alive;
            true
        })
    }

    pub(crate) fn get(&self) -> bool {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// One established privileged channel. Owned by the manager; everything else
/// holds a `Weak` to it.
pub(crate) struct Link {
    pub(crate) remote: Arc<dyn RemoteService>,
    pub(crate) callbacks: CallbackRegistry,
}

impl Link {
    pub(crate) fn new(remote: Arc<dyn RemoteService>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            callbacks: CallbackRegistry::default(),
        })
    }

    fn resolve(link: &Weak<Link>) -> Result<Arc<Link>, BridgeError> {
        match link.upgrade() {
            Some(link) if !link.callbacks.is_closed() => Ok(link),
            _ => Err(BridgeError::NotConnected),
        }
    }
}

/// Capability surface of one privileged connection.
#[tonic::async_trait]
pub trait Provider: Send + Sync {
    fn identity(&self) -> &Identity;

    fn uid(&self) -> i32 {
        self.identity().uid
    }

    fn pid(&self) -> i32 {
        self.identity().pid
    }

    fn version(&self) -> i32 {
        self.identity().version
    }

    fn se_linux_context(&self) -> &str {
        &self.identity().se_linux_context
    }

    fn package_manager(&self) -> Result<PackageManager, BridgeError>;

    fn user_manager(&self) -> Result<UserManager, BridgeError>;

    fn app_ops(&self) -> Result<AppOpsService, BridgeError>;

    fn permission_manager(&self) -> Result<PermissionManager, BridgeError>;

    /// Flips to `false` once the remote side is gone.
    fn is_alive(&self) -> watch::Receiver<bool>;

    /// The live remote service, when this provider talks to one directly.
    fn service(&self) -> Option<Arc<dyn RemoteService>> {
        None
    }

    async fn init(&self) -> Result<(), BridgeError>;

    async fn destroy(&self);
}

/// Full provider backed by a bound privileged service.
pub struct ServiceProvider {
    identity: Identity,
    link: Weak<Link>,
    liveness: Liveness,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

impl ServiceProvider {
    pub(crate) fn new(identity: Identity, link: &Arc<Link>, liveness: Liveness) -> Self {
        Self {
            identity,
            link: Arc::downgrade(link),
            liveness,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }
}

#[tonic::async_trait]
impl Provider for ServiceProvider {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn package_manager(&self) -> Result<PackageManager, BridgeError> {
        Link::resolve(&self.link)?;
        Ok(PackageManager {
            link: self.link.clone(),
        })
    }

    fn user_manager(&self) -> Result<UserManager, BridgeError> {
        Link::resolve(&self.link)?;
        Ok(UserManager {
            link: self.link.clone(),
        })
    }

    fn app_ops(&self) -> Result<AppOpsService, BridgeError> {
        Link::resolve(&self.link)?;
        Ok(AppOpsService {
            link: self.link.clone(),
        })
    }

    fn permission_manager(&self) -> Result<PermissionManager, BridgeError> {
        Link::resolve(&self.link)?;
        Ok(PermissionManager {
            link: self.link.clone(),
        })
    }

    fn is_alive(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }

    fn service(&self) -> Option<Arc<dyn RemoteService>> {
        Link::resolve(&self.link)
            .ok()
            .map(|link| Arc::clone(&link.remote))
    }

    async fn init(&self) -> Result<(), BridgeError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        Link::resolve(&self.link)?;
        debug!(
            "provider ready: uid={} pid={} version={} context={}",
            self.identity.uid, self.identity.pid, self.identity.version, self.identity.se_linux_context
        );
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(link) = self.link.upgrade() {
            link.callbacks.close();
        }
        self.liveness.set(false);
    }
}

/// Reduced provider for a broker that only authorizes a delegated process.
pub struct DelegatedProvider {
    identity: Identity,
    liveness: Liveness,
    destroyed: AtomicBool,
}

impl DelegatedProvider {
    pub(crate) fn new(uid: i32, liveness: Liveness) -> Self {
        Self {
            identity: Identity {
                uid,
                ..Identity::default()
            },
            liveness,
            destroyed: AtomicBool::new(false),
        }
    }
}

#[tonic::async_trait]
impl Provider for DelegatedProvider {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn package_manager(&self) -> Result<PackageManager, BridgeError> {
        Err(BridgeError::Unsupported("package manager"))
    }

    fn user_manager(&self) -> Result<UserManager, BridgeError> {
        Err(BridgeError::Unsupported("user manager"))
    }

    fn app_ops(&self) -> Result<AppOpsService, BridgeError> {
        Err(BridgeError::Unsupported("app ops"))
    }

    fn permission_manager(&self) -> Result<PermissionManager, BridgeError> {
        Err(BridgeError::Unsupported("permission manager"))
    }

    fn is_alive(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }

    async fn init(&self) -> Result<(), BridgeError> {
        debug!("delegated provider ready: uid={}", self.identity.uid);
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.liveness.set(false);
        }
    }
}

/// Package-manager compatible operations.
#[derive(Clone)]
pub struct PackageManager {
    link: Weak<Link>,
}

impl PackageManager {
    /// Returns the installer status (`0` success, `1` failure).
    pub async fn install(
        &self,
        archive: ArchiveInfo,
        installer_package_name: &str,
        user_id: i32,
    ) -> Result<i32, BridgeError> {
        archive.ensure_installable()?;
        let link = Link::resolve(&self.link)?;
        link.remote
            .install(archive, installer_package_name.to_string(), user_id)
            .await
    }

    pub async fn uninstall(&self, package_name: &str, user_id: i32) -> Result<i32, BridgeError> {
        if package_name.is_empty() {
            return Err(BridgeError::InvalidArgument("package name is empty".into()));
        }
        let link = Link::resolve(&self.link)?;
        link.remote.uninstall(package_name.to_string(), user_id).await
    }

    pub async fn package_info(
        &self,
        package_name: &str,
        flags: i32,
        user_id: i32,
    ) -> Result<pb::PackageInfo, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote
            .package_info(package_name.to_string(), flags, user_id)
            .await
    }

    pub async fn installed_packages(
        &self,
        flags: i32,
        user_id: i32,
    ) -> Result<Vec<pb::PackageInfo>, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.installed_packages(flags, user_id).await
    }

    pub async fn packages_for_uid(&self, uid: i32) -> Result<Vec<String>, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.packages_for_uid(uid).await
    }

    pub async fn package_uid(
        &self,
        package_name: &str,
        flags: i32,
        user_id: i32,
    ) -> Result<i32, BridgeError> {
        if package_name.is_empty() {
            return Err(BridgeError::InvalidArgument("package name is empty".into()));
        }
        let link = Link::resolve(&self.link)?;
        link.remote
            .package_uid(package_name.to_string(), flags, user_id)
            .await
    }

    pub async fn session_info(&self, session_id: i32) -> Result<pb::SessionInfo, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.session_info(session_id).await
    }

    /// `user_id = -1` lists sessions of every user.
    pub async fn all_sessions(&self, user_id: i32) -> Result<Vec<pb::SessionInfo>, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.sessions(user_id).await
    }

    pub async fn register_session_callback(
        &self,
        listener: Arc<dyn SessionCallback>,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.callbacks
            .register_session(&link.remote, listener, user_id)
            .await
    }

    /// Returns false when the listener was not registered on this channel.
    pub fn unregister_session_callback(&self, listener: &Arc<dyn SessionCallback>) -> bool {
        match self.link.upgrade() {
            Some(link) => link.callbacks.unregister_session(listener),
            None => false,
        }
    }
}

/// User-manager compatible operations.
#[derive(Clone)]
pub struct UserManager {
    link: Weak<Link>,
}

impl UserManager {
    pub async fn users(&self, filter: UserFilter) -> Result<Vec<pb::UserInfo>, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.users(filter).await
    }

    pub async fn user_info(&self, user_id: i32) -> Result<pb::UserInfo, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.user_info(user_id).await
    }
}

/// App-ops compatible operations.
#[derive(Clone)]
pub struct AppOpsService {
    link: Weak<Link>,
}

impl AppOpsService {
    pub async fn check_operation(
        &self,
        code: i32,
        uid: i32,
        package_name: &str,
    ) -> Result<i32, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote
            .check_operation(code, uid, package_name.to_string())
            .await
    }

    pub async fn set_mode(
        &self,
        code: i32,
        uid: i32,
        package_name: &str,
        mode: i32,
    ) -> Result<(), BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote
            .set_mode(code, uid, package_name.to_string(), mode)
            .await
    }

    /// An empty `ops` returns every op the package has a mode for.
    pub async fn ops_for_package(
        &self,
        uid: i32,
        package_name: &str,
        ops: &[i32],
    ) -> Result<Vec<pb::OpEntry>, BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote
            .ops_for_package(uid, package_name.to_string(), ops.to_vec())
            .await
    }

    pub async fn set_uid_mode(&self, code: i32, uid: i32, mode: i32) -> Result<(), BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote.set_uid_mode(code, uid, mode).await
    }

    /// `package_name = None` resets every package of the user.
    pub async fn reset_all_modes(
        &self,
        user_id: i32,
        package_name: Option<&str>,
    ) -> Result<(), BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.remote
            .reset_all_modes(user_id, package_name.map(str::to_string))
            .await
    }

    /// `package_name = None` watches the op for every package.
    pub async fn start_watching_mode(
        &self,
        op: i32,
        package_name: Option<&str>,
        listener: Arc<dyn OpModeCallback>,
    ) -> Result<(), BridgeError> {
        let link = Link::resolve(&self.link)?;
        link.callbacks
            .register_op_mode(&link.remote, op, package_name.map(str::to_string), listener)
            .await
    }

    pub fn stop_watching_mode(&self, listener: &Arc<dyn OpModeCallback>) -> bool {
        match self.link.upgrade() {
            Some(link) => link.callbacks.unregister_op_mode(listener),
            None => false,
        }
    }
}

/// Runtime permission grants.
#[derive(Clone)]
pub struct PermissionManager {
    link: Weak<Link>,
}

impl PermissionManager {
    pub async fn grant_runtime_permission(
        &self,
        package_name: &str,
        permission: &str,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        check_permission_args(package_name, permission)?;
        let link = Link::resolve(&self.link)?;
        link.remote
            .grant_runtime_permission(package_name.to_string(), permission.to_string(), user_id)
            .await
    }

    pub async fn revoke_runtime_permission(
        &self,
        package_name: &str,
        permission: &str,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        check_permission_args(package_name, permission)?;
        let link = Link::resolve(&self.link)?;
        link.remote
            .revoke_runtime_permission(package_name.to_string(), permission.to_string(), user_id)
            .await
    }
}

fn check_permission_args(package_name: &str, permission: &str) -> Result<(), BridgeError> {
    if package_name.is_empty() {
        return Err(BridgeError::InvalidArgument("package name is empty".into()));
    }
    if permission.is_empty() {
        return Err(BridgeError::InvalidArgument("permission is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proxy::tests::{session_event, Call, Recorder},
        testing::{wait_until, FakeRemote},
    };
    use pi_proto::pi::v1::session_event::Payload;

    fn provider_for(remote: &Arc<FakeRemote>) -> (Arc<Link>, ServiceProvider) {
        let link = Link::new(remote.clone());
        let provider = ServiceProvider::new(remote.identity.clone(), &link, Liveness::new(true));
        (link, provider)
    }

    #[test]
    fn liveness_reports_changes_only() {
        let liveness = Liveness::new(true);
        let rx = liveness.subscribe();
        assert!(!liveness.set(true));
        assert!(liveness.set(false));
        assert!(!*rx.borrow());
        assert!(!liveness.get());
    }

    #[tokio::test]
    async fn install_rejects_empty_package_name() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let pm = provider.package_manager().unwrap();
        let err = pm
            .install(ArchiveInfo::new("/data/local/tmp/a.apk", "", ""), "io.privinstall.app", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert!(remote.installs.lock().unwrap().is_empty());

        let status = pm
            .install(
                ArchiveInfo::new("/data/local/tmp/a.apk", "com.example.app", "com.android.vending"),
                "io.privinstall.app",
                0,
            )
            .await
            .unwrap();
        assert_eq!(status, pi_proto::status::SUCCESS);
        let installs = remote.installs.lock().unwrap();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].0.package_name(), "com.example.app");
    }

    #[tokio::test]
    async fn capabilities_fail_once_the_link_is_dropped() {
        let remote = FakeRemote::new(0, 42);
        let (link, provider) = provider_for(&remote);
        let users = provider.user_manager().unwrap();
        assert_eq!(users.users(UserFilter::default()).await.unwrap().len(), 1);

        drop(link);
        assert_eq!(
            users.user_info(0).await.unwrap_err(),
            BridgeError::NotConnected
        );
        assert!(matches!(
            provider.package_manager(),
            Err(BridgeError::NotConnected)
        ));
        assert!(provider.service().is_none());
    }

    #[tokio::test]
    async fn destroy_closes_callbacks_and_liveness() {
        let remote = FakeRemote::new(0, 42);
        let (link, provider) = provider_for(&remote);
        provider.init().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let pm = provider.package_manager().unwrap();
        pm.register_session_callback(recorder.clone(), 0).await.unwrap();
        assert_eq!(link.callbacks.len(), 1);

        let alive = provider.is_alive();
        provider.destroy().await;
        provider.destroy().await;
        assert!(!*alive.borrow());
        assert_eq!(link.callbacks.len(), 0);

        remote.emit_session(session_event(Payload::ProgressChanged(
            pb::SessionProgressChanged {
                session_id: 1,
                progress: 0.5,
            },
        )));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(recorder.calls().is_empty());
        assert_eq!(
            pm.register_session_callback(recorder.clone(), 0)
                .await
                .unwrap_err(),
            BridgeError::NotConnected
        );
    }

    #[tokio::test]
    async fn op_mode_watch_round_trip() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let ops = provider.app_ops().unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn OpModeCallback> = recorder.clone();
        ops.start_watching_mode(24, None, listener.clone()).await.unwrap();
        ops.set_mode(24, 10_123, "com.example.app", 0).await.unwrap();
        assert!(
            wait_until(|| recorder.calls() == vec![Call::Op(24, 10_123, "com.example.app".into())])
                .await
        );

        assert!(ops.stop_watching_mode(&listener));
        assert!(!ops.stop_watching_mode(&listener));
        remote.emit_op(pb::OpChanged {
            op: 24,
            uid: 1,
            package_name: "other".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn session_queries_filter_by_user() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let pm = provider.package_manager().unwrap();

        let all = pm.all_sessions(-1).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].app_package_name, "com.example.app");
        assert!(pm.all_sessions(10).await.unwrap().is_empty());
        assert_eq!(pm.session_info(7).await.unwrap().progress, 0.5);
        assert!(matches!(
            pm.session_info(8).await,
            Err(BridgeError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn package_uid_requires_a_name() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let pm = provider.package_manager().unwrap();
        assert_eq!(pm.package_uid("com.example.app", 0, 0).await.unwrap(), 10_001);
        assert!(matches!(
            pm.package_uid("", 0, 0).await,
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn uid_mode_and_reset_reach_the_remote() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let ops = provider.app_ops().unwrap();
        let recorder = Arc::new(Recorder::default());
        ops.start_watching_mode(27, None, recorder.clone()).await.unwrap();

        ops.set_uid_mode(27, 10_001, 1).await.unwrap();
        assert!(wait_until(|| recorder.calls() == vec![Call::Op(27, 10_001, String::new())]).await);

        let entries = ops.ops_for_package(10_001, "com.example.app", &[24, 27]).await.unwrap();
        assert_eq!(
            entries.iter().map(|e| e.op).collect::<Vec<_>>(),
            vec![24, 27]
        );

        ops.reset_all_modes(0, Some("com.example.app")).await.unwrap();
        ops.reset_all_modes(10, None).await.unwrap();
        assert_eq!(
            *remote.resets.lock().unwrap(),
            vec![(0, Some("com.example.app".to_string())), (10, None)]
        );
    }

    #[rstest::rstest]
    #[case("", "android.permission.CAMERA")]
    #[case("com.example.app", "")]
    #[tokio::test]
    async fn permission_changes_need_package_and_name(
        #[case] package_name: &str,
        #[case] permission: &str,
    ) {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let perms = provider.permission_manager().unwrap();
        assert!(matches!(
            perms.grant_runtime_permission(package_name, permission, 0).await,
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(remote.permissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn grant_then_revoke_runtime_permission() {
        let remote = FakeRemote::new(0, 42);
        let (_link, provider) = provider_for(&remote);
        let perms = provider.permission_manager().unwrap();
        perms
            .grant_runtime_permission("com.example.app", "android.permission.CAMERA", 0)
            .await
            .unwrap();
        perms
            .revoke_runtime_permission("com.example.app", "android.permission.CAMERA", 0)
            .await
            .unwrap();
        let log = remote.permissions.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].3);
        assert!(!log[1].3);
    }

    #[test]
    fn delegated_provider_exposes_uid_only() {
        let provider = DelegatedProvider::new(2000, Liveness::new(true));
        assert_eq!(provider.uid(), 2000);
        assert_eq!(provider.pid(), 0);
        assert_eq!(
            provider.package_manager().err(),
            Some(BridgeError::Unsupported("package manager"))
        );
        assert!(provider.user_manager().is_err());
        assert!(provider.app_ops().is_err());
        assert_eq!(
            provider.permission_manager().err(),
            Some(BridgeError::Unsupported("permission manager"))
        );
        assert!(provider.service().is_none());
    }
}
