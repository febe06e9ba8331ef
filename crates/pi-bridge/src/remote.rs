use std::{sync::Arc, time::Duration};

use futures_util::{stream::BoxStream, StreamExt};
use pi_proto::pi::v1::{self as pb, privileged_service_client::PrivilegedServiceClient};
use pi_util::endpoint_uri;
use tonic::transport::Channel;

use crate::{archive::ArchiveInfo, error::BridgeError};

pub type EventStream<T> = BoxStream<'static, Result<T, BridgeError>>;

/// Process identity of the privileged side, fixed for one connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: i32,
    pub pid: i32,
    pub version: i32,
    pub se_linux_context: String,
}

impl From<pb::Identity> for Identity {
    fn from(id: pb::Identity) -> Self {
        Self {
            uid: id.uid,
            pid: id.pid,
            version: id.version,
            se_linux_context: id.se_linux_context,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub exclude_partial: bool,
    pub exclude_dying: bool,
    pub exclude_pre_created: bool,
}

/// The privileged service on the far side of a channel.
#[tonic::async_trait]
pub trait RemoteService: Send + Sync {
    async fn identity(&self) -> Result<Identity, BridgeError>;

    async fn install(
        &self,
        archive: ArchiveInfo,
        installer_package_name: String,
        user_id: i32,
    ) -> Result<i32, BridgeError>;

    async fn uninstall(&self, package_name: String, user_id: i32) -> Result<i32, BridgeError>;

    async fn package_info(
        &self,
        package_name: String,
        flags: i32,
        user_id: i32,
    ) -> Result<pb::PackageInfo, BridgeError>;

    async fn installed_packages(
        &self,
        flags: i32,
        user_id: i32,
    ) -> Result<Vec<pb::PackageInfo>, BridgeError>;

    async fn packages_for_uid(&self, uid: i32) -> Result<Vec<String>, BridgeError>;

    async fn package_uid(
        &self,
        package_name: String,
        flags: i32,
        user_id: i32,
    ) -> Result<i32, BridgeError>;

    async fn session_info(&self, session_id: i32) -> Result<pb::SessionInfo, BridgeError>;

    /// `user_id = -1` lists sessions of every user.
    async fn sessions(&self, user_id: i32) -> Result<Vec<pb::SessionInfo>, BridgeError>;

    async fn grant_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError>;

    async fn revoke_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError>;

    async fn users(&self, filter: UserFilter) -> Result<Vec<pb::UserInfo>, BridgeError>;

    async fn user_info(&self, user_id: i32) -> Result<pb::UserInfo, BridgeError>;

    async fn check_operation(
        &self,
        code: i32,
        uid: i32,
        package_name: String,
    ) -> Result<i32, BridgeError>;

    async fn set_mode(
        &self,
        code: i32,
        uid: i32,
        package_name: String,
        mode: i32,
    ) -> Result<(), BridgeError>;

    /// An empty `ops` asks for every op the package has a mode for.
    async fn ops_for_package(
        &self,
        uid: i32,
        package_name: String,
        ops: Vec<i32>,
    ) -> Result<Vec<pb::OpEntry>, BridgeError>;

    async fn set_uid_mode(&self, code: i32, uid: i32, mode: i32) -> Result<(), BridgeError>;

    async fn reset_all_modes(
        &self,
        user_id: i32,
        package_name: Option<String>,
    ) -> Result<(), BridgeError>;

    async fn watch_sessions(&self, user_id: i32)
        -> Result<EventStream<pb::SessionEvent>, BridgeError>;

    async fn watch_op_mode(
        &self,
        op: i32,
        package_name: Option<String>,
    ) -> Result<EventStream<pb::OpChanged>, BridgeError>;

    /// Ends (or errors) when the remote process goes away.
    async fn watch_alive(&self) -> Result<EventStream<()>, BridgeError>;

    async fn shutdown(&self) -> Result<(), BridgeError>;
}

/// [`RemoteService`] spoken over gRPC.
#[derive(Clone)]
pub struct GrpcRemote {
    client: PrivilegedServiceClient<Channel>,
}

impl GrpcRemote {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, BridgeError> {
        let channel = Channel::from_shared(endpoint_uri(addr))
            .map_err(|e| BridgeError::ConnectionFailure(format!("invalid endpoint {addr}: {e}")))?
            .connect_timeout(timeout)
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            client: PrivilegedServiceClient::new(channel),
        }
    }

    pub fn into_shared(self) -> Arc<dyn RemoteService> {
        Arc::new(self)
    }

    fn client(&self) -> PrivilegedServiceClient<Channel> {
        self.client.clone()
    }
}

#[tonic::async_trait]
impl RemoteService for GrpcRemote {
    async fn identity(&self) -> Result<Identity, BridgeError> {
        let resp = self
            .client()
            .get_identity(pb::GetIdentityRequest {})
            .await?
            .into_inner();
        resp.identity
            .map(Identity::from)
            .ok_or_else(|| BridgeError::Remote("service returned no identity".into()))
    }

    async fn install(
        &self,
        archive: ArchiveInfo,
        installer_package_name: String,
        user_id: i32,
    ) -> Result<i32, BridgeError> {
        let resp = self
            .client()
            .install(pb::InstallRequest {
                archive: Some(archive.to_proto()),
                installer_package_name,
                user_id,
            })
            .await?
            .into_inner();
        Ok(resp.status)
    }

    async fn uninstall(&self, package_name: String, user_id: i32) -> Result<i32, BridgeError> {
        let resp = self
            .client()
            .uninstall(pb::UninstallRequest {
                package_name,
                user_id,
            })
            .await?
            .into_inner();
        Ok(resp.status)
    }

    async fn package_info(
        &self,
        package_name: String,
        flags: i32,
        user_id: i32,
    ) -> Result<pb::PackageInfo, BridgeError> {
        let resp = self
            .client()
            .get_package_info(pb::GetPackageInfoRequest {
                package_name: package_name.clone(),
                flags,
                user_id,
            })
            .await?
            .into_inner();
        resp.package
            .ok_or_else(|| BridgeError::Remote(format!("package not found: {package_name}")))
    }

    async fn installed_packages(
        &self,
        flags: i32,
        user_id: i32,
    ) -> Result<Vec<pb::PackageInfo>, BridgeError> {
        let resp = self
            .client()
            .list_installed_packages(pb::ListInstalledPackagesRequest { flags, user_id })
            .await?
            .into_inner();
        Ok(resp.packages)
    }

    async fn packages_for_uid(&self, uid: i32) -> Result<Vec<String>, BridgeError> {
        let resp = self
            .client()
            .get_packages_for_uid(pb::GetPackagesForUidRequest { uid })
            .await?
            .into_inner();
        Ok(resp.package_names)
    }

    async fn package_uid(
        &self,
        package_name: String,
        flags: i32,
        user_id: i32,
    ) -> Result<i32, BridgeError> {
        let resp = self
            .client()
            .get_package_uid(pb::GetPackageUidRequest {
                package_name,
                flags,
                user_id,
            })
            .await?
            .into_inner();
        Ok(resp.uid)
    }

    async fn session_info(&self, session_id: i32) -> Result<pb::SessionInfo, BridgeError> {
        let resp = self
            .client()
            .get_session_info(pb::GetSessionInfoRequest { session_id })
            .await?
            .into_inner();
        resp.session
            .ok_or_else(|| BridgeError::Remote(format!("session not found: {session_id}")))
    }

    async fn sessions(&self, user_id: i32) -> Result<Vec<pb::SessionInfo>, BridgeError> {
        let resp = self
            .client()
            .list_sessions(pb::ListSessionsRequest { user_id })
            .await?
            .into_inner();
        Ok(resp.sessions)
    }

    async fn grant_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        self.client()
            .grant_runtime_permission(pb::RuntimePermissionRequest {
                package_name,
                permission,
                user_id,
            })
            .await?;
        Ok(())
    }

    async fn revoke_runtime_permission(
        &self,
        package_name: String,
        permission: String,
        user_id: i32,
    ) -> Result<(), BridgeError> {
        self.client()
            .revoke_runtime_permission(pb::RuntimePermissionRequest {
                package_name,
                permission,
                user_id,
            })
            .await?;
        Ok(())
    }

    async fn users(&self, filter: UserFilter) -> Result<Vec<pb::UserInfo>, BridgeError> {
        let resp = self
            .client()
            .list_users(pb::ListUsersRequest {
                exclude_partial: filter.exclude_partial,
                exclude_dying: filter.exclude_dying,
                exclude_pre_created: filter.exclude_pre_created,
            })
            .await?
            .into_inner();
        Ok(resp.users)
    }

    async fn user_info(&self, user_id: i32) -> Result<pb::UserInfo, BridgeError> {
        let resp = self
            .client()
            .get_user_info(pb::GetUserInfoRequest { user_id })
            .await?
            .into_inner();
        resp.user
            .ok_or_else(|| BridgeError::Remote(format!("user not found: {user_id}")))
    }

    async fn check_operation(
        &self,
        code: i32,
        uid: i32,
        package_name: String,
    ) -> Result<i32, BridgeError> {
        let resp = self
            .client()
            .check_operation(pb::CheckOperationRequest {
                code,
                uid,
                package_name,
            })
            .await?
            .into_inner();
        Ok(resp.mode)
    }

    async fn set_mode(
        &self,
        code: i32,
        uid: i32,
        package_name: String,
        mode: i32,
    ) -> Result<(), BridgeError> {
        self.client()
            .set_mode(pb::SetModeRequest {
                code,
                uid,
                package_name,
                mode,
            })
            .await?;
        Ok(())
    }

    async fn ops_for_package(
        &self,
        uid: i32,
        package_name: String,
        ops: Vec<i32>,
    ) -> Result<Vec<pb::OpEntry>, BridgeError> {
        let resp = self
            .client()
            .get_ops_for_package(pb::GetOpsForPackageRequest {
                uid,
                package_name,
                ops,
            })
            .await?
            .into_inner();
        Ok(resp.ops)
    }

    async fn set_uid_mode(&self, code: i32, uid: i32, mode: i32) -> Result<(), BridgeError> {
        self.client()
            .set_uid_mode(pb::SetUidModeRequest { code, uid, mode })
            .await?;
        Ok(())
    }

    async fn reset_all_modes(
        &self,
        user_id: i32,
        package_name: Option<String>,
    ) -> Result<(), BridgeError> {
        self.client()
            .reset_all_modes(pb::ResetAllModesRequest {
                user_id,
                package_name: package_name.unwrap_or_default(),
            })
            .await?;
        Ok(())
    }

    async fn watch_sessions(
        &self,
        user_id: i32,
    ) -> Result<EventStream<pb::SessionEvent>, BridgeError> {
        let stream = self
            .client()
            .watch_sessions(pb::WatchSessionsRequest { user_id })
            .await?
            .into_inner();
        Ok(stream.map(|item| item.map_err(BridgeError::from)).boxed())
    }

    async fn watch_op_mode(
        &self,
        op: i32,
        package_name: Option<String>,
    ) -> Result<EventStream<pb::OpChanged>, BridgeError> {
        let stream = self
            .client()
            .watch_op_mode(pb::WatchOpModeRequest {
                op,
                package_name: package_name.unwrap_or_default(),
            })
            .await?
            .into_inner();
        Ok(stream.map(|item| item.map_err(BridgeError::from)).boxed())
    }

    async fn watch_alive(&self) -> Result<EventStream<()>, BridgeError> {
        let stream = self
            .client()
            .watch_alive(pb::WatchAliveRequest {})
            .await?
            .into_inner();
        Ok(stream
            .map(|item| item.map(|_| ()).map_err(BridgeError::from))
            .boxed())
    }

    async fn shutdown(&self) -> Result<(), BridgeError> {
        self.client().shutdown(pb::ShutdownRequest {}).await?;
        Ok(())
    }
}
