use std::{path::Path, time::Duration};

use pi_proto::{
    pi::v1::{
        self as pb, privileged_service_server::PrivilegedService, session_event::Payload,
    },
    status, PROTOCOL_VERSION,
};
use pi_util::now_millis;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::{
    appops::{mode_name, parse_mode, parse_ops, OP_NONE},
    hub::{stopped, EventHub},
    pm::{is_success, parse_packages, parse_session_id, parse_users, user_of_uid},
    sessions::SessionTable,
    shell::{shell_failure_message, shell_failure_status, ShellFailure, Tool},
};

const BASE_SPLIT_NAME: &str = "base.apk";

pub(crate) struct Svc {
    pm: Tool,
    appops: Tool,
    hub: EventHub,
    sessions: SessionTable,
    stop: watch::Sender<bool>,
    heartbeat_interval: Duration,
}

impl Svc {
    pub(crate) fn new(stop: watch::Sender<bool>, heartbeat_interval: Duration) -> Self {
        Self::with_tools(Tool::pm(), Tool::appops(), stop, heartbeat_interval)
    }

    pub(crate) fn with_tools(
        pm: Tool,
        appops: Tool,
        stop: watch::Sender<bool>,
        heartbeat_interval: Duration,
    ) -> Self {
        let hub = EventHub::new(stop.subscribe());
        Self {
            pm,
            appops,
            hub,
            sessions: SessionTable::default(),
            stop,
            heartbeat_interval,
        }
    }

    async fn list_packages(
        &self,
        user_id: i32,
        filter: Option<&str>,
    ) -> Result<Vec<pb::PackageInfo>, ShellFailure> {
        let user = user_id.to_string();
        let mut args = vec![
            "list",
            "packages",
            "-U",
            "-i",
            "--show-versioncode",
            "--user",
            user.as_str(),
        ];
        if let Some(filter) = filter {
            args.push(filter);
        }
        let output = self.pm.run(&args).await?;
        Ok(parse_packages(&output))
    }

    async fn find_package(
        &self,
        package_name: &str,
        user_id: i32,
    ) -> Result<Option<pb::PackageInfo>, ShellFailure> {
        let packages = self.list_packages(user_id, Some(package_name)).await?;
        Ok(packages
            .into_iter()
            .find(|pkg| pkg.package_name == package_name))
    }

    fn publish(&self, user_id: i32, payload: Payload) {
        self.sessions.apply(&payload);
        self.hub.publish_session(user_id, payload);
    }

    #[allow(clippy::result_large_err)]
    async fn change_permission(
        &self,
        verb: &str,
        req: pb::RuntimePermissionRequest,
    ) -> Result<(), Status> {
        require_package(&req.package_name)?;
        if req.permission.trim().is_empty() {
            return Err(Status::invalid_argument("permission is required"));
        }
        let user = req.user_id.to_string();
        let args = [
            verb,
            "--user",
            user.as_str(),
            req.package_name.as_str(),
            req.permission.as_str(),
        ];
        self.pm.run(&args).await.map_err(shell_failure_status)?;
        info!(
            "{verb} {} for {} (user {})",
            req.permission, req.package_name, req.user_id
        );
        Ok(())
    }

    fn progress(&self, user_id: i32, session_id: i32, progress: f32) {
        self.publish(
            user_id,
            Payload::ProgressChanged(pb::SessionProgressChanged {
                session_id,
                progress,
            }),
        );
    }

    fn finish(
        &self,
        user_id: i32,
        session_id: i32,
        result: Result<(), String>,
    ) -> pb::InstallResponse {
        let success = result.is_ok();
        if success {
            self.progress(user_id, session_id, 1.0);
        }
        self.publish(
            user_id,
            Payload::ActiveChanged(pb::SessionActiveChanged {
                session_id,
                active: false,
            }),
        );
        self.publish(
            user_id,
            Payload::Finished(pb::SessionFinished {
                session_id,
                success,
            }),
        );
        match result {
            Ok(()) => {
                info!("install session {session_id} committed");
                pb::InstallResponse {
                    status: status::SUCCESS,
                    message: "Success".into(),
                }
            }
            Err(message) => {
                warn!("install session {session_id} failed: {message}");
                pb::InstallResponse {
                    status: status::FAILURE,
                    message,
                }
            }
        }
    }

    async fn abandon(&self, session_id: i32) {
        let sid = session_id.to_string();
        if let Err(err) = self.pm.run(&["install-abandon", sid.as_str()]).await {
            debug!(
                "abandoning session {session_id}: {}",
                shell_failure_message(&err)
            );
        }
    }

    async fn run_install(
        &self,
        archive: pb::ArchiveInfo,
        installer: String,
        user_id: i32,
    ) -> Result<pb::InstallResponse, Status> {
        let mut args = vec![
            "install-create".to_string(),
            "-r".into(),
            "-t".into(),
            "--user".into(),
            user_id.to_string(),
        ];
        if !installer.trim().is_empty() {
            args.push("-i".into());
            args.push(installer.clone());
        }
        if !archive.originating.is_empty() {
            match self.find_package(&archive.originating, user_id).await {
                Ok(Some(pkg)) => {
                    args.push("--originating-uid".into());
                    args.push(pkg.uid.to_string());
                }
                Ok(None) => warn!("originating package {} not installed", archive.originating),
                Err(err) => warn!(
                    "resolving originating package {}: {}",
                    archive.originating,
                    shell_failure_message(&err)
                ),
            }
        }

        let created = match self.pm.run(&args).await {
            Ok(output) => output,
            Err(err @ ShellFailure::NotFound(_)) => return Err(shell_failure_status(err)),
            Err(err) => {
                return Ok(pb::InstallResponse {
                    status: status::FAILURE,
                    message: shell_failure_message(&err),
                })
            }
        };
        let Some(session_id) = parse_session_id(&created) else {
            return Ok(pb::InstallResponse {
                status: status::FAILURE,
                message: format!("unexpected install-create output: {}", created.trim()),
            });
        };
        info!(
            "install session {session_id} for {} (user {user_id})",
            archive.package_name
        );
        self.sessions
            .open(session_id, user_id, installer.trim(), &archive.package_name);
        self.publish(
            user_id,
            Payload::Created(pb::SessionCreated { session_id }),
        );
        self.publish(
            user_id,
            Payload::ActiveChanged(pb::SessionActiveChanged {
                session_id,
                active: true,
            }),
        );
        self.progress(user_id, session_id, 0.0);

        let sid = session_id.to_string();
        let write = [
            "install-write",
            sid.as_str(),
            BASE_SPLIT_NAME,
            archive.path.as_str(),
        ];
        if let Err(err) = self.pm.run(&write).await {
            self.abandon(session_id).await;
            return Ok(self.finish(user_id, session_id, Err(shell_failure_message(&err))));
        }
        self.progress(user_id, session_id, 0.8);

        let result = match self.pm.run(&["install-commit", sid.as_str()]).await {
            Ok(output) if is_success(&output) => Ok(()),
            Ok(output) => Err(output.trim().to_string()),
            Err(err) => Err(shell_failure_message(&err)),
        };
        Ok(self.finish(user_id, session_id, result))
    }
}

pub(crate) fn identity() -> pb::Identity {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() } as i32;
    pb::Identity {
        uid,
        pid: std::process::id() as i32,
        version: PROTOCOL_VERSION,
        se_linux_context: std::fs::read("/proc/self/attr/current")
            .map(|raw| clean_context(&raw))
            .unwrap_or_default(),
    }
}

fn clean_context(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[allow(clippy::result_large_err)]
fn require_package(package_name: &str) -> Result<(), Status> {
    if package_name.trim().is_empty() {
        Err(Status::invalid_argument("package_name is required"))
    } else {
        Ok(())
    }
}

#[tonic::async_trait]
impl PrivilegedService for Svc {
    async fn get_identity(
        &self,
        _request: Request<pb::GetIdentityRequest>,
    ) -> Result<Response<pb::GetIdentityResponse>, Status> {
        Ok(Response::new(pb::GetIdentityResponse {
            identity: Some(identity()),
        }))
    }

    async fn install(
        &self,
        request: Request<pb::InstallRequest>,
    ) -> Result<Response<pb::InstallResponse>, Status> {
        let req = request.into_inner();
        let archive = req
            .archive
            .ok_or_else(|| Status::invalid_argument("archive is required"))?;
        require_package(&archive.package_name)?;
        if archive.path.trim().is_empty() {
            return Err(Status::invalid_argument("archive path is required"));
        }
        if !Path::new(&archive.path).exists() {
            return Err(Status::not_found(format!("archive not found: {}", archive.path)));
        }
        let resp = self
            .run_install(archive, req.installer_package_name, req.user_id)
            .await?;
        Ok(Response::new(resp))
    }

    async fn uninstall(
        &self,
        request: Request<pb::UninstallRequest>,
    ) -> Result<Response<pb::UninstallResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let user = req.user_id.to_string();
        let args = ["uninstall", "--user", user.as_str(), req.package_name.as_str()];
        let resp = match self.pm.run(&args).await {
            Ok(output) if is_success(&output) => pb::UninstallResponse {
                status: status::SUCCESS,
                message: "Success".into(),
            },
            Ok(output) => pb::UninstallResponse {
                status: status::FAILURE,
                message: output.trim().to_string(),
            },
            Err(err @ ShellFailure::NotFound(_)) => return Err(shell_failure_status(err)),
            Err(err) => pb::UninstallResponse {
                status: status::FAILURE,
                message: shell_failure_message(&err),
            },
        };
        info!(
            "uninstall {} (user {}): {}",
            req.package_name, req.user_id, resp.status
        );
        Ok(Response::new(resp))
    }

    async fn get_package_info(
        &self,
        request: Request<pb::GetPackageInfoRequest>,
    ) -> Result<Response<pb::GetPackageInfoResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let package = self
            .find_package(&req.package_name, req.user_id)
            .await
            .map_err(shell_failure_status)?
            .ok_or_else(|| {
                Status::not_found(format!("package not installed: {}", req.package_name))
            })?;
        Ok(Response::new(pb::GetPackageInfoResponse {
            package: Some(package),
        }))
    }

    async fn list_installed_packages(
        &self,
        request: Request<pb::ListInstalledPackagesRequest>,
    ) -> Result<Response<pb::ListInstalledPackagesResponse>, Status> {
        let req = request.into_inner();
        let packages = self
            .list_packages(req.user_id, None)
            .await
            .map_err(shell_failure_status)?;
        Ok(Response::new(pb::ListInstalledPackagesResponse { packages }))
    }

    async fn get_packages_for_uid(
        &self,
        request: Request<pb::GetPackagesForUidRequest>,
    ) -> Result<Response<pb::GetPackagesForUidResponse>, Status> {
        let uid = request.into_inner().uid;
        let package_names = self
            .list_packages(user_of_uid(uid), None)
            .await
            .map_err(shell_failure_status)?
            .into_iter()
            .filter(|pkg| pkg.uid == uid)
            .map(|pkg| pkg.package_name)
            .collect();
        Ok(Response::new(pb::GetPackagesForUidResponse { package_names }))
    }

    async fn get_package_uid(
        &self,
        request: Request<pb::GetPackageUidRequest>,
    ) -> Result<Response<pb::GetPackageUidResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let package = self
            .find_package(&req.package_name, req.user_id)
            .await
            .map_err(shell_failure_status)?
            .ok_or_else(|| {
                Status::not_found(format!("package not installed: {}", req.package_name))
            })?;
        Ok(Response::new(pb::GetPackageUidResponse { uid: package.uid }))
    }

    async fn get_session_info(
        &self,
        request: Request<pb::GetSessionInfoRequest>,
    ) -> Result<Response<pb::GetSessionInfoResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Status::not_found(format!("no such session: {session_id}")))?;
        Ok(Response::new(pb::GetSessionInfoResponse {
            session: Some(session),
        }))
    }

    async fn list_sessions(
        &self,
        request: Request<pb::ListSessionsRequest>,
    ) -> Result<Response<pb::ListSessionsResponse>, Status> {
        let user_id = request.into_inner().user_id;
        Ok(Response::new(pb::ListSessionsResponse {
            sessions: self.sessions.list(user_id),
        }))
    }

    async fn grant_runtime_permission(
        &self,
        request: Request<pb::RuntimePermissionRequest>,
    ) -> Result<Response<pb::RuntimePermissionResponse>, Status> {
        self.change_permission("grant", request.into_inner()).await?;
        Ok(Response::new(pb::RuntimePermissionResponse {}))
    }

    async fn revoke_runtime_permission(
        &self,
        request: Request<pb::RuntimePermissionRequest>,
    ) -> Result<Response<pb::RuntimePermissionResponse>, Status> {
        self.change_permission("revoke", request.into_inner()).await?;
        Ok(Response::new(pb::RuntimePermissionResponse {}))
    }

    async fn list_users(
        &self,
        request: Request<pb::ListUsersRequest>,
    ) -> Result<Response<pb::ListUsersResponse>, Status> {
        let req = request.into_inner();
        let output = self
            .pm
            .run(&["list", "users"])
            .await
            .map_err(shell_failure_status)?;
        let users = parse_users(&output)
            .into_iter()
            .filter(|(_, markers)| {
                !(req.exclude_partial && markers.partial
                    || req.exclude_dying && markers.dying
                    || req.exclude_pre_created && markers.pre_created)
            })
            .map(|(user, _)| user)
            .collect();
        Ok(Response::new(pb::ListUsersResponse { users }))
    }

    async fn get_user_info(
        &self,
        request: Request<pb::GetUserInfoRequest>,
    ) -> Result<Response<pb::GetUserInfoResponse>, Status> {
        let user_id = request.into_inner().user_id;
        let output = self
            .pm
            .run(&["list", "users"])
            .await
            .map_err(shell_failure_status)?;
        let user = parse_users(&output)
            .into_iter()
            .map(|(user, _)| user)
            .find(|user| user.id == user_id)
            .ok_or_else(|| Status::not_found(format!("no such user: {user_id}")))?;
        Ok(Response::new(pb::GetUserInfoResponse { user: Some(user) }))
    }

    async fn check_operation(
        &self,
        request: Request<pb::CheckOperationRequest>,
    ) -> Result<Response<pb::CheckOperationResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let user = user_of_uid(req.uid).to_string();
        let op = req.code.to_string();
        let args = [
            "get",
            "--user",
            user.as_str(),
            req.package_name.as_str(),
            op.as_str(),
        ];
        let output = self
            .appops
            .run(&args)
            .await
            .map_err(shell_failure_status)?;
        Ok(Response::new(pb::CheckOperationResponse {
            mode: parse_mode(&output),
        }))
    }

    async fn set_mode(
        &self,
        request: Request<pb::SetModeRequest>,
    ) -> Result<Response<pb::SetModeResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let mode = mode_name(req.mode)
            .ok_or_else(|| Status::invalid_argument(format!("unknown mode: {}", req.mode)))?;
        let user = user_of_uid(req.uid).to_string();
        let op = req.code.to_string();
        let args = [
            "set",
            "--user",
            user.as_str(),
            req.package_name.as_str(),
            op.as_str(),
            mode,
        ];
        self.appops
            .run(&args)
            .await
            .map_err(shell_failure_status)?;
        info!("op {} for {} set to {mode}", req.code, req.package_name);
        self.hub.publish_op(pb::OpChanged {
            op: req.code,
            uid: req.uid,
            package_name: req.package_name,
        });
        Ok(Response::new(pb::SetModeResponse {}))
    }

    async fn get_ops_for_package(
        &self,
        request: Request<pb::GetOpsForPackageRequest>,
    ) -> Result<Response<pb::GetOpsForPackageResponse>, Status> {
        let req = request.into_inner();
        require_package(&req.package_name)?;
        let user = user_of_uid(req.uid).to_string();
        let base = ["get", "--user", user.as_str(), req.package_name.as_str()];
        if req.ops.is_empty() {
            let output = self
                .appops
                .run(&base)
                .await
                .map_err(shell_failure_status)?;
            let ops = parse_ops(&output)
                .into_iter()
                .map(|(name, mode)| pb::OpEntry {
                    op: OP_NONE,
                    name,
                    mode,
                })
                .collect();
            return Ok(Response::new(pb::GetOpsForPackageResponse { ops }));
        }

        let mut ops = Vec::with_capacity(req.ops.len());
        for op in req.ops {
            let code = op.to_string();
            let output = self
                .appops
                .run(&[&base[..], &[code.as_str()]].concat())
                .await
                .map_err(shell_failure_status)?;
            let name = parse_ops(&output)
                .into_iter()
                .next()
                .map(|(name, _)| name)
                .unwrap_or(code);
            ops.push(pb::OpEntry {
                op,
                name,
                mode: parse_mode(&output),
            });
        }
        Ok(Response::new(pb::GetOpsForPackageResponse { ops }))
    }

    async fn set_uid_mode(
        &self,
        request: Request<pb::SetUidModeRequest>,
    ) -> Result<Response<pb::SetUidModeResponse>, Status> {
        let req = request.into_inner();
        let mode = mode_name(req.mode)
            .ok_or_else(|| Status::invalid_argument(format!("unknown mode: {}", req.mode)))?;
        if req.uid < 0 {
            return Err(Status::invalid_argument(format!("invalid uid: {}", req.uid)));
        }
        let uid = req.uid.to_string();
        let op = req.code.to_string();
        self.appops
            .run(&["set", "--uid", uid.as_str(), op.as_str(), mode])
            .await
            .map_err(shell_failure_status)?;
        info!("op {} for uid {} set to {mode}", req.code, req.uid);
        self.hub.publish_op(pb::OpChanged {
            op: req.code,
            uid: req.uid,
            package_name: String::new(),
        });
        Ok(Response::new(pb::SetUidModeResponse {}))
    }

    async fn reset_all_modes(
        &self,
        request: Request<pb::ResetAllModesRequest>,
    ) -> Result<Response<pb::ResetAllModesResponse>, Status> {
        let req = request.into_inner();
        let user = req.user_id.to_string();
        let mut args = vec!["reset", "--user", user.as_str()];
        if !req.package_name.trim().is_empty() {
            args.push(req.package_name.as_str());
        }
        self.appops
            .run(&args)
            .await
            .map_err(shell_failure_status)?;
        info!(
            "app-op modes reset for user {} ({})",
            req.user_id,
            if req.package_name.is_empty() {
                "all packages"
            } else {
                req.package_name.as_str()
            }
        );
        Ok(Response::new(pb::ResetAllModesResponse {}))
    }

    type WatchSessionsStream = ReceiverStream<Result<pb::SessionEvent, Status>>;

    async fn watch_sessions(
        &self,
        request: Request<pb::WatchSessionsRequest>,
    ) -> Result<Response<Self::WatchSessionsStream>, Status> {
        let user_id = request.into_inner().user_id;
        Ok(Response::new(self.hub.watch_sessions(user_id)))
    }

    type WatchOpModeStream = ReceiverStream<Result<pb::OpChanged, Status>>;

    async fn watch_op_mode(
        &self,
        request: Request<pb::WatchOpModeRequest>,
    ) -> Result<Response<Self::WatchOpModeStream>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.hub.watch_op_mode(req.op, req.package_name)))
    }

    type WatchAliveStream = ReceiverStream<Result<pb::Heartbeat, Status>>;

    async fn watch_alive(
        &self,
        _request: Request<pb::WatchAliveRequest>,
    ) -> Result<Response<Self::WatchAliveStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let interval = self.heartbeat_interval;
        let stop = stopped(self.stop.subscribe());
        tokio::spawn(async move {
            tokio::pin!(stop);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        let beat = pb::Heartbeat {
                            at_unix_millis: now_millis(),
                        };
                        if tx.send(Ok(beat)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn shutdown(
        &self,
        _request: Request<pb::ShutdownRequest>,
    ) -> Result<Response<pb::ShutdownResponse>, Status> {
        info!("shutdown requested");
        self.stop.send_replace(true);
        Ok(Response::new(pb::ShutdownResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use tokio_stream::StreamExt;

    use super::*;

    const FAKE_PM: &str = r#"
case "$1" in
  install-create) echo "Success: created install session [77]" ;;
  install-write) echo "Success: streamed 4 bytes" ;;
  install-commit) echo "Success" ;;
  install-abandon) echo "Success" ;;
  uninstall) echo "Failure [DELETE_FAILED_INTERNAL_ERROR]" ;;
  grant|revoke)
    if [ "$5" = "android.permission.BOGUS" ]; then
      echo "Exception occurred while executing '$1':" >&2
      exit 255
    fi
    echo "$@" >> "$(dirname "$0")/pm.log"
    ;;
  list)
    if [ "$2" = "users" ]; then
      printf 'Users:\n\tUserInfo{0:Owner:c13} running\n\tUserInfo{10:Work:1030}\n'
    else
      echo "package:com.android.vending versionCode:83 installer=null uid:10042"
      echo "package:com.example.app versionCode:2 installer=com.android.vending uid:10123"
    fi
    ;;
  *) echo "Unknown command" >&2; exit 1 ;;
esac
"#;

    const FAKE_APPOPS: &str = r#"
case "$1" in
  get)
    if [ -n "$5" ]; then
      echo "OP_$5: ignore; time=+1m ago"
    else
      printf 'COARSE_LOCATION: allow; time=+2d ago\nREQUEST_INSTALL_PACKAGES: deny\n'
    fi
    ;;
  set|reset) echo "$@" >> "$(dirname "$0")/appops.log" ;;
  *) exit 1 ;;
esac
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        apk: PathBuf,
        svc: Svc,
        stop: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        build_fixture(None)
    }

    fn fixture_with_appops() -> Fixture {
        build_fixture(Some(FAKE_APPOPS))
    }

    fn build_fixture(appops: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pm.sh");
        fs::write(&script, FAKE_PM).unwrap();
        let appops = match appops {
            Some(body) => {
                let path = dir.path().join("appops.sh");
                fs::write(&path, body).unwrap();
                Tool::script(path.display().to_string())
            }
            None => Tool::new("/nonexistent/appops"),
        };
        let apk = dir.path().join("base.apk");
        fs::write(&apk, b"PK\x03\x04").unwrap();
        let (stop_tx, stop) = watch::channel(false);
        let svc = Svc::with_tools(
            Tool::script(script.display().to_string()),
            appops,
            stop_tx,
            Duration::from_millis(20),
        );
        Fixture {
            dir,
            apk,
            svc,
            stop,
        }
    }

    impl Fixture {
        fn log(&self, name: &str) -> Vec<String> {
            fs::read_to_string(self.dir.path().join(name))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn install_request(path: &Path, package_name: &str) -> Request<pb::InstallRequest> {
        Request::new(pb::InstallRequest {
            archive: Some(pb::ArchiveInfo {
                path: path.display().to_string(),
                package_name: package_name.into(),
                originating: "com.android.vending".into(),
            }),
            installer_package_name: "io.privinstall.app".into(),
            user_id: 0,
        })
    }

    #[test]
    fn identity_reports_this_process() {
        let id = identity();
        assert_eq!(id.pid, std::process::id() as i32);
        assert_eq!(id.uid, unsafe { libc::getuid() } as i32);
        assert_eq!(id.version, PROTOCOL_VERSION);
    }

    #[test]
    fn context_loses_trailing_nul() {
        assert_eq!(clean_context(b"u:r:su:s0\0"), "u:r:su:s0");
        assert_eq!(clean_context(b"unconfined\n"), "unconfined");
    }

    #[tokio::test]
    async fn install_emits_the_full_session_lifecycle() {
        let fx = fixture();
        let mut events = fx
            .svc
            .watch_sessions(Request::new(pb::WatchSessionsRequest { user_id: 0 }))
            .await
            .unwrap()
            .into_inner();

        let resp = fx
            .svc
            .install(install_request(&fx.apk, "com.example.app"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status, status::SUCCESS, "{}", resp.message);

        let mut payloads = Vec::new();
        for _ in 0..7 {
            payloads.push(events.next().await.unwrap().unwrap().payload.unwrap());
        }
        assert_eq!(
            payloads,
            vec![
                Payload::Created(pb::SessionCreated { session_id: 77 }),
                Payload::ActiveChanged(pb::SessionActiveChanged {
                    session_id: 77,
                    active: true
                }),
                Payload::ProgressChanged(pb::SessionProgressChanged {
                    session_id: 77,
                    progress: 0.0
                }),
                Payload::ProgressChanged(pb::SessionProgressChanged {
                    session_id: 77,
                    progress: 0.8
                }),
                Payload::ProgressChanged(pb::SessionProgressChanged {
                    session_id: 77,
                    progress: 1.0
                }),
                Payload::ActiveChanged(pb::SessionActiveChanged {
                    session_id: 77,
                    active: false
                }),
                Payload::Finished(pb::SessionFinished {
                    session_id: 77,
                    success: true
                }),
            ]
        );
    }

    #[tokio::test]
    async fn install_validates_the_archive() {
        let fx = fixture();
        let err = fx
            .svc
            .install(install_request(&fx.apk, ""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = fx
            .svc
            .install(install_request(Path::new("/nonexistent/a.apk"), "com.x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let err = fx
            .svc
            .install(Request::new(pb::InstallRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn uninstall_failure_is_a_status_not_an_error() {
        let fx = fixture();
        let resp = fx
            .svc
            .uninstall(Request::new(pb::UninstallRequest {
                package_name: "com.example.app".into(),
                user_id: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status, status::FAILURE);
        assert!(resp.message.contains("DELETE_FAILED"));
    }

    #[tokio::test]
    async fn package_queries_use_pm_listing() {
        let fx = fixture();
        let info = fx
            .svc
            .get_package_info(Request::new(pb::GetPackageInfoRequest {
                package_name: "com.example.app".into(),
                flags: 0,
                user_id: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .package
            .unwrap();
        assert_eq!(info.uid, 10123);
        assert_eq!(info.installer, "com.android.vending");

        let names = fx
            .svc
            .get_packages_for_uid(Request::new(pb::GetPackagesForUidRequest { uid: 10042 }))
            .await
            .unwrap()
            .into_inner()
            .package_names;
        assert_eq!(names, vec!["com.android.vending"]);

        let err = fx
            .svc
            .get_package_info(Request::new(pb::GetPackageInfoRequest {
                package_name: "com.absent".into(),
                flags: 0,
                user_id: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn users_are_listed_and_looked_up() {
        let fx = fixture();
        let users = fx
            .svc
            .list_users(Request::new(pb::ListUsersRequest::default()))
            .await
            .unwrap()
            .into_inner()
            .users;
        assert_eq!(users.len(), 2);
        let work = fx
            .svc
            .get_user_info(Request::new(pb::GetUserInfoRequest { user_id: 10 }))
            .await
            .unwrap()
            .into_inner()
            .user
            .unwrap();
        assert_eq!(work.name, "Work");
    }

    #[tokio::test]
    async fn missing_appops_is_a_precondition_failure() {
        let fx = fixture();
        let err = fx
            .svc
            .check_operation(Request::new(pb::CheckOperationRequest {
                code: 66,
                uid: 10123,
                package_name: "com.example.app".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        let err = fx
            .svc
            .set_mode(Request::new(pb::SetModeRequest {
                code: 66,
                uid: 10123,
                package_name: "com.example.app".into(),
                mode: 42,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn installed_sessions_can_be_queried() {
        let fx = fixture();
        let resp = fx
            .svc
            .install(install_request(&fx.apk, "com.example.app"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status, status::SUCCESS, "{}", resp.message);

        let session = fx
            .svc
            .get_session_info(Request::new(pb::GetSessionInfoRequest { session_id: 77 }))
            .await
            .unwrap()
            .into_inner()
            .session
            .unwrap();
        assert_eq!(session.app_package_name, "com.example.app");
        assert_eq!(session.installer_package_name, "io.privinstall.app");
        assert!(session.committed);
        assert!(!session.active);
        assert_eq!(session.progress, 1.0);

        let listed = |user_id| {
            let svc = &fx.svc;
            async move {
                svc.list_sessions(Request::new(pb::ListSessionsRequest { user_id }))
                    .await
                    .unwrap()
                    .into_inner()
                    .sessions
            }
        };
        assert_eq!(listed(-1).await, vec![session.clone()]);
        assert_eq!(listed(0).await.len(), 1);
        assert!(listed(10).await.is_empty());

        let err = fx
            .svc
            .get_session_info(Request::new(pb::GetSessionInfoRequest { session_id: 78 }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn package_uid_comes_from_the_package_list() {
        let fx = fixture();
        let uid = |package_name: &str| {
            fx.svc.get_package_uid(Request::new(pb::GetPackageUidRequest {
                package_name: package_name.into(),
                flags: 0,
                user_id: 0,
            }))
        };
        assert_eq!(uid("com.example.app").await.unwrap().into_inner().uid, 10123);
        assert_eq!(
            uid("com.absent").await.unwrap_err().code(),
            tonic::Code::NotFound
        );
        assert_eq!(uid(" ").await.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn runtime_permissions_run_pm_grant_and_revoke() {
        let fx = fixture();
        let request = |permission: &str| {
            Request::new(pb::RuntimePermissionRequest {
                package_name: "com.example.app".into(),
                permission: permission.into(),
                user_id: 10,
            })
        };
        fx.svc
            .grant_runtime_permission(request("android.permission.CAMERA"))
            .await
            .unwrap();
        fx.svc
            .revoke_runtime_permission(request("android.permission.CAMERA"))
            .await
            .unwrap();
        assert_eq!(
            fx.log("pm.log"),
            vec![
                "grant --user 10 com.example.app android.permission.CAMERA",
                "revoke --user 10 com.example.app android.permission.CAMERA",
            ]
        );

        let err = fx
            .svc
            .grant_runtime_permission(request("android.permission.BOGUS"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        let err = fx
            .svc
            .revoke_runtime_permission(request(""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(fx.log("pm.log").len(), 2);
    }

    #[tokio::test]
    async fn ops_for_package_lists_or_queries_ops() {
        let fx = fixture_with_appops();
        let ops = |ops: Vec<i32>| {
            fx.svc.get_ops_for_package(Request::new(pb::GetOpsForPackageRequest {
                uid: 10123,
                package_name: "com.example.app".into(),
                ops,
            }))
        };

        let all = ops(vec![]).await.unwrap().into_inner().ops;
        assert_eq!(
            all,
            vec![
                pb::OpEntry {
                    op: OP_NONE,
                    name: "COARSE_LOCATION".into(),
                    mode: 0,
                },
                pb::OpEntry {
                    op: OP_NONE,
                    name: "REQUEST_INSTALL_PACKAGES".into(),
                    mode: 2,
                },
            ]
        );

        let picked = ops(vec![66]).await.unwrap().into_inner().ops;
        assert_eq!(
            picked,
            vec![pb::OpEntry {
                op: 66,
                name: "OP_66".into(),
                mode: 1,
            }]
        );
    }

    #[tokio::test]
    async fn uid_mode_and_reset_drive_appops() {
        let fx = fixture_with_appops();
        let mut changes = fx
            .svc
            .watch_op_mode(Request::new(pb::WatchOpModeRequest {
                op: 66,
                package_name: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        fx.svc
            .set_uid_mode(Request::new(pb::SetUidModeRequest {
                code: 66,
                uid: 10123,
                mode: 1,
            }))
            .await
            .unwrap();
        let change = changes.next().await.unwrap().unwrap();
        assert_eq!((change.op, change.uid), (66, 10123));
        assert!(change.package_name.is_empty());

        for package_name in ["com.example.app", ""] {
            fx.svc
                .reset_all_modes(Request::new(pb::ResetAllModesRequest {
                    user_id: 0,
                    package_name: package_name.into(),
                }))
                .await
                .unwrap();
        }
        assert_eq!(
            fx.log("appops.log"),
            vec![
                "set --uid 10123 66 ignore",
                "reset --user 0 com.example.app",
                "reset --user 0",
            ]
        );

        let err = fx
            .svc
            .set_uid_mode(Request::new(pb::SetUidModeRequest {
                code: 66,
                uid: 10123,
                mode: 42,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn shutdown_ends_heartbeats() {
        let mut fx = fixture();
        let mut beats = fx
            .svc
            .watch_alive(Request::new(pb::WatchAliveRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(beats.next().await.unwrap().unwrap().at_unix_millis > 0);

        fx.svc
            .shutdown(Request::new(pb::ShutdownRequest {}))
            .await
            .unwrap();
        assert!(*fx.stop.borrow_and_update());
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while beats.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
