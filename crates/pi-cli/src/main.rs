use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use pi_bridge::{
    ArchiveInfo, BridgeConfig, PreferenceStore, Provider, ProviderChoice, ServiceManager,
    ServiceState, SessionCallback, UserFilter,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "pi-cli", version, about = "Privileged installer bridge CLI")]
struct Cli {
    /// Provider to use instead of the stored preference
    #[arg(long, global = true)]
    provider: Option<ProviderChoice>,

    /// Android user to act for
    #[arg(long, global = true, default_value_t = 0)]
    user: i32,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Connect and report the channel state
    Status {
        /// Keep printing state changes until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Stored provider preference
    Provider {
        #[command(subcommand)]
        cmd: ProviderCmd,
    },
    /// Install an APK through the privileged channel
    Install {
        apk: PathBuf,
        #[arg(long)]
        package: String,
        #[arg(long, default_value = "")]
        originating: String,
    },
    /// Uninstall a package
    Uninstall { package: String },
    /// List users on the device
    Users {
        #[arg(long)]
        exclude_partial: bool,
        #[arg(long)]
        exclude_dying: bool,
        #[arg(long)]
        exclude_pre_created: bool,
    },
    /// List installed packages
    Packages,
    /// List install sessions of the user
    Sessions {
        /// Stream session events until interrupted instead
        #[arg(long)]
        watch: bool,
    },
    /// Grant a runtime permission
    Grant { package: String, permission: String },
    /// Revoke a runtime permission
    Revoke { package: String, permission: String },
    /// Show the app-op modes of a package
    Ops {
        package: String,
        /// Op codes to query; all recorded ops when omitted
        #[arg(long = "op")]
        ops: Vec<i32>,
    },
    /// Reset app-op modes of the user, or of one package
    ResetOps { package: Option<String> },
}

#[derive(Subcommand)]
enum ProviderCmd {
    /// Show the stored provider
    Get,
    /// Store the provider to use (none, broker, superuser)
    Set { choice: ProviderChoice },
}

struct PrintSessions;

impl SessionCallback for PrintSessions {
    fn on_created(&self, session_id: i32) {
        println!("session {session_id}: created");
    }

    fn on_badging_changed(&self, session_id: i32) {
        println!("session {session_id}: badging changed");
    }

    fn on_active_changed(&self, session_id: i32, active: bool) {
        println!("session {session_id}: active={active}");
    }

    fn on_progress_changed(&self, session_id: i32, progress: f32) {
        println!("session {session_id}: {:.0}%", progress * 100.0);
    }

    fn on_finished(&self, session_id: i32, success: bool) {
        println!("session {session_id}: finished success={success}");
    }
}

fn describe(state: &ServiceState) -> String {
    match state {
        ServiceState::Pending => "pending".into(),
        ServiceState::Success(provider) => format!(
            "connected uid={} pid={} version={} context={}",
            provider.uid(),
            provider.pid(),
            provider.version(),
            provider.se_linux_context()
        ),
        ServiceState::Failure(err) => format!("failed: {err}"),
    }
}

async fn connect(
    manager: &ServiceManager,
    choice: ProviderChoice,
) -> Result<Arc<dyn Provider>, Box<dyn std::error::Error>> {
    if choice == ProviderChoice::None {
        return Err("no provider selected; run `pi-cli provider set <broker|superuser>`".into());
    }
    let state = manager.connect(choice).await;
    debug!("{choice}: {}", describe(&state));
    Ok(state.require()?)
}

async fn run(
    cli: Cli,
    manager: &ServiceManager,
    prefs: &PreferenceStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let choice = cli.provider.unwrap_or(prefs.current().provider);
    let user = cli.user;

    match cli.cmd {
        Cmd::Provider { cmd } => match cmd {
            ProviderCmd::Get => println!("{}", prefs.current().provider),
            ProviderCmd::Set { choice } => {
                prefs.set_provider(choice)?;
                println!("provider={choice} ({})", prefs.path().display());
            }
        },
        Cmd::Status { watch } => {
            let state = manager.connect(choice).await;
            println!("{choice}: {}", describe(&state));
            if watch {
                let mut states = manager.observe_state();
                // The first item repeats the state printed above.
                let _ = states.next().await;
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        next = states.next() => match next {
                            Some(state) => println!("{choice}: {}", describe(&state)),
                            None => break,
                        },
                    }
                }
            }
        }
        Cmd::Install {
            apk,
            package,
            originating,
        } => {
            let provider = connect(manager, choice).await?;
            let pm = provider.package_manager()?;
            let listener: Arc<dyn SessionCallback> = Arc::new(PrintSessions);
            pm.register_session_callback(listener.clone(), user).await?;
            let installer = prefs.current().executor;
            let archive = ArchiveInfo::new(apk, package, originating);
            let status = pm.install(archive, &installer, user).await;
            pm.unregister_session_callback(&listener);
            let status = status?;
            println!("install status={status}");
            if status != 0 {
                return Err("install failed".into());
            }
        }
        Cmd::Uninstall { package } => {
            let provider = connect(manager, choice).await?;
            let status = provider
                .package_manager()?
                .uninstall(&package, user)
                .await?;
            println!("uninstall status={status}");
        }
        Cmd::Users {
            exclude_partial,
            exclude_dying,
            exclude_pre_created,
        } => {
            let provider = connect(manager, choice).await?;
            let filter = UserFilter {
                exclude_partial,
                exclude_dying,
                exclude_pre_created,
            };
            for u in provider.user_manager()?.users(filter).await? {
                println!("{}\t{}\tflags={:#x}\trunning={}", u.id, u.name, u.flags, u.running);
            }
        }
        Cmd::Packages => {
            let provider = connect(manager, choice).await?;
            for p in provider
                .package_manager()?
                .installed_packages(0, user)
                .await?
            {
                println!(
                    "{}\tuid={}\tversion={}\tinstaller={}",
                    p.package_name, p.uid, p.version_code, p.installer
                );
            }
        }
        Cmd::Sessions { watch: false } => {
            let provider = connect(manager, choice).await?;
            for s in provider.package_manager()?.all_sessions(user).await? {
                println!(
                    "{}\t{}\tinstaller={}\tactive={}\tcommitted={}\tprogress={:.2}",
                    s.session_id,
                    s.app_package_name,
                    s.installer_package_name,
                    s.active,
                    s.committed,
                    s.progress
                );
            }
        }
        Cmd::Grant {
            package,
            permission,
        } => {
            let provider = connect(manager, choice).await?;
            provider
                .permission_manager()?
                .grant_runtime_permission(&package, &permission, user)
                .await?;
            println!("granted {permission} to {package}");
        }
        Cmd::Revoke {
            package,
            permission,
        } => {
            let provider = connect(manager, choice).await?;
            provider
                .permission_manager()?
                .revoke_runtime_permission(&package, &permission, user)
                .await?;
            println!("revoked {permission} from {package}");
        }
        Cmd::Ops { package, ops } => {
            let provider = connect(manager, choice).await?;
            let uid = provider
                .package_manager()?
                .package_uid(&package, 0, user)
                .await?;
            for op in provider
                .app_ops()?
                .ops_for_package(uid, &package, &ops)
                .await?
            {
                println!("{}\t{}\tmode={}", op.op, op.name, op.mode);
            }
        }
        Cmd::ResetOps { package } => {
            let provider = connect(manager, choice).await?;
            provider
                .app_ops()?
                .reset_all_modes(user, package.as_deref())
                .await?;
            println!("app-op modes reset");
        }
        Cmd::Sessions { watch: true } => {
            let provider = connect(manager, choice).await?;
            let pm = provider.package_manager()?;
            let listener: Arc<dyn SessionCallback> = Arc::new(PrintSessions);
            pm.register_session_callback(listener.clone(), user).await?;
            let mut alive = provider.is_alive();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = alive.wait_for(|alive| !*alive) => eprintln!("privileged side went away"),
            }
            pm.unregister_session_callback(&listener);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pi_util::init_tracing()?;
    let cli = Cli::parse();

    let config = BridgeConfig::load();
    let prefs = PreferenceStore::open_default();
    let manager = ServiceManager::from_config(&config);

    let result = run(cli, &manager, &prefs).await;
    manager.shutdown().await;
    result
}
