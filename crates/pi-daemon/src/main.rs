mod appops;
mod hub;
mod pm;
mod service;
mod sessions;
mod shell;

use std::time::Duration;

use clap::Parser;
use pi_proto::pi::v1::privileged_service_server::PrivilegedServiceServer;
use service::Svc;
use tokio::sync::watch;
use tracing::info;

/// Privileged install daemon, started under `su` by the bridge.
#[derive(Parser, Debug)]
#[command(name = "pi-daemon", version)]
struct Args {
    /// Address to serve the privileged service on.
    #[arg(long, env = "PI_DAEMON_ADDR", default_value = pi_util::DEFAULT_DAEMON_ADDR)]
    addr: String,

    /// Liveness heartbeat interval in milliseconds.
    #[arg(long, env = "PI_HEARTBEAT_MS", default_value_t = 2000)]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pi_util::init_tracing()?;
    let args = Args::parse();

    let (stop, stopping) = watch::channel(false);
    let svc = Svc::new(stop, Duration::from_millis(args.heartbeat_ms.max(1)));
    let identity = service::identity();
    info!(
        "pi-daemon uid {} pid {} context {:?}",
        identity.uid, identity.pid, identity.se_linux_context
    );

    let shutdown = async move {
        tokio::select! {
            _ = hub::stopped(stopping) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
    };
    pi_util::serve_grpc("pi-daemon", &args.addr, shutdown, |server| {
        server.add_service(PrivilegedServiceServer::new(svc))
    })
    .await
}
