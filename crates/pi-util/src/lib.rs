use std::{
    fs,
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tonic::transport::{server::Router, Server};
use tracing::info;

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:50060";
pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:50061";

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn broker_addr() -> String {
    env_addr("PI_BROKER_ADDR", DEFAULT_BROKER_ADDR)
}

pub fn daemon_addr() -> String {
    env_addr("PI_DAEMON_ADDR", DEFAULT_DAEMON_ADDR)
}

pub fn endpoint_uri(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PI_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/pi")
    } else {
        PathBuf::from("/tmp/pi")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

/// Serve until `shutdown` resolves.
pub async fn serve_grpc<F, S>(
    app_name: &str,
    addr: &str,
    shutdown: S,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
    S: Future<Output = ()>,
{
    let addr: SocketAddr = addr.parse()?;
    info!("{app_name} listening on {addr}");

    let mut server = Server::builder();
    add_service(&mut server)
        .serve_with_shutdown(addr, shutdown)
        .await?;
    info!("{app_name} stopped");
    Ok(())
}
