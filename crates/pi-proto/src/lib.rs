pub mod pi {
    pub mod v1 {
        tonic::include_proto!("pi.v1");
    }
}

/// Installer status codes carried in `InstallResponse.status` / `UninstallResponse.status`.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
}

/// Version spoken by `PrivilegedService`. A bound service reporting anything
/// else is treated as stale and re-bound.
pub const PROTOCOL_VERSION: i32 = 1;
