//! Connection to a higher-privileged execution context and the capability
//! surface layered over it.

mod archive;
mod backend;
mod callbacks;
mod config;
mod descriptor;
mod error;
mod manager;
mod preference;
mod provider;
mod proxy;
mod remote;
mod state;

#[cfg(test)]
mod testing;

pub use archive::ArchiveInfo;
pub use backend::{Backend, Bound, BrokerBackend, BrokerConfig, SuperuserBackend, SuperuserConfig};
pub use config::BridgeConfig;
pub use descriptor::{
    ComponentName, ServiceDescriptor, DEFAULT_PACKAGE_NAME, DEFAULT_PROCESS_SUFFIX,
    DEFAULT_SERVICE_CLASS,
};
pub use error::BridgeError;
pub use manager::{ManagerOptions, ServiceManager, ServiceManagerBuilder};
pub use pi_proto::pi::v1::{OpEntry, PackageInfo, SessionInfo, UserInfo};
pub use preference::{Preference, PreferenceStore};
pub use provider::{
    AppOpsService, DelegatedProvider, PackageManager, PermissionManager, Provider, ServiceProvider,
    UserManager,
};
pub use proxy::{
    AppOpsCallback, InstallerCallback, OpModeCallback, OpModeCallbackProxy, SessionCallback,
    SessionCallbackProxy,
};
pub use remote::{EventStream, GrpcRemote, Identity, RemoteService, UserFilter};
pub use state::{ProviderChoice, ServiceState};
