use std::sync::Arc;

use crate::{
    descriptor::ServiceDescriptor,
    error::BridgeError,
    remote::{EventStream, RemoteService},
    state::ProviderChoice,
};

mod broker;
mod superuser;

pub use broker::{BrokerBackend, BrokerConfig};
pub use superuser::{SuperuserBackend, SuperuserConfig};

/// What a backend handed back from a successful bind.
pub enum Bound {
    Service(Arc<dyn RemoteService>),
    /// The broker only vouches for a delegated process running as `uid`;
    /// `heartbeat` ends when the broker goes away.
    Delegated { uid: i32, heartbeat: EventStream<()> },
}

/// One way of reaching the privileged side.
#[tonic::async_trait]
pub trait Backend: Send + Sync {
    fn choice(&self) -> ProviderChoice;

    async fn bind(&self, descriptor: &ServiceDescriptor) -> Result<Bound, BridgeError>;

    /// Release a previous bind. `remove` asks the host to drop the service
    /// process instead of keeping it cached.
    async fn unbind(
        &self,
        remote: Option<&Arc<dyn RemoteService>>,
        descriptor: &ServiceDescriptor,
        remove: bool,
    ) -> Result<(), BridgeError>;
}
