use std::{sync::Arc, time::Duration};

use futures_util::{stream, StreamExt};
use pi_proto::pi::v1::{self as pb, broker_service_client::BrokerServiceClient};
use pi_util::endpoint_uri;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use super::{Backend, Bound};
use crate::{
    descriptor::{ServiceDescriptor, DEFAULT_PACKAGE_NAME},
    error::BridgeError,
    remote::{EventStream, GrpcRemote, RemoteService},
    state::ProviderChoice,
};

const PERMISSION_REQUEST_CODE: i32 = 1;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub addr: String,
    /// Package the broker authorizes.
    pub package_name: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub delegate_only: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: pi_util::broker_addr(),
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
            connect_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(2),
            delegate_only: false,
        }
    }
}

/// Reaches the privileged side through the platform broker.
pub struct BrokerBackend {
    config: BrokerConfig,
}

impl BrokerBackend {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn client(&self) -> Result<BrokerServiceClient<Channel>, BridgeError> {
        let addr = &self.config.addr;
        let channel = Channel::from_shared(endpoint_uri(addr))
            .map_err(|e| BridgeError::ConnectionFailure(format!("invalid broker address {addr}: {e}")))?
            .connect_timeout(self.config.connect_timeout)
            .connect()
            .await
            .map_err(|e| BridgeError::ConnectionFailure(format!("broker not available at {addr}: {e}")))?;
        Ok(BrokerServiceClient::new(channel))
    }

    async fn ensure_permission(
        &self,
        client: &mut BrokerServiceClient<Channel>,
    ) -> Result<(), BridgeError> {
        let package_name = self.config.package_name.clone();
        let granted = client
            .check_permission(pb::CheckPermissionRequest {
                package_name: package_name.clone(),
            })
            .await?
            .into_inner()
            .granted;
        if granted {
            return Ok(());
        }
        info!("requesting broker permission for {package_name}");
        let granted = client
            .request_permission(pb::RequestPermissionRequest {
                package_name: package_name.clone(),
                request_code: PERMISSION_REQUEST_CODE,
            })
            .await?
            .into_inner()
            .granted;
        if granted {
            Ok(())
        } else {
            Err(BridgeError::ConnectionFailure(format!(
                "not authorized: broker permission not granted to {package_name}"
            )))
        }
    }

    fn heartbeat(&self, client: BrokerServiceClient<Channel>) -> EventStream<()> {
        let interval = self.config.heartbeat_interval;
        stream::unfold(client, move |mut client| async move {
            tokio::time::sleep(interval).await;
            match client.ping(pb::PingRequest {}).await {
                Ok(_) => Some((Ok(()), client)),
                Err(status) => {
                    debug!("broker heartbeat failed: {}", status.message());
                    None
                }
            }
        })
        .boxed()
    }
}

#[tonic::async_trait]
impl Backend for BrokerBackend {
    fn choice(&self) -> ProviderChoice {
        ProviderChoice::Broker
    }

    async fn bind(&self, descriptor: &ServiceDescriptor) -> Result<Bound, BridgeError> {
        let mut client = self.client().await?;
        let ping = client
            .ping(pb::PingRequest {})
            .await
            .map_err(|s| BridgeError::ConnectionFailure(format!("broker not available: {}", s.message())))?
            .into_inner();
        info!("broker v{} reachable (uid {})", ping.version, ping.uid);

        self.ensure_permission(&mut client).await?;

        if self.config.delegate_only {
            return Ok(Bound::Delegated {
                uid: ping.uid,
                heartbeat: self.heartbeat(client),
            });
        }

        let endpoint = client
            .bind_user_service(pb::BindUserServiceRequest {
                descriptor: Some(descriptor.to_proto()),
            })
            .await?
            .into_inner()
            .endpoint;
        if endpoint.is_empty() {
            return Err(BridgeError::ConnectionFailure(
                "broker returned no service endpoint".into(),
            ));
        }
        info!("broker bound {} at {endpoint}", descriptor.component().class_name);
        let remote = GrpcRemote::connect(&endpoint, self.config.connect_timeout).await?;
        Ok(Bound::Service(remote.into_shared()))
    }

    async fn unbind(
        &self,
        remote: Option<&Arc<dyn RemoteService>>,
        descriptor: &ServiceDescriptor,
        remove: bool,
    ) -> Result<(), BridgeError> {
        // Delegated connections never bound a user service.
        if remote.is_none() {
            debug!("no user service to unbind");
            return Ok(());
        }
        let mut client = self.client().await?;
        if let Err(status) = client
            .unbind_user_service(pb::UnbindUserServiceRequest {
                descriptor: Some(descriptor.to_proto()),
                remove,
            })
            .await
        {
            warn!("broker unbind failed: {}", status.message());
            return Err(status.into());
        }
        Ok(())
    }
}
