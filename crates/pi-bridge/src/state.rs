use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{error::BridgeError, provider::Provider};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    #[default]
    None,
    Broker,
    Superuser,
}

impl ProviderChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderChoice::None => "none",
            ProviderChoice::Broker => "broker",
            ProviderChoice::Superuser => "superuser",
        }
    }
}

impl fmt::Display for ProviderChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderChoice {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ProviderChoice::None),
            "broker" | "shizuku" => Ok(ProviderChoice::Broker),
            "superuser" | "su" | "root" => Ok(ProviderChoice::Superuser),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

/// Current truth about the privileged channel.
///
/// A `Success` handle is only valid until the next state is observed; callers
/// must not keep it around past that.
#[derive(Clone)]
pub enum ServiceState {
    Pending,
    Success(Arc<dyn Provider>),
    Failure(BridgeError),
}

impl ServiceState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ServiceState::Pending)
    }

    pub fn is_succeed(&self) -> bool {
        matches!(self, ServiceState::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ServiceState::Failure(_))
    }

    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        match self {
            ServiceState::Success(provider) => Some(Arc::clone(provider)),
            ServiceState::Pending | ServiceState::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&BridgeError> {
        match self {
            ServiceState::Failure(err) => Some(err),
            ServiceState::Pending | ServiceState::Success(_) => None,
        }
    }

    /// Resolve the provider, turning `Pending`/`Failure` into an error.
    pub fn require(&self) -> Result<Arc<dyn Provider>, BridgeError> {
        match self {
            ServiceState::Success(provider) => Ok(Arc::clone(provider)),
            ServiceState::Failure(err) => Err(err.clone()),
            ServiceState::Pending => Err(BridgeError::NotConnected),
        }
    }
}

impl fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => f.write_str("Pending"),
            ServiceState::Success(provider) => f
                .debug_struct("Success")
                .field("uid", &provider.uid())
                .field("pid", &provider.pid())
                .finish(),
            ServiceState::Failure(err) => f.debug_tuple("Failure").field(err).finish(),
        }
    }
}
