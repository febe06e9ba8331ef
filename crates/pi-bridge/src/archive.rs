use std::path::{Path, PathBuf};

use pi_proto::pi::v1 as pb;
use prost::Message;
use tracing::warn;

use crate::error::BridgeError;

/// Location and identity of a package archive handed to the privileged side.
///
/// Only the path travels; the file itself stays wherever the caller put it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveInfo {
    path: PathBuf,
    package_name: String,
    originating: String,
}

impl ArchiveInfo {
    pub fn new(
        path: impl Into<PathBuf>,
        package_name: impl Into<String>,
        originating: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            package_name: package_name.into(),
            originating: originating.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn originating(&self) -> &str {
        &self.originating
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    /// Missing fields come back as empty strings rather than an error; only
    /// bytes that are not a valid message at all fail.
    pub fn decode(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        let msg = pb::ArchiveInfo::decode(bytes)?;
        Ok(Self::from_proto(msg))
    }

    pub fn to_proto(&self) -> pb::ArchiveInfo {
        pb::ArchiveInfo {
            path: self.path.to_string_lossy().into_owned(),
            package_name: self.package_name.clone(),
            originating: self.originating.clone(),
        }
    }

    pub fn from_proto(msg: pb::ArchiveInfo) -> Self {
        let info = Self {
            path: PathBuf::from(msg.path),
            package_name: msg.package_name,
            originating: msg.originating,
        };
        let degraded = info.degraded_fields();
        if !degraded.is_empty() {
            warn!(
                "archive info decoded with empty fields: {}",
                degraded.join(", ")
            );
        }
        info
    }

    pub fn degraded_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.path.as_os_str().is_empty() {
            fields.push("path");
        }
        if self.package_name.is_empty() {
            fields.push("package_name");
        }
        if self.originating.is_empty() {
            fields.push("originating");
        }
        fields
    }

    pub(crate) fn ensure_installable(&self) -> Result<(), BridgeError> {
        if self.package_name.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "archive package name is required".into(),
            ));
        }
        if self.path.as_os_str().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "archive path is required".into(),
            ));
        }
        Ok(())
    }
}

impl From<pb::ArchiveInfo> for ArchiveInfo {
    fn from(msg: pb::ArchiveInfo) -> Self {
        Self::from_proto(msg)
    }
}

impl From<&ArchiveInfo> for pb::ArchiveInfo {
    fn from(info: &ArchiveInfo) -> Self {
        info.to_proto()
    }
}
