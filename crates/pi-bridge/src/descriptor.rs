use pi_proto::pi::v1 as pb;

pub const DEFAULT_PACKAGE_NAME: &str = "io.privinstall.app";
pub const DEFAULT_SERVICE_CLASS: &str = "io.privinstall.service.PrivilegedService";
pub const DEFAULT_PROCESS_SUFFIX: &str = "broker";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentName {
    pub package_name: String,
    pub class_name: String,
}

impl ComponentName {
    pub fn new(package_name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            class_name: class_name.into(),
        }
    }
}

/// How the broker should launch the hosted privileged service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    component: ComponentName,
    version: i32,
    process_name_suffix: String,
    daemon: bool,
    debuggable: bool,
}

impl ServiceDescriptor {
    pub fn new(component: ComponentName) -> Self {
        Self {
            component,
            version: pi_proto::PROTOCOL_VERSION,
            process_name_suffix: String::new(),
            daemon: false,
            debuggable: false,
        }
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn process_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.process_name_suffix = suffix.into();
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn debuggable(mut self, debuggable: bool) -> Self {
        self.debuggable = debuggable;
        self
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn requested_version(&self) -> i32 {
        self.version
    }

    pub fn suffix(&self) -> &str {
        &self.process_name_suffix
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn is_debuggable(&self) -> bool {
        self.debuggable
    }

    pub fn to_proto(&self) -> pb::ServiceDescriptor {
        pb::ServiceDescriptor {
            component: Some(pb::ComponentName {
                package_name: self.component.package_name.clone(),
                class_name: self.component.class_name.clone(),
            }),
            version: self.version,
            process_name_suffix: self.process_name_suffix.clone(),
            daemon: self.daemon,
            debuggable: self.debuggable,
        }
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        ServiceDescriptor::new(ComponentName::new(
            DEFAULT_PACKAGE_NAME,
            DEFAULT_SERVICE_CLASS,
        ))
        .daemon(true)
        .debuggable(cfg!(debug_assertions))
        .process_name_suffix(DEFAULT_PROCESS_SUFFIX)
    }
}
