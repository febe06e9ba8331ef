use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::{descriptor::DEFAULT_PACKAGE_NAME, state::ProviderChoice};

const PREFERENCE_FILE_NAME: &str = "preferences.json";

/// User-selected provider plus the packages that appear as installer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preference {
    pub provider: ProviderChoice,
    /// Package asking for the install.
    pub requester: String,
    /// Package recorded as the installer.
    pub executor: String,
}

impl Default for Preference {
    fn default() -> Self {
        Self {
            provider: ProviderChoice::None,
            requester: DEFAULT_PACKAGE_NAME.into(),
            executor: DEFAULT_PACKAGE_NAME.into(),
        }
    }
}

/// Persisted [`Preference`] with change notification.
pub struct PreferenceStore {
    path: PathBuf,
    tx: watch::Sender<Preference>,
}

impl PreferenceStore {
    pub fn open_default() -> Self {
        Self::open(pi_util::state_file_path(PREFERENCE_FILE_NAME))
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let preference = load_preference(&path);
        Self {
            path,
            tx: watch::Sender::new(preference),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Preference {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Preference> {
        self.tx.subscribe()
    }

    /// Persist first; observers only hear about values that made it to disk.
    pub fn update(&self, edit: impl FnOnce(&mut Preference)) -> io::Result<Preference> {
        let mut next = self.current();
        edit(&mut next);
        pi_util::write_json_atomic(&self.path, &next)?;
        let stored = next.clone();
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        Ok(stored)
    }

    pub fn set_provider(&self, provider: ProviderChoice) -> io::Result<Preference> {
        self.update(|pref| pref.provider = provider)
    }
}

fn load_preference(path: &Path) -> Preference {
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<Preference>(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Failed to parse preferences {}: {}", path.display(), err);
                Preference::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read preferences {}: {}", path.display(), err);
            }
            Preference::default()
        }
    }
}
