//! Adapters between the callback shapes the privileged side emits and the
//! listener traits the application implements.

use std::sync::{Arc, RwLock};

use pi_proto::pi::v1::{self as pb, session_event::Payload as SessionPayload};
use tracing::debug;

/// Install-session listener implemented by the application.
pub trait SessionCallback: Send + Sync {
    fn on_created(&self, _session_id: i32) {}

    fn on_badging_changed(&self, _session_id: i32) {}

    fn on_active_changed(&self, _session_id: i32, _active: bool) {}

    fn on_progress_changed(&self, _session_id: i32, _progress: f32) {}

    fn on_finished(&self, _session_id: i32, _success: bool) {}
}

/// Op-mode listener implemented by the application.
pub trait OpModeCallback: Send + Sync {
    fn op_changed(&self, op: i32, uid: i32, package_name: &str);
}

/// Installer callback as the platform names it.
pub trait InstallerCallback: Send + Sync {
    fn on_session_created(&self, session_id: i32);
    fn on_session_badging_changed(&self, session_id: i32);
    fn on_session_active_changed(&self, session_id: i32, active: bool);
    fn on_session_progress_changed(&self, session_id: i32, progress: f32);
    fn on_session_finished(&self, session_id: i32, success: bool);
}

/// App-ops callback as the platform names it.
pub trait AppOpsCallback: Send + Sync {
    fn op_changed(&self, op: i32, uid: i32, package_name: &str);
}

pub(crate) fn listener_key<T: ?Sized>(listener: &Arc<T>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// Runs `deliver` with the read guard held, so `detach` waits for an
/// in-flight delivery. A listener must not detach its own proxy from inside
/// a callback.
fn with_listener<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, deliver: impl FnOnce(&T)) {
    let guard = slot.read().unwrap_or_else(|e| e.into_inner());
    if let Some(listener) = guard.as_deref() {
        deliver(listener);
    }
}

fn attached<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> bool {
    slot.read().unwrap_or_else(|e| e.into_inner()).is_some()
}

fn clear<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) {
    slot.write().unwrap_or_else(|e| e.into_inner()).take();
}

pub struct SessionCallbackProxy {
    listener: RwLock<Option<Arc<dyn SessionCallback>>>,
}

impl SessionCallbackProxy {
    pub fn new(listener: Arc<dyn SessionCallback>) -> Self {
        Self {
            listener: RwLock::new(Some(listener)),
        }
    }

    /// Drop the listener; later deliveries become no-ops. Returns after any
    /// delivery already running has finished.
    pub fn detach(&self) {
        clear(&self.listener);
    }

    pub fn is_attached(&self) -> bool {
        attached(&self.listener)
    }

    pub fn dispatch(&self, event: pb::SessionEvent) {
        match event.payload {
            Some(SessionPayload::Created(e)) => self.on_session_created(e.session_id),
            Some(SessionPayload::BadgingChanged(e)) => {
                self.on_session_badging_changed(e.session_id)
            }
            Some(SessionPayload::ActiveChanged(e)) => {
                self.on_session_active_changed(e.session_id, e.active)
            }
            Some(SessionPayload::ProgressChanged(e)) => {
                self.on_session_progress_changed(e.session_id, e.progress)
            }
            Some(SessionPayload::Finished(e)) => self.on_session_finished(e.session_id, e.success),
            None => debug!("session event without payload ignored"),
        }
    }
}

impl InstallerCallback for SessionCallbackProxy {
    fn on_session_created(&self, session_id: i32) {
        with_listener(&self.listener, |listener| listener.on_created(session_id));
    }

    fn on_session_badging_changed(&self, session_id: i32) {
        with_listener(&self.listener, |listener| listener.on_badging_changed(session_id));
    }

    fn on_session_active_changed(&self, session_id: i32, active: bool) {
        with_listener(&self.listener, |listener| listener.on_active_changed(session_id, active));
    }

    fn on_session_progress_changed(&self, session_id: i32, progress: f32) {
        with_listener(&self.listener, |listener| {
            listener.on_progress_changed(session_id, progress);
        });
    }

    fn on_session_finished(&self, session_id: i32, success: bool) {
        with_listener(&self.listener, |listener| listener.on_finished(session_id, success));
    }
}

pub struct OpModeCallbackProxy {
    listener: RwLock<Option<Arc<dyn OpModeCallback>>>,
}

impl OpModeCallbackProxy {
    pub fn new(listener: Arc<dyn OpModeCallback>) -> Self {
        Self {
            listener: RwLock::new(Some(listener)),
        }
    }

    pub fn detach(&self) {
        clear(&self.listener);
    }

    pub fn is_attached(&self) -> bool {
        attached(&self.listener)
    }

    pub fn dispatch(&self, event: pb::OpChanged) {
        AppOpsCallback::op_changed(self, event.op, event.uid, &event.package_name);
    }
}

impl AppOpsCallback for OpModeCallbackProxy {
    fn op_changed(&self, op: i32, uid: i32, package_name: &str) {
        with_listener(&self.listener, |listener| listener.op_changed(op, uid, package_name));
    }
}
