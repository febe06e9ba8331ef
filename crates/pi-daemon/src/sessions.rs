use std::sync::Mutex;

use pi_proto::pi::v1::{session_event::Payload, SessionInfo};

const MAX_SESSIONS: usize = 64;

/// Install sessions this daemon has driven, newest first.
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: Mutex<Vec<SessionInfo>>,
}

impl SessionTable {
    pub(crate) fn open(
        &self,
        session_id: i32,
        user_id: i32,
        installer_package_name: &str,
        app_package_name: &str,
    ) {
        let mut sessions = self.lock();
        sessions.retain(|s| s.session_id != session_id);
        sessions.insert(
            0,
            SessionInfo {
                session_id,
                user_id,
                installer_package_name: installer_package_name.to_string(),
                app_package_name: app_package_name.to_string(),
                ..SessionInfo::default()
            },
        );
        sessions.truncate(MAX_SESSIONS);
    }

    /// Folds a lifecycle event into the recorded session, if any.
    pub(crate) fn apply(&self, payload: &Payload) {
        let session_id = match payload {
            Payload::Created(ev) => ev.session_id,
            Payload::BadgingChanged(ev) => ev.session_id,
            Payload::ActiveChanged(ev) => ev.session_id,
            Payload::ProgressChanged(ev) => ev.session_id,
            Payload::Finished(ev) => ev.session_id,
        };
        let mut sessions = self.lock();
        let Some(session) = sessions.iter_mut().find(|s| s.session_id == session_id) else {
            return;
        };
        match payload {
            Payload::Created(_) | Payload::BadgingChanged(_) => {}
            Payload::ActiveChanged(ev) => session.active = ev.active,
            Payload::ProgressChanged(ev) => session.progress = ev.progress,
            Payload::Finished(ev) => {
                session.active = false;
                session.committed = ev.success;
            }
        }
    }

    pub(crate) fn get(&self, session_id: i32) -> Option<SessionInfo> {
        self.lock()
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    /// `user_id = -1` returns every user's sessions.
    pub(crate) fn list(&self, user_id: i32) -> Vec<SessionInfo> {
        self.lock()
            .iter()
            .filter(|s| user_id == -1 || s.user_id == user_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SessionInfo>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use pi_proto::pi::v1 as pb;

    use super::*;

    #[test]
    fn lifecycle_updates_the_recorded_session() {
        let table = SessionTable::default();
        table.open(5, 0, "io.privinstall.app", "com.example.app");
        table.apply(&Payload::ActiveChanged(pb::SessionActiveChanged {
            session_id: 5,
            active: true,
        }));
        table.apply(&Payload::ProgressChanged(pb::SessionProgressChanged {
            session_id: 5,
            progress: 0.8,
        }));
        let running = table.get(5).unwrap();
        assert!(running.active);
        assert_eq!(running.progress, 0.8);
        assert!(!running.committed);

        table.apply(&Payload::Finished(pb::SessionFinished {
            session_id: 5,
            success: true,
        }));
        let done = table.get(5).unwrap();
        assert!(!done.active);
        assert!(done.committed);
    }

    #[test]
    fn events_for_unknown_sessions_are_ignored() {
        let table = SessionTable::default();
        table.apply(&Payload::Finished(pb::SessionFinished {
            session_id: 9,
            success: true,
        }));
        assert!(table.get(9).is_none());
        assert!(table.list(-1).is_empty());
    }

    #[test]
    fn list_filters_by_user_and_keeps_newest_first() {
        let table = SessionTable::default();
        table.open(1, 0, "", "a");
        table.open(2, 10, "", "b");
        table.open(3, 0, "", "c");
        let ids = |user| table.list(user).iter().map(|s| s.session_id).collect::<Vec<_>>();
        assert_eq!(ids(-1), vec![3, 2, 1]);
        assert_eq!(ids(0), vec![3, 1]);
        assert_eq!(ids(10), vec![2]);
    }

    #[test]
    fn oldest_sessions_fall_off() {
        let table = SessionTable::default();
        for id in 0..(MAX_SESSIONS as i32 + 3) {
            table.open(id, 0, "", "app");
        }
        assert_eq!(table.list(-1).len(), MAX_SESSIONS);
        assert!(table.get(0).is_none());
        assert!(table.get(MAX_SESSIONS as i32 + 2).is_some());
    }
}
