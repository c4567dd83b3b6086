//! Authenticated player sessions and the connection/user binding tables.

use crate::replication::InterestState;
use shared::Vec2;
use std::collections::{HashMap, HashSet};

/// Per-connection state for one authenticated player.
#[derive(Debug)]
pub struct Session {
    pub conn: u64,
    pub user_id: i64,
    pub username: String,
    /// Level the player currently inhabits, if any.
    pub level: Option<String>,
    pub interest: InterestState,
    pub mouse_world: Vec2,
    /// Keys that went down this tick.
    triggered: HashSet<i64>,
    /// Keys currently held.
    pressed: HashSet<i64>,
    /// Keys that went up this tick.
    released: HashSet<i64>,
}

impl Session {
    pub fn new(conn: u64, user_id: i64, username: String, update_distance: i32) -> Self {
        Session {
            conn,
            user_id,
            username,
            level: None,
            interest: InterestState::new(update_distance),
            mouse_world: Vec2::ZERO,
            triggered: HashSet::new(),
            pressed: HashSet::new(),
            released: HashSet::new(),
        }
    }

    /// Name of the character actor this player controls.
    pub fn player_actor(&self) -> String {
        format!("__Player_{}", self.user_id)
    }

    pub fn key_down(&mut self, key: i64) {
        if self.pressed.insert(key) {
            self.triggered.insert(key);
        }
    }

    pub fn key_up(&mut self, key: i64) {
        if self.pressed.remove(&key) {
            self.released.insert(key);
        }
    }

    pub fn triggered(&self) -> &HashSet<i64> {
        &self.triggered
    }

    pub fn pressed(&self) -> &HashSet<i64> {
        &self.pressed
    }

    pub fn released(&self) -> &HashSet<i64> {
        &self.released
    }

    /// Clears the edge sets after input dispatch. Held keys persist.
    pub fn end_tick_inputs(&mut self) {
        self.triggered.clear();
        self.released.clear();
    }
}

/// Tracks which connection owns which user. A user logging in from a second
/// connection evicts the first.
#[derive(Debug, Default)]
pub struct SessionManager {
    by_conn: HashMap<u64, Session>,
    conn_by_user: HashMap<i64, u64>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a freshly authenticated user to a connection. Returns every
    /// session this displaces: the connection's own previous session when it
    /// re-authenticates, and an older connection for the same user, which the
    /// caller must force-close. Callers clean up each one's level presence.
    pub fn install(&mut self, session: Session) -> Vec<Session> {
        let mut displaced = Vec::new();
        // A connection re-authenticating sheds its previous identity first,
        // or the old user would keep resolving to this conn forever.
        if let Some(previous) = self.by_conn.remove(&session.conn) {
            if self.conn_by_user.get(&previous.user_id) == Some(&session.conn) {
                self.conn_by_user.remove(&previous.user_id);
            }
            displaced.push(previous);
        }
        if let Some(old_conn) = self.conn_by_user.insert(session.user_id, session.conn) {
            if old_conn != session.conn {
                displaced.extend(self.by_conn.remove(&old_conn));
            }
        }
        self.by_conn.insert(session.conn, session);
        displaced
    }

    /// Drops the session for a closed connection, returning it so the caller
    /// can clean up its level presence.
    pub fn remove_conn(&mut self, conn: u64) -> Option<Session> {
        let session = self.by_conn.remove(&conn)?;
        // Only unbind if this connection still owns the user; an evicted
        // session's user already points at the newer connection.
        if self.conn_by_user.get(&session.user_id) == Some(&conn) {
            self.conn_by_user.remove(&session.user_id);
        }
        Some(session)
    }

    pub fn get(&self, conn: u64) -> Option<&Session> {
        self.by_conn.get(&conn)
    }

    pub fn get_mut(&mut self, conn: u64) -> Option<&mut Session> {
        self.by_conn.get_mut(&conn)
    }

    pub fn conn_for_user(&self, user_id: i64) -> Option<u64> {
        self.conn_by_user.get(&user_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_conn.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.by_conn.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_edges_are_tracked_per_tick() {
        let mut session = Session::new(1, 7, "ada".into(), 2);

        session.key_down(65);
        assert!(session.triggered().contains(&65));
        assert!(session.pressed().contains(&65));

        // A repeat while held does not retrigger.
        session.end_tick_inputs();
        session.key_down(65);
        assert!(session.triggered().is_empty());
        assert!(session.pressed().contains(&65));

        session.key_up(65);
        assert!(session.released().contains(&65));
        assert!(!session.pressed().contains(&65));

        // Releasing an unheld key is a no-op.
        session.end_tick_inputs();
        session.key_up(65);
        assert!(session.released().is_empty());
    }

    #[test]
    fn second_login_evicts_the_first_connection() {
        let mut sessions = SessionManager::new();
        assert!(sessions.install(Session::new(1, 7, "ada".into(), 2)).is_empty());
        assert_eq!(sessions.conn_for_user(7), Some(1));

        let displaced = sessions.install(Session::new(2, 7, "ada".into(), 2));
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].conn, 1);
        assert_eq!(sessions.conn_for_user(7), Some(2));
        assert!(sessions.get(1).is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn reauth_on_same_conn_drops_the_old_user_binding() {
        let mut sessions = SessionManager::new();
        sessions.install(Session::new(1, 7, "ada".into(), 2));

        // Same connection logs in again as somebody else.
        let displaced = sessions.install(Session::new(1, 8, "bob".into(), 2));
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].user_id, 7);
        assert_eq!(sessions.conn_for_user(7), None);
        assert_eq!(sessions.conn_for_user(8), Some(1));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn removing_a_reauthed_conn_leaves_no_user_bindings() {
        let mut sessions = SessionManager::new();
        sessions.install(Session::new(1, 7, "ada".into(), 2));
        sessions.install(Session::new(1, 8, "bob".into(), 2));

        let removed = sessions.remove_conn(1).unwrap();
        assert_eq!(removed.user_id, 8);
        assert_eq!(sessions.conn_for_user(7), None);
        assert_eq!(sessions.conn_for_user(8), None);
        assert!(sessions.is_empty());
    }

    #[test]
    fn removing_an_evicted_conn_keeps_the_new_binding() {
        let mut sessions = SessionManager::new();
        sessions.install(Session::new(1, 7, "ada".into(), 2));
        sessions.install(Session::new(2, 7, "ada".into(), 2));

        // The old connection's close arrives after the takeover.
        assert!(sessions.remove_conn(1).is_none());
        assert_eq!(sessions.conn_for_user(7), Some(2));

        let removed = sessions.remove_conn(2).unwrap();
        assert_eq!(removed.user_id, 7);
        assert_eq!(sessions.conn_for_user(7), None);
    }

    #[test]
    fn player_actor_name_is_keyed_by_user_id() {
        let session = Session::new(3, 42, "bob".into(), 2);
        assert_eq!(session.player_actor(), "__Player_42");
    }
}
