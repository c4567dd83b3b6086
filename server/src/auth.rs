//! Account registration and credential checks.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("username is already taken")]
    Conflict,
    #[error("unknown user or wrong password")]
    Invalid,
}

/// Pluggable account backend. The engine only needs these three calls.
/// Implementations must be thread-safe: the engine moves into a spawned task.
pub trait UserStore: Send + Sync {
    fn find_user(&self, username: &str) -> Option<i64>;
    fn create_user(&mut self, username: &str, password: &str) -> Result<i64, AuthError>;
    fn verify(&self, username: &str, password: &str) -> Result<i64, AuthError>;
}

/// In-memory account table. Accounts live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: HashMap<String, (i64, String)>,
    next_id: i64,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        MemoryUserStore {
            users: HashMap::new(),
            next_id: 1,
        }
    }
}

impl UserStore for MemoryUserStore {
    fn find_user(&self, username: &str) -> Option<i64> {
        self.users.get(username).map(|(id, _)| *id)
    }

    fn create_user(&mut self, username: &str, password: &str) -> Result<i64, AuthError> {
        if self.users.contains_key(username) {
            return Err(AuthError::Conflict);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.users
            .insert(username.to_string(), (id, password.to_string()));
        Ok(id)
    }

    fn verify(&self, username: &str, password: &str) -> Result<i64, AuthError> {
        match self.users.get(username) {
            Some((id, stored)) if stored == password => Ok(*id),
            _ => Err(AuthError::Invalid),
        }
    }
}
