//! Session-scoped state.
//!
//! A [`Session`] holds what belongs to one operator connection and nothing
//! else: the selected host id and the elevation secret for privileged
//! backups. The secret lives in memory only and is cleared on drop or by an
//! explicit call, and is never persisted.

use crate::hosts::LOCAL_HOST_ID;
use std::sync::RwLock;

pub struct Session {
    selected_host: RwLock<String>,
    elevation_secret: RwLock<Option<String>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            selected_host: RwLock::new(LOCAL_HOST_ID.to_string()),
            elevation_secret: RwLock::new(None),
        }
    }

    pub fn select_host(&self, id: impl Into<String>) {
        *self.selected_host.write().expect("session poisoned") = id.into();
    }

    pub fn selected_host(&self) -> String {
        self.selected_host.read().expect("session poisoned").clone()
    }

    pub fn set_elevation_secret(&self, secret: impl Into<String>) {
        *self.elevation_secret.write().expect("session poisoned") = Some(secret.into());
    }

    pub fn clear_elevation_secret(&self) {
        *self.elevation_secret.write().expect("session poisoned") = None;
    }

    pub fn elevation_secret(&self) -> Option<String> {
        self.elevation_secret
            .read()
            .expect("session poisoned")
            .clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Overwrite rather than rely on the allocator.
        if let Ok(mut secret) = self.elevation_secret.write() {
            if let Some(s) = secret.as_mut() {
                s.replace_range(.., &"\0".repeat(s.len()));
            }
            *secret = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local_host() {
        let session = Session::new();
        assert_eq!(session.selected_host(), "local");
        assert!(session.elevation_secret().is_none());
    }

    #[test]
    fn host_selection_is_sticky() {
        let session = Session::new();
        session.select_host("prod-1");
        assert_eq!(session.selected_host(), "prod-1");
    }

    #[test]
    fn elevation_secret_set_and_clear() {
        let session = Session::new();
        session.set_elevation_secret("hunter2");
        assert_eq!(session.elevation_secret().as_deref(), Some("hunter2"));
        session.clear_elevation_secret();
        assert!(session.elevation_secret().is_none());
    }
}
