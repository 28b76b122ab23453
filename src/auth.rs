use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

/// Supplies the identifier of the authenticated user, if any.
pub trait SessionSource: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub signed_in_at: DateTime<Utc>,
}

/// Process-wide session, optionally persisted to a JSON file so that separate
/// CLI invocations share it. Changes are published on a watch channel.
pub struct Auth {
    path: Option<PathBuf>,
    state: watch::Sender<Option<Session>>,
}

impl Auth {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: watch::Sender::new(None),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let session = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read session file: {}", path.display()))?;
            Some(
                serde_json::from_str::<Session>(&content).with_context(|| {
                    format!("Failed to parse session file: {}", path.display())
                })?,
            )
        } else {
            None
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: watch::Sender::new(session),
        })
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn sign_in(&self, user_id: &str) -> Result<Session> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            bail!("User id must not be empty");
        }

        let session = Session {
            user_id: user_id.to_string(),
            signed_in_at: Utc::now(),
        };

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
            let content =
                serde_json::to_string_pretty(&session).context("Failed to serialize session")?;
            fs::write(path, content)
                .with_context(|| format!("Failed to write session file: {}", path.display()))?;
            crate::config::set_mode_600(path)?;
        }

        info!(user = %session.user_id, "signed in");
        self.state.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub fn sign_out(&self) -> Result<()> {
        if let Some(path) = self.path.as_ref().filter(|path| path.exists()) {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove session file: {}", path.display()))?;
        }

        if let Some(previous) = self.state.send_replace(None) {
            info!(user = %previous.user_id, "signed out");
        }
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }
}

impl SessionSource for Auth {
    fn current_user(&self) -> Option<String> {
        self.state
            .borrow()
            .as_ref()
            .map(|session| session.user_id.clone())
    }
}

/// Session for a single API request: the user named by the request header,
/// otherwise whoever is signed in on the server.
pub struct RequestSession {
    user_id: Option<String>,
}

impl RequestSession {
    pub fn new(header_user: Option<&str>, fallback: &dyn SessionSource) -> Self {
        let user_id = header_user
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| fallback.current_user());

        Self { user_id }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
        }
    }
}

impl SessionSource for RequestSession {
    fn current_user(&self) -> Option<String> {
        self.user_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn session_survives_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session.json");

        let auth = Auth::load(&path).expect("load");
        assert_eq!(auth.current_user(), None);
        auth.sign_in(" alice ").expect("sign in");

        let reloaded = Auth::load(&path).expect("reload");
        assert_eq!(reloaded.current_user().as_deref(), Some("alice"));

        reloaded.sign_out().expect("sign out");
        assert!(!path.exists());
        assert_eq!(reloaded.current_user(), None);
    }

    #[test]
    fn blank_user_id_is_rejected() {
        let auth = Auth::in_memory();
        assert!(auth.sign_in("   ").is_err());
        assert_eq!(auth.current_user(), None);
    }

    #[tokio::test]
    async fn session_changes_are_streamed() {
        let auth = Auth::in_memory();
        let mut changes = auth.subscribe();

        auth.sign_in("alice").expect("sign in");
        changes.changed().await.expect("change");
        assert_eq!(
            changes.borrow_and_update().as_ref().map(|s| s.user_id.clone()),
            Some("alice".to_string())
        );

        auth.sign_out().expect("sign out");
        changes.changed().await.expect("change");
        assert!(changes.borrow_and_update().is_none());
    }

    #[test]
    fn request_header_takes_precedence_over_server_session() {
        let auth = Auth::in_memory();
        auth.sign_in("server-user").expect("sign in");

        assert_eq!(
            RequestSession::new(Some("bob"), &auth).current_user().as_deref(),
            Some("bob")
        );
        assert_eq!(
            RequestSession::new(Some(" "), &auth).current_user().as_deref(),
            Some("server-user")
        );
        assert_eq!(RequestSession::anonymous().current_user(), None);
    }
}
