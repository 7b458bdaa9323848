//! Password gate in front of the session

use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::{AuthError, ConfigError, SessionConfig, config};

/// What the presentation layer needs to pick a screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub is_configured: bool,
    pub is_authenticated: bool,
}

/// Owns the stored config and the authentication flags
pub struct Authenticator {
    path: PathBuf,
    config: Option<SessionConfig>,
    state: AuthState,
}

impl Authenticator {
    /// Load the config file at `path`; a missing file means first run
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = SessionConfig::load(&path)?;

        match &config {
            Some(c) => info!("Loaded config for {} slot(s) from {}", c.slots.len(), path.display()),
            None => info!("No config at {}", path.display()),
        }

        let state = AuthState {
            is_configured: config.is_some(),
            is_authenticated: false,
        };

        Ok(Self { path, config, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Store a new password and slot ids; the caller is authenticated afterwards
    pub fn configure(&mut self, config: SessionConfig) -> Result<(), ConfigError> {
        config.save(&self.path)?;
        info!("Config written to {}", self.path.display());
        self.config = Some(config);
        self.state = AuthState {
            is_configured: true,
            is_authenticated: true,
        };
        Ok(())
    }

    pub fn check_password(&mut self, candidate: &str) -> Result<(), AuthError> {
        let config = match (&self.config, self.state.is_configured) {
            (Some(config), true) => config,
            _ => return Err(AuthError::NotConfigured),
        };

        if config.password != candidate {
            return Err(AuthError::Mismatch);
        }

        info!("Authenticated");
        self.state.is_authenticated = true;
        Ok(())
    }

    /// Back to the set-password prompt; the stored file is left alone
    pub fn reset_password(&mut self) {
        info!("Reset password");
        self.state = AuthState::default();
    }

    /// Delete the stored file as well
    pub fn forget(&mut self) -> Result<(), ConfigError> {
        config::remove(&self.path)?;
        self.config = None;
        self.state = AuthState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GattIds;

    fn config() -> SessionConfig {
        SessionConfig {
            password: "secret".into(),
            slots: vec![GattIds::new("180A", "2A57")],
        }
    }

    #[test]
    fn first_run_is_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let mut auth = Authenticator::load(dir.path().join("data.txt")).unwrap();
        assert_eq!(auth.state(), AuthState::default());
        assert_eq!(auth.check_password("secret"), Err(AuthError::NotConfigured));
    }

    #[test]
    fn configure_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");

        let mut auth = Authenticator::load(&path).unwrap();
        auth.configure(config()).unwrap();
        assert_eq!(
            auth.state(),
            AuthState { is_configured: true, is_authenticated: true }
        );

        let reloaded = Authenticator::load(&path).unwrap();
        assert_eq!(reloaded.config(), Some(&config()));
        assert_eq!(
            reloaded.state(),
            AuthState { is_configured: true, is_authenticated: false }
        );
    }

    #[test]
    fn empty_password_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut auth = Authenticator::load(&path).unwrap();

        let empty = SessionConfig { password: String::new(), ..config() };
        assert!(matches!(auth.configure(empty), Err(ConfigError::Malformed(_))));
        assert_eq!(auth.state(), AuthState::default());
        assert!(Authenticator::load(&path).is_ok());
    }

    #[test]
    fn password_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        config().save(&path).unwrap();

        let mut auth = Authenticator::load(&path).unwrap();
        assert_eq!(auth.check_password("guess"), Err(AuthError::Mismatch));
        assert!(!auth.state().is_authenticated);
        assert_eq!(auth.check_password("secret"), Ok(()));
        assert!(auth.state().is_authenticated);
    }

    #[test]
    fn reset_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut auth = Authenticator::load(&path).unwrap();
        auth.configure(config()).unwrap();

        auth.reset_password();
        assert_eq!(auth.state(), AuthState::default());
        assert!(path.exists());
        assert_eq!(auth.check_password("secret"), Err(AuthError::NotConfigured));

        // a restart reloads the same password
        let mut auth = Authenticator::load(&path).unwrap();
        assert_eq!(auth.check_password("secret"), Ok(()));
    }

    #[test]
    fn forget_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut auth = Authenticator::load(&path).unwrap();
        auth.configure(config()).unwrap();

        auth.forget().unwrap();
        assert!(!path.exists());
        assert!(auth.config().is_none());
        assert!(!Authenticator::load(&path).unwrap().state().is_configured);
    }
}
