//! User authentication
//!
//! Every method first returns early when the session is already
//! authenticated, then requires the method to be in the server's advertised
//! list before making the attempt.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::backend::Backend;
use super::call::Handles;
use super::error::{ProtocolError, SshError};
use super::session::{Session, SessionInner};
use super::types::{AuthType, SessionState};

impl<B: Backend> SessionInner<B> {
    pub(crate) fn is_authenticated(&self) -> bool {
        self.exclusive(|h| h.session.as_ref().is_some_and(|s| s.authenticated()))
    }

    /// Methods the server accepts for the configured user.
    pub(crate) fn auth_list(&self) -> Result<Vec<AuthType>, SshError> {
        let username = self.config.username.clone();
        match self.call(true, |h| h.session_mut()?.auth_methods(&username)) {
            Ok(list) => Ok(AuthType::parse_list(&list)),
            // libssh2 has no list once "none" authentication succeeded
            Err(_) if self.is_authenticated() => Ok(vec![AuthType::None]),
            Err(err) => Err(err.into()),
        }
    }

    fn authenticate_with(
        &self,
        method: AuthType,
        attempt: impl FnMut(&mut Handles<B>) -> Result<(), ProtocolError>,
    ) -> Result<(), SshError> {
        if self.is_authenticated() {
            return Ok(());
        }
        let advertised = self.auth_list()?;
        if method != AuthType::None && !advertised.contains(&method) {
            warn!(
                "Session {} server does not offer {} authentication",
                self.id,
                method.name()
            );
            return Err(SshError::MethodNotAdvertised(method.name().to_string()));
        }

        self.set_state(SessionState::Authenticating);
        let result = self.call(true, attempt);
        if !self.is_authenticated() {
            let reason = match result {
                Err(err) => err.to_string(),
                Ok(()) => format!("{} authentication was not accepted", method.name()),
            };
            warn!(
                "Session {} {} authentication failed: {}",
                self.id,
                method.name(),
                reason
            );
            self.set_state(SessionState::Established);
            return Err(SshError::AuthenticationFailed(reason));
        }

        self.set_state(SessionState::Authenticated);
        info!(
            "Session {} authenticated as {} using {}",
            self.id,
            self.config.username,
            method.name()
        );
        if let Some(delegate) = self.delegates.session() {
            delegate.authenticate();
        }
        Ok(())
    }

    pub(crate) fn authenticate_password(&self, password: &str) -> Result<(), SshError> {
        let username = self.config.username.clone();
        self.authenticate_with(AuthType::Password, |h| {
            h.session_mut()?.userauth_password(&username, password)
        })
    }

    pub(crate) fn authenticate_pubkey_file(
        &self,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), SshError> {
        let username = self.config.username.clone();
        self.authenticate_with(AuthType::Publickey, |h| {
            h.session_mut()?
                .userauth_pubkey_file(&username, public_key, private_key, passphrase)
        })
    }

    pub(crate) fn authenticate_pubkey_memory(
        &self,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), SshError> {
        let username = self.config.username.clone();
        self.authenticate_with(AuthType::Publickey, |h| {
            h.session_mut()?
                .userauth_pubkey_memory(&username, public_key, private_key, passphrase)
        })
    }

    /// Each prompt is answered by the session delegate, inside the serialized call.
    pub(crate) fn authenticate_keyboard_interactive(&self) -> Result<(), SshError> {
        let username = self.config.username.clone();
        let delegate = self.delegates.session();
        self.authenticate_with(AuthType::KeyboardInteractive, |h| {
            let mut respond = |prompt: &str| {
                delegate
                    .as_ref()
                    .map(|d| d.keyboard_interactive(prompt))
                    .unwrap_or_default()
            };
            h.session_mut()?
                .userauth_keyboard_interactive(&username, &mut respond)
        })
    }

    /// `none` authentication: asking for the method list is the attempt.
    pub(crate) fn authenticate_none(&self) -> Result<(), SshError> {
        let username = self.config.username.clone();
        self.authenticate_with(AuthType::None, |h| {
            h.session_mut()?.auth_methods(&username).map(|_| ())
        })
    }
}

impl<B: Backend> Session<B> {
    pub async fn is_authenticated(&self) -> bool {
        self.run(|s| Ok(s.is_authenticated())).await.unwrap_or(false)
    }

    /// Authentication methods the server offers for the configured user.
    pub async fn auth_methods(&self) -> Result<Vec<AuthType>, SshError> {
        self.run(|s| s.auth_list()).await
    }

    pub async fn authenticate_password(&self, password: &str) -> Result<(), SshError> {
        let password = password.to_string();
        self.run(move |s| s.authenticate_password(&password)).await
    }

    pub async fn authenticate_pubkey_file(
        &self,
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<String>,
    ) -> Result<(), SshError> {
        self.run(move |s| {
            s.authenticate_pubkey_file(
                public_key.as_deref(),
                &private_key,
                passphrase.as_deref(),
            )
        })
        .await
    }

    pub async fn authenticate_pubkey_memory(
        &self,
        public_key: Option<String>,
        private_key: String,
        passphrase: Option<String>,
    ) -> Result<(), SshError> {
        self.run(move |s| {
            s.authenticate_pubkey_memory(
                public_key.as_deref(),
                &private_key,
                passphrase.as_deref(),
            )
        })
        .await
    }

    pub async fn authenticate_keyboard_interactive(&self) -> Result<(), SshError> {
        self.run(|s| s.authenticate_keyboard_interactive()).await
    }

    pub async fn authenticate_none(&self) -> Result<(), SshError> {
        self.run(|s| s.authenticate_none()).await
    }
}
