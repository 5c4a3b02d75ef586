//! Vault-backed session attachment and auto-rotation.
//!
//! The layer sits between the dispatcher and the vault client: before the
//! handler runs it resolves the presented token into a [`Session`]; after
//! the handler completes it optionally rotates the token and stamps the
//! fresh one onto the response. A missing, expired, or rotated-out token is
//! never an error: the request just proceeds without a session.

use log::warn;

use crate::models::settings::XemsSettings;
use crate::vault::client::VaultClientError;
use crate::vault::store::VaultError;
use crate::vault::VaultClient;

use super::message::{Request, Response, Session};

/// Session attachment configuration plus the vault connection.
#[derive(Clone)]
pub struct SessionLayer {
    client: VaultClient,
    settings: XemsSettings,
}

impl SessionLayer {
    pub fn new(client: VaultClient, settings: XemsSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &XemsSettings {
        &self.settings
    }

    pub fn client(&self) -> &VaultClient {
        &self.client
    }

    /// Token presented by the request: header first, cookie second.
    pub fn extract_token(&self, req: &Request) -> Option<String> {
        if let Some(token) = req.header(&self.settings.header_name) {
            return Some(token.to_string());
        }
        req.cookie(&self.settings.cookie_name).map(str::to_string)
    }

    /// Resolves the presented token and attaches the session to the request.
    ///
    /// Vault misses (`NotFound`, `Expired`, `Rotated`) leave the request
    /// session-less; transport failures do the same but are logged, since a
    /// dead sidecar is an operational problem rather than a client one.
    pub async fn attach(&self, req: &mut Request) {
        let Some(token) = self.extract_token(req) else {
            return;
        };
        match self.client.read(&token).await {
            Ok(data) => {
                req.session = Some(Session {
                    token,
                    data: data.into(),
                });
            }
            Err(VaultClientError::Vault(
                VaultError::NotFound | VaultError::Expired | VaultError::Rotated,
            )) => {}
            Err(e) => {
                warn!("Session attach failed, continuing without session: {}", e);
            }
        }
    }

    /// Post-handler rotation: installs a fresh token on the response while
    /// the old one rides out its grace window.
    ///
    /// A concurrent rotation of the same token (`Rotated`) is not an error;
    /// the losing request simply keeps serving the old token, which stays
    /// readable for the grace period.
    pub async fn finalize(&self, req: &Request, res: &mut Response) {
        if !self.settings.auto_rotation {
            return;
        }
        let Some(ref session) = req.session else {
            return;
        };
        match self.client.rotate(&session.token).await {
            Ok(new_token) => self.stamp(res, &new_token),
            Err(VaultClientError::Vault(VaultError::Rotated)) => {}
            Err(VaultClientError::Vault(VaultError::NotFound | VaultError::Expired)) => {}
            Err(e) => warn!("Session rotation failed: {}", e),
        }
    }

    /// Writes the token onto the response as both header and cookie.
    pub fn stamp(&self, res: &mut Response, token: &str) {
        res.set_header(&self.settings.header_name, token);
        res.headers.push((
            "set-cookie".to_string(),
            format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                self.settings.cookie_name, token
            ),
        ));
    }
}
