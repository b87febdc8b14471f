//! Token lifecycle management for the CDSE identity service.
//!
//! Access tokens are short-lived relative to a multi-hour download batch, so
//! every download attempt exchanges the refresh token for a fresh access
//! token just-in-time. The refresh token itself can also expire mid-batch;
//! when the identity service answers `invalid_grant`, the manager silently
//! re-authenticates with the resolved password instead of aborting the run.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::credentials::CredentialResolver;

const IDENTITY_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";

const CLIENT_ID: &str = "cdse-public";

/// Cap on silent re-authentication attempts within a single token exchange.
const MAX_REAUTH_ATTEMPTS: u32 = 11;

/// Maximum length for identity error bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 300;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Identity service rejected the credentials: {0}")]
    InvalidCredentials(String),

    #[error("Refresh token rejected (invalid_grant)")]
    InvalidGrant,

    #[error("Token exchange rejected: {0}")]
    Rejected(String),

    #[error("Re-authentication gave up after {0} attempts")]
    ReauthExhausted(u32),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from identity service: {0}")]
    InvalidResponse(String),

    #[error("Could not resolve a password: {0}")]
    Resolver(String),
}

/// Refresh/access token pair issued by the password grant.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrantErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// The identity service's two grant flows. Split out as a trait so the
/// re-authentication logic can be exercised without a network.
pub trait IdentityService {
    /// Exchange username/password for a refresh/access token pair.
    async fn password_grant(&self, username: &str, password: &str)
        -> Result<TokenPair, AuthError>;

    /// Exchange a refresh token for a new access token. The server may also
    /// rotate the refresh token; when it does, the new one is returned.
    async fn refresh_grant(
        &self,
        refresh_token: &str,
    ) -> Result<(String, Option<String>), AuthError>;
}

/// `IdentityService` over HTTP, posting form-encoded grants to CDSE.
#[derive(Clone)]
pub struct HttpIdentity {
    client: Client,
}

impl HttpIdentity {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl IdentityService for HttpIdentity {
    async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, AuthError> {
        let response = self
            .client
            .post(IDENTITY_URL)
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("client_id", CLIENT_ID),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::InvalidCredentials(rejection_detail(
                status, &body,
            )));
        }

        let grant: GrantResponse = response.json().await?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            AuthError::InvalidResponse("password grant response missing refresh_token".to_string())
        })?;
        Ok(TokenPair {
            access_token: grant.access_token,
            refresh_token,
        })
    }

    async fn refresh_grant(
        &self,
        refresh_token: &str,
    ) -> Result<(String, Option<String>), AuthError> {
        let response = self
            .client
            .post(IDENTITY_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", CLIENT_ID),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_refresh_rejection(status, &body));
        }

        let grant: GrantResponse = response.json().await?;
        Ok((grant.access_token, grant.refresh_token))
    }
}

/// Distinguish an expired/revoked refresh token from every other rejection.
fn classify_refresh_rejection(status: StatusCode, body: &str) -> AuthError {
    if let Ok(parsed) = serde_json::from_str::<GrantErrorBody>(body) {
        if parsed.error.as_deref() == Some("invalid_grant") {
            return AuthError::InvalidGrant;
        }
        if let Some(description) = parsed.error_description {
            return AuthError::Rejected(format!("{} ({})", description, status));
        }
    }
    AuthError::Rejected(rejection_detail(status, body))
}

fn rejection_detail(status: StatusCode, body: &str) -> String {
    let quoted: String = body.chars().take(MAX_ERROR_BODY_LENGTH).collect();
    format!("status {}: {}", status, quoted)
}

/// Something that can produce a valid access token on demand. The batch
/// orchestrator depends on this seam rather than on `TokenManager` directly.
pub trait AccessTokenSource {
    async fn access_token(&mut self) -> Result<String, AuthError>;
}

/// Holds the current token pair and drives the two grant flows.
pub struct TokenManager<I, R> {
    identity: I,
    resolver: R,
    username: String,
    tokens: Option<TokenPair>,
}

impl<I: IdentityService, R: CredentialResolver> TokenManager<I, R> {
    pub fn new(identity: I, resolver: R, username: String) -> Self {
        Self {
            identity,
            resolver,
            username,
            tokens: None,
        }
    }

    /// Initial password-grant login. `InvalidCredentials` here means the
    /// supplied password is wrong; the caller discards it and re-prompts.
    pub async fn login(&mut self, password: &str) -> Result<(), AuthError> {
        let pair = self.identity.password_grant(&self.username, password).await?;
        self.tokens = Some(pair);
        Ok(())
    }

    /// Current refresh token, if a login has succeeded.
    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }

    async fn reauthenticate(&mut self) -> Result<(), AuthError> {
        let password = self
            .resolver
            .resolve(&self.username)
            .map_err(|e| AuthError::Resolver(e.to_string()))?;
        let pair = self.identity.password_grant(&self.username, &password).await?;
        self.tokens = Some(pair);
        Ok(())
    }
}

impl<I: IdentityService, R: CredentialResolver> AccessTokenSource for TokenManager<I, R> {
    /// Exchange the refresh token for a fresh access token, replacing the
    /// stored one. An `invalid_grant` rejection triggers a full password
    /// re-authentication; the loop is bounded so a service that keeps
    /// rejecting freshly issued refresh tokens cannot spin forever.
    async fn access_token(&mut self) -> Result<String, AuthError> {
        for attempt in 0..MAX_REAUTH_ATTEMPTS {
            let refresh_token = match &self.tokens {
                Some(pair) => pair.refresh_token.clone(),
                None => {
                    self.reauthenticate().await?;
                    continue;
                }
            };

            match self.identity.refresh_grant(&refresh_token).await {
                Ok((access_token, rotated)) => {
                    if let Some(pair) = self.tokens.as_mut() {
                        pair.access_token = access_token.clone();
                        if let Some(refresh) = rotated {
                            pair.refresh_token = refresh;
                        }
                    }
                    debug!("access token refreshed");
                    return Ok(access_token);
                }
                Err(AuthError::InvalidGrant) => {
                    warn!(attempt = attempt + 1, "refresh token expired, re-authenticating");
                    self.reauthenticate().await?;
                }
                Err(other) => return Err(other),
            }
        }
        Err(AuthError::ReauthExhausted(MAX_REAUTH_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct StaticResolver(&'static str);

    impl CredentialResolver for StaticResolver {
        fn resolve(&self, _username: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    /// Identity stub: scripted refresh-grant outcomes, counted password grants.
    struct ScriptedIdentity {
        refresh_outcomes: RefCell<VecDeque<Result<(String, Option<String>), AuthError>>>,
        password_grants: RefCell<u32>,
    }

    impl ScriptedIdentity {
        fn new(outcomes: Vec<Result<(String, Option<String>), AuthError>>) -> Self {
            Self {
                refresh_outcomes: RefCell::new(outcomes.into()),
                password_grants: RefCell::new(0),
            }
        }

        fn password_grants(&self) -> u32 {
            *self.password_grants.borrow()
        }
    }

    impl IdentityService for &ScriptedIdentity {
        async fn password_grant(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<TokenPair, AuthError> {
            *self.password_grants.borrow_mut() += 1;
            Ok(TokenPair {
                access_token: "fresh-access".to_string(),
                refresh_token: "fresh-refresh".to_string(),
            })
        }

        async fn refresh_grant(
            &self,
            _refresh_token: &str,
        ) -> Result<(String, Option<String>), AuthError> {
            self.refresh_outcomes
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(AuthError::InvalidGrant))
        }
    }

    #[tokio::test]
    async fn refresh_replaces_access_token_and_rotated_refresh_token() {
        let identity = ScriptedIdentity::new(vec![Ok((
            "access-2".to_string(),
            Some("refresh-2".to_string()),
        ))]);
        let mut manager =
            TokenManager::new(&identity, StaticResolver("pw"), "alice".to_string());
        manager.login("pw").await.unwrap();

        let token = manager.access_token().await.unwrap();
        assert_eq!(token, "access-2");
        assert_eq!(manager.refresh_token(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn invalid_grant_triggers_silent_reauth_then_refresh() {
        let identity = ScriptedIdentity::new(vec![
            Err(AuthError::InvalidGrant),
            Ok(("after-reauth".to_string(), None)),
        ]);
        let mut manager =
            TokenManager::new(&identity, StaticResolver("pw"), "alice".to_string());
        manager.login("pw").await.unwrap();
        assert_eq!(identity.password_grants(), 1);

        let token = manager.access_token().await.unwrap();
        assert_eq!(token, "after-reauth");
        assert_eq!(identity.password_grants(), 2);
    }

    #[tokio::test]
    async fn persistent_invalid_grant_is_bounded() {
        // Every refresh grant fails; the manager must re-authenticate at most
        // 11 times and then give up instead of looping forever.
        let identity = ScriptedIdentity::new(vec![]);
        let mut manager =
            TokenManager::new(&identity, StaticResolver("pw"), "alice".to_string());

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::ReauthExhausted(11)));
        assert_eq!(identity.password_grants(), 11);
    }

    #[tokio::test]
    async fn non_invalid_grant_rejection_is_immediately_fatal() {
        let identity = ScriptedIdentity::new(vec![Err(AuthError::Rejected(
            "account disabled".to_string(),
        ))]);
        let mut manager =
            TokenManager::new(&identity, StaticResolver("pw"), "alice".to_string());
        manager.login("pw").await.unwrap();

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
        // No re-authentication beyond the initial login
        assert_eq!(identity.password_grants(), 1);
    }

    #[test]
    fn invalid_grant_body_is_classified() {
        let err = classify_refresh_rejection(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token is not active"}"#,
        );
        assert!(matches!(err, AuthError::InvalidGrant));
    }

    #[test]
    fn other_error_bodies_keep_their_description() {
        let err = classify_refresh_rejection(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_client","error_description":"Invalid client"}"#,
        );
        match err {
            AuthError::Rejected(detail) => assert!(detail.contains("Invalid client")),
            other => panic!("unexpected classification: {:?}", other),
        }
    }
}
