//! Authentication against the CDSE identity service.
//!
//! This module provides:
//! - `CredentialStore`: OS-level credential storage via keyring
//! - `CredentialResolver`: pluggable password resolution (keyring first,
//!   masked prompt as fallback) so headless environments can supply a stub
//! - `TokenManager`: refresh/access token lifecycle, including silent
//!   re-authentication when the refresh token expires mid-batch

pub mod credentials;
pub mod tokens;

pub use credentials::{CredentialResolver, CredentialStore, StoredOrPromptResolver};
pub use tokens::{AccessTokenSource, AuthError, HttpIdentity, IdentityService, TokenManager, TokenPair};
