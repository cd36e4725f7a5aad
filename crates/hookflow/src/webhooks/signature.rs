//! Inbound webhook authentication.
//!
//! Each platform is configured with one [`AuthMode`]: either a shared secret
//! echoed back in a header, or an HMAC-SHA256 signature over the raw body.
//! All comparisons are constant time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::webhooks::platform::Platform;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    SharedSecret,
    HmacSha256(SignatureEncoding),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported auth mode {0:?} (expected header, hmac-sha256-hex or hmac-sha256-base64)")]
pub struct InvalidAuthMode(pub String);

impl FromStr for AuthMode {
    type Err = InvalidAuthMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "header" | "shared-secret" => Ok(AuthMode::SharedSecret),
            "hmac-sha256-hex" | "hmac-sha256" => Ok(AuthMode::HmacSha256(SignatureEncoding::Hex)),
            "hmac-sha256-base64" => Ok(AuthMode::HmacSha256(SignatureEncoding::Base64)),
            _ => Err(InvalidAuthMode(s.to_string())),
        }
    }
}

/// Credentials for one platform. A missing secret leaves the platform
/// misconfigured: every request to it is refused.
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformAuth {
    pub mode: AuthMode,
    pub secret: Option<String>,
}

impl PlatformAuth {
    pub fn new(mode: AuthMode, secret: Option<String>) -> Self {
        Self { mode, secret }
    }

    pub fn shared_secret(secret: impl Into<String>) -> Self {
        Self::new(AuthMode::SharedSecret, Some(secret.into()))
    }

    pub fn hmac(secret: impl Into<String>, encoding: SignatureEncoding) -> Self {
        Self::new(AuthMode::HmacSha256(encoding), Some(secret.into()))
    }
}

impl fmt::Debug for PlatformAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformAuth")
            .field("mode", &self.mode)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing {header} header")]
    Missing { platform: Platform, header: &'static str },
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),
    #[error("invalid signature")]
    InvalidSignature(Platform),
    #[error("webhook authentication is not configured for {0}")]
    Misconfigured(Platform),
}

impl AuthError {
    /// Short machine-readable reason, used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing { .. } => "missing_header",
            AuthError::UnknownPlatform(_) => "unknown_platform",
            AuthError::InvalidSignature(_) => "invalid_signature",
            AuthError::Misconfigured(_) => "misconfigured",
        }
    }

    /// Misconfiguration is our fault, not the sender's.
    pub fn is_server_error(&self) -> bool {
        matches!(self, AuthError::Misconfigured(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    platforms: HashMap<Platform, PlatformAuth>,
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: Platform, auth: PlatformAuth) -> Self {
        self.platforms.insert(platform, auth);
        self
    }

    /// Authenticates a request addressed to `platform` (the raw route
    /// segment). Returns the resolved platform on success.
    pub fn verify(&self, platform: &str, headers: &HeaderMap, body: &[u8]) -> Result<Platform, AuthError> {
        let result = self.check(platform, headers, body);
        if let Err(err) = &result {
            warn!(platform, reason = err.reason(), "webhook rejected");
        }
        result
    }

    fn check(&self, platform: &str, headers: &HeaderMap, body: &[u8]) -> Result<Platform, AuthError> {
        let platform: Platform = platform
            .parse()
            .map_err(|_| AuthError::UnknownPlatform(platform.to_string()))?;

        let auth = self
            .platforms
            .get(&platform)
            .ok_or(AuthError::Misconfigured(platform))?;
        let secret = auth
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::Misconfigured(platform))?;

        let header = match auth.mode {
            AuthMode::SharedSecret => platform.secret_header(),
            AuthMode::HmacSha256(_) => platform.signature_header(),
        };
        let provided = headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::Missing { platform, header })?;

        let ok = match auth.mode {
            AuthMode::SharedSecret => bool::from(provided.as_bytes().ct_eq(secret.as_bytes())),
            AuthMode::HmacSha256(encoding) => verify_hmac(secret.as_bytes(), body, provided, encoding),
        };

        if ok {
            Ok(platform)
        } else {
            Err(AuthError::InvalidSignature(platform))
        }
    }
}

fn verify_hmac(secret: &[u8], body: &[u8], provided: &str, encoding: SignatureEncoding) -> bool {
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let decoded = match encoding {
        SignatureEncoding::Hex => hex::decode(provided).ok(),
        SignatureEncoding::Base64 => BASE64.decode(provided).ok(),
    };
    let Some(signature) = decoded else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Signs `body` the way a sender in HMAC mode would.
pub fn compute_signature(secret: &[u8], body: &[u8], encoding: SignatureEncoding) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    let bytes = mac.finalize().into_bytes();
    match encoding {
        SignatureEncoding::Hex => hex::encode(bytes),
        SignatureEncoding::Base64 => BASE64.encode(bytes),
    }
}
