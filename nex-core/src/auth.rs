//! Signed tokens for nex
//!
//! Two stateless JWT variants share one claims shape and are told apart by
//! their purpose:
//! - Login token: long-lived (30 days), exchanged over HTTP for session tokens
//! - Session token: short-lived (20 min), presented in-band on the socket
//!
//! Validation is a pure function of the token bytes, the shared secret and
//! the current time. Callers decide which purpose they accept.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default login token lifetime: 30 days
pub const LOGIN_TOKEN_TTL: u64 = 30 * 24 * 60 * 60;

/// Default session token lifetime: 20 minutes
pub const SESSION_TOKEN_TTL: u64 = 20 * 60;

/// JWT claims embedded in tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// What the token may be used for
    #[serde(rename = "type")]
    pub purpose: TokenPurpose,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Login,
    #[serde(alias = "websocket")]
    Session,
}

impl std::fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenPurpose::Login => f.write_str("login"),
            TokenPurpose::Session => f.write_str("session"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token encoding failed: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Malformed token")]
    MalformedToken,

    #[error("Token has expired")]
    Expired,

    #[error("Invalid token purpose: expected {expected}, got {got}")]
    WrongPurpose { expected: TokenPurpose, got: TokenPurpose },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Password hashing failed: {0}")]
    HashError(String),
}

/// Anything that can check a token string.
///
/// Sessions only ever see this trait, so tests can swap in a fake.
pub trait TokenValidator: Send + Sync {
    /// Verify signature and expiry. Does not check the purpose.
    fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// HS256 token issuer and validator
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    login_ttl: u64,   // seconds
    session_ttl: u64, // seconds
}

impl JwtAuth {
    /// Create new token handler
    ///
    /// # Arguments
    /// * `secret` - HMAC secret for signing tokens (should be >= 32 bytes)
    /// * `login_ttl` - Login token lifetime in seconds (default: 30 days)
    /// * `session_ttl` - Session token lifetime in seconds (default: 20 min)
    pub fn new(secret: &[u8], login_ttl: Option<u64>, session_ttl: Option<u64>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            login_ttl: login_ttl.unwrap_or(LOGIN_TOKEN_TTL),
            session_ttl: session_ttl.unwrap_or(SESSION_TOKEN_TTL),
        }
    }

    /// Issue a token for `subject` starting now
    pub fn issue(&self, subject: &str, purpose: TokenPurpose) -> Result<String, AuthError> {
        self.issue_at(subject, purpose, unix_now())
    }

    /// Issue a token as if the current time were `now`
    pub fn issue_at(&self, subject: &str, purpose: TokenPurpose, now: u64) -> Result<String, AuthError> {
        let ttl = match purpose {
            TokenPurpose::Login => self.login_ttl,
            TokenPurpose::Session => self.session_ttl,
        };

        let claims = Claims {
            sub: subject.to_string(),
            exp: now + ttl,
            iat: now,
            purpose,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// Validate a token against the wall clock
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_at(token, unix_now())
    }

    /// Validate a token as if the current time were `now`.
    ///
    /// Expiry is strict: a token is dead at `exp`, not one second later.
    pub fn validate_at(&self, token: &str, now: u64) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let token_data =
            decode::<Claims>(token, &self.decoding_key, &validation).map_err(|_| AuthError::MalformedToken)?;

        if now >= token_data.claims.exp {
            return Err(AuthError::Expired);
        }

        Ok(token_data.claims)
    }

    /// Validate and require a specific purpose
    pub fn expect_purpose(&self, token: &str, expected: TokenPurpose) -> Result<Claims, AuthError> {
        let claims = self.validate(token)?;

        if claims.purpose != expected {
            return Err(AuthError::WrongPurpose {
                expected,
                got: claims.purpose,
            });
        }

        Ok(claims)
    }
}

impl TokenValidator for JwtAuth {
    fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        JwtAuth::validate(self, token)
    }
}

/// Generate a secure random secret for JWT signing
pub fn generate_secret() -> [u8; 32] {
    use rand::Rng;
    rand::thread_rng().r#gen()
}

/// Hash a password into an argon2 PHC string
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::HashError(e.to_string()))
}

/// Check a password against an argon2 PHC string
pub fn verify_password(password: &str, phc: &str) -> Result<(), AuthError> {
    let parsed = PasswordHash::new(phc).map_err(|e| AuthError::HashError(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AuthError::InvalidCredentials)
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
