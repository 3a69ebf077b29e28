// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Player session token verification.
//!
//! Tokens are HS256 JWTs minted by the login service. The host only needs
//! the claims below; anything else in the token is ignored.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from token verification.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token has expired.
    #[error("session token expired")]
    Expired,

    /// The token is malformed or its signature does not match.
    #[error("invalid session token: {0}")]
    Invalid(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        }
    }
}

/// Identity carried by a verified session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    /// Instance the player may join.
    pub instance_id: String,
    /// World of that instance.
    pub world_id: String,
    /// Player id.
    #[serde(rename = "sub")]
    pub player_id: String,
    /// Display name.
    #[serde(default)]
    pub nickname: Option<String>,
    /// Character chosen at login.
    #[serde(default)]
    pub character_id: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// Validates a signed session token into a player identity.
pub trait AuthVerifier: Send + Sync {
    /// Verify `token` and return its claims.
    fn verify(&self, token: &str) -> Result<SessionClaims, AuthError>;
}

/// HMAC-SHA256 JWT verifier.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Mint a token for `claims` (operator tooling and tests).
    pub fn issue(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }
}

impl AuthVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}
