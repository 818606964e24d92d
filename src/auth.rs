//! Identity & credential verification (spec.md §4.1, C1).
//!
//! Two credential shapes are accepted: a session JWT minted by
//! `POST /auth/login`, or a raw API key presented as `Authorization: Bearer`,
//! `X-API-Key`, or `?api_key=`. Both resolve to a [`Principal`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::cache::{keys, ttl, Cache};
use crate::db::{ApiKeyRepository, UserRepository};
use crate::error::{GatewayError, Result};
use crate::types::{Principal, User};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Where a credential may be presented, checked in this precedence order.
pub enum Credential {
    Bearer(String),
    ApiKeyHeader(String),
    ApiKeyQuery(String),
}

pub struct AuthService {
    users: Arc<UserRepository>,
    api_keys: Arc<ApiKeyRepository>,
    cache: Arc<Cache>,
    jwt_secret: String,
    session_ttl: Duration,
}

impl AuthService {
    pub fn new(
        users: Arc<UserRepository>,
        api_keys: Arc<ApiKeyRepository>,
        cache: Arc<Cache>,
        jwt_secret: String,
    ) -> Self {
        Self {
            users,
            api_keys,
            cache,
            jwt_secret,
            session_ttl: Duration::hours(24),
        }
    }

    /// `POST /auth/login`: verify a password and mint a session JWT.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let user = self
            .users
            .find_by_username(username)
            .await?
            .ok_or(GatewayError::InvalidCredentials)?;

        let hash = user
            .password_hash
            .as_deref()
            .ok_or(GatewayError::InvalidCredentials)?;
        let valid = bcrypt::verify(password, hash).map_err(|e| GatewayError::Internal(e.to_string()))?;
        if !valid {
            return Err(GatewayError::InvalidCredentials);
        }
        if !user.can_authenticate() {
            return Err(GatewayError::UserInactive);
        }

        self.mint_session(user.id)
    }

    /// `POST /auth/register`: create a new active user and mint a session
    /// for them immediately, mirroring `login`'s post-auth result shape.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<String> {
        if self.users.find_by_username(username).await?.is_some() {
            return Err(GatewayError::InvalidRequest(format!(
                "username {username} already taken"
            )));
        }
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let user = self.users.create(username, email, &hash).await?;
        self.mint_session(user.id)
    }

    /// `POST /auth/change-password`: re-verify the current password before
    /// persisting a new hash, then evict the cached [`User`] so the next
    /// authentication re-reads it from the database (spec.md §4.4).
    pub async fn change_password(&self, user_id: i64, old_password: &str, new_password: &str) -> Result<()> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(GatewayError::InvalidCredentials)?;

        let hash = user
            .password_hash
            .as_deref()
            .ok_or(GatewayError::InvalidCredentials)?;
        let valid = bcrypt::verify(old_password, hash).map_err(|e| GatewayError::Internal(e.to_string()))?;
        if !valid {
            return Err(GatewayError::InvalidCredentials);
        }

        let new_hash = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        self.users.update_password(user_id, &new_hash).await?;
        self.cache.delete(&[keys::user(user_id)]).await;
        Ok(())
    }

    pub fn mint_session(&self, user_id: i64) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.session_ttl).timestamp(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Resolve a presented [`Credential`] to an authenticated [`Principal`]
    /// (spec.md §4.1). Enforces the active/balance admission gate on the
    /// owning user regardless of which credential shape was used.
    pub async fn authenticate(&self, credential: Credential) -> Result<Principal> {
        match credential {
            Credential::Bearer(token) if looks_like_jwt(&token) => self.authenticate_session(&token).await,
            Credential::Bearer(token) => self.authenticate_api_key(&token).await,
            Credential::ApiKeyHeader(key) | Credential::ApiKeyQuery(key) => {
                self.authenticate_api_key(&key).await
            }
        }
    }

    async fn authenticate_session(&self, token: &str) -> Result<Principal> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .map_err(|_| GatewayError::InvalidCredentials)?;

        let user_id: i64 = data
            .claims
            .sub
            .parse()
            .map_err(|_| GatewayError::InvalidCredentials)?;
        let user = self.load_user(user_id).await?;
        gate_user(&user)?;
        Ok(Principal { user, api_key: None })
    }

    async fn authenticate_api_key(&self, raw_key: &str) -> Result<Principal> {
        if raw_key.is_empty() {
            return Err(GatewayError::MissingCredentials);
        }
        let hash = hash_api_key(raw_key);

        let cache_key = keys::apikey(&hash);
        let api_key = match self.cache.get(&cache_key).await {
            Some(k) => k,
            None => {
                let found = self
                    .api_keys
                    .find_by_hash(&hash)
                    .await?
                    .ok_or(GatewayError::InvalidCredentials)?;
                self.cache.set(&cache_key, &found, ttl::APIKEY).await;
                found
            }
        };

        // Constant-time re-check against the looked-up hash, defending
        // against any future lookup path that doesn't use an indexed equality.
        if !bool::from(hash.as_bytes().ct_eq(api_key.key_hash.as_bytes())) {
            return Err(GatewayError::InvalidCredentials);
        }
        if !api_key.is_usable() {
            return Err(GatewayError::CredentialRevoked);
        }
        if let Some(exp) = api_key.expires_at {
            if exp <= Utc::now() {
                return Err(GatewayError::CredentialExpired);
            }
        }

        let user = self.load_user(api_key.user_id).await?;
        gate_user(&user)?;

        self.api_keys.touch_last_used(api_key.id).await;

        Ok(Principal {
            user,
            api_key: Some(api_key),
        })
    }

    async fn load_user(&self, user_id: i64) -> Result<User> {
        let cache_key = keys::user(user_id);
        if let Some(user) = self.cache.get(&cache_key).await {
            return Ok(user);
        }
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(GatewayError::InvalidCredentials)?;
        self.cache.set(&cache_key, &user, ttl::USER).await;
        Ok(user)
    }
}

fn gate_user(user: &User) -> Result<()> {
    if !user.can_authenticate() {
        if user.status != crate::types::UserStatus::Active {
            return Err(GatewayError::UserInactive);
        }
        return Err(GatewayError::InsufficientBalance);
    }
    Ok(())
}

pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn looks_like_jwt(token: &str) -> bool {
    token.matches('.').count() == 2
}

/// Extract the credential from an incoming request's headers/query in the
/// precedence order `Authorization: Bearer` > `X-API-Key` > `?api_key=`.
pub fn extract_credential(
    auth_header: Option<&str>,
    api_key_header: Option<&str>,
    api_key_query: Option<&str>,
) -> Option<Credential> {
    if let Some(h) = auth_header {
        if let Some(token) = h.strip_prefix("Bearer ") {
            return Some(Credential::Bearer(token.to_string()));
        }
    }
    if let Some(k) = api_key_header {
        return Some(Credential::ApiKeyHeader(k.to_string()));
    }
    if let Some(k) = api_key_query {
        return Some(Credential::ApiKeyQuery(k.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_api_key_is_deterministic() {
        assert_eq!(hash_api_key("sk-abc123"), hash_api_key("sk-abc123"));
        assert_ne!(hash_api_key("sk-abc123"), hash_api_key("sk-abc124"));
    }

    #[test]
    fn test_looks_like_jwt() {
        assert!(looks_like_jwt("aaa.bbb.ccc"));
        assert!(!looks_like_jwt("sk-live-abcdef1234567890"));
    }

    #[test]
    fn test_extract_credential_precedence() {
        let cred = extract_credential(Some("Bearer tok123"), Some("sk-xyz"), None);
        assert!(matches!(cred, Some(Credential::Bearer(t)) if t == "tok123"));

        let cred = extract_credential(None, Some("sk-xyz"), Some("sk-query"));
        assert!(matches!(cred, Some(Credential::ApiKeyHeader(k)) if k == "sk-xyz"));

        let cred = extract_credential(None, None, Some("sk-query"));
        assert!(matches!(cred, Some(Credential::ApiKeyQuery(k)) if k == "sk-query"));

        assert!(extract_credential(None, None, None).is_none());
    }
}
