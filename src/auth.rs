//! Static user directory and bearer-token sessions.
//!
//! Users live in memory with Argon2 password hashes in PHC string form. A
//! successful login issues two opaque random tokens: a short-lived access
//! token that resolves to a [`Principal`], and a longer-lived refresh token
//! that can only be traded for a new access token.

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::ApiError;

const REFRESH_TTL_DAYS: i64 = 7;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    User,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub roles: Vec<Role>,
    pub active: bool,
}

impl User {
    pub fn new(id: u32, username: &str, password: &str, roles: Vec<Role>) -> Result<Self, ApiError> {
        Ok(Self {
            id,
            username: username.to_string(),
            email: format!("{username}@platform-ops.local"),
            password_hash: hash_password(password)?,
            roles,
            active: true,
        })
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: u32,
    pub username: String,
    pub email: String,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }

    // Deploy mutations need admin or operator
    pub fn require_operator(&self) -> Result<(), ApiError> {
        if self.has_any_role(&[Role::Admin, Role::Operator]) {
            return Ok(());
        }
        warn!(user = %self.username, "insufficient permissions");
        Err(ApiError::Forbidden)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: u32,
    kind: TokenKind,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: Principal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedToken {
    pub token: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub valid: bool,
    pub user: Principal,
    pub expires_at: DateTime<Utc>,
}

pub struct UserDirectory {
    users: DashMap<u32, User>,
    sessions: DashMap<String, Session>,
    token_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl UserDirectory {
    pub fn new(users: Vec<User>, token_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id, u)).collect(),
            sessions: DashMap::new(),
            token_ttl,
            refresh_ttl: Duration::days(REFRESH_TTL_DAYS),
            clock,
        }
    }

    // admin / operator / user, all with password "password123"
    pub fn default_users() -> Result<Vec<User>, ApiError> {
        Ok(vec![
            User::new(1, "admin", "password123", vec![Role::Admin, Role::Operator, Role::User])?,
            User::new(2, "operator", "password123", vec![Role::Operator, Role::User])?,
            User::new(3, "user", "password123", vec![Role::User])?,
        ])
    }

    pub fn login(&self, username: &str, password: &str) -> Result<IssuedToken, ApiError> {
        // clone out so the shard lock is not held while hashing
        let user = self
            .users
            .iter()
            .find(|u| u.username == username || u.email == username)
            .map(|u| u.value().clone())
            .ok_or_else(|| {
                warn!(username, reason = "user not found", "login attempt failed");
                ApiError::InvalidCredentials
            })?;

        if !user.active {
            warn!(username, reason = "account disabled", "login attempt failed");
            return Err(ApiError::AccountDisabled);
        }

        if !verify_password(password, &user.password_hash)? {
            warn!(username, reason = "bad password", "login attempt failed");
            return Err(ApiError::InvalidCredentials);
        }

        let token = self.issue(user.id, TokenKind::Access);
        let refresh_token = self.issue(user.id, TokenKind::Refresh);
        info!(user = %user.username, "user logged in");

        Ok(IssuedToken {
            token,
            refresh_token,
            expires_in: self.token_ttl.num_seconds(),
            user: principal_of(&user),
        })
    }

    /// Trades a refresh token for a new access token. The refresh token stays
    /// valid until its own expiry.
    pub fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, ApiError> {
        let (principal, _) = self
            .session_user(refresh_token, TokenKind::Refresh)
            .ok_or_else(|| {
                warn!(token = %token_fingerprint(refresh_token), "token refresh failed");
                ApiError::Unauthenticated("Invalid or expired refresh token")
            })?;

        let token = self.issue(principal.id, TokenKind::Access);
        info!(user = %principal.username, "token refreshed");
        Ok(RefreshedToken {
            token,
            expires_in: self.token_ttl.num_seconds(),
        })
    }

    pub fn verify(&self, token: &str) -> Option<TokenInfo> {
        self.session_user(token, TokenKind::Access)
            .map(|(user, expires_at)| TokenInfo {
                valid: true,
                user,
                expires_at,
            })
    }

    pub fn change_password(
        &self,
        principal: &Principal,
        current: &str,
        new: &str,
    ) -> Result<(), ApiError> {
        if current.is_empty() || new.is_empty() {
            return Err(ApiError::Validation(
                "Current and new passwords are required".to_string(),
            ));
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(ApiError::Validation(format!(
                "New password must be at least {MIN_PASSWORD_LEN} characters long"
            )));
        }

        let stored = self
            .users
            .get(&principal.id)
            .map(|u| u.password_hash.clone())
            .ok_or(ApiError::Unauthenticated("Invalid or expired token"))?;

        if !verify_password(current, &stored)? {
            warn!(user = %principal.username, "password change rejected");
            return Err(ApiError::WrongPassword);
        }

        let hash = hash_password(new)?;
        if let Some(mut user) = self.users.get_mut(&principal.id) {
            user.password_hash = hash;
        }
        info!(user = %principal.username, "password changed");
        Ok(())
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn resolve(&self, token: &str) -> Option<Principal> {
        self.session_user(token, TokenKind::Access)
            .map(|(principal, _)| principal)
    }

    /// Resolves the bearer token of a request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let token = bearer_token(headers).ok_or(ApiError::Unauthenticated("No token provided"))?;
        self.resolve(token).ok_or_else(|| {
            warn!(token = %token_fingerprint(token), "authentication failed");
            ApiError::Unauthenticated("Invalid or expired token")
        })
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    fn issue(&self, user_id: u32, kind: TokenKind) -> String {
        let ttl = match kind {
            TokenKind::Access => self.token_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let token = random_token();
        self.sessions.insert(
            token.clone(),
            Session {
                user_id,
                kind,
                expires_at: self.clock.now() + ttl,
            },
        );
        token
    }

    // Expired sessions are dropped on sight
    fn session_user(&self, token: &str, kind: TokenKind) -> Option<(Principal, DateTime<Utc>)> {
        let now = self.clock.now();
        let session = self.sessions.get(token).map(|s| s.value().clone())?;
        if session.expires_at <= now {
            self.sessions.remove(token);
            return None;
        }
        if session.kind != kind {
            return None;
        }

        self.users
            .get(&session.user_id)
            .filter(|u| u.active)
            .map(|u| (principal_of(&u), session.expires_at))
    }
}

fn principal_of(user: &User) -> Principal {
    Principal {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        roles: user.roles.clone(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, ApiError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| ApiError::Internal(format!("failed to parse password hash: {e}")))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(ApiError::Internal(format!(
            "password verification failed: {e}"
        ))),
    }
}

// Short, non-reversible handle for logs and limiter keys
pub fn token_fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses `name:password:role+role` as given on the command line.
pub fn parse_user_spec(id: u32, spec: &str) -> Result<User, String> {
    let mut parts = spec.splitn(3, ':');
    let (Some(name), Some(password), Some(roles)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected name:password:roles, got '{spec}'"));
    };
    if name.is_empty() || password.is_empty() {
        return Err(format!("empty name or password in '{spec}'"));
    }
    let roles = roles
        .split('+')
        .map(Role::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    User::new(id, name, password, roles).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::HeaderValue;

    fn directory() -> (UserDirectory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dir = UserDirectory::new(
            UserDirectory::default_users().unwrap(),
            Duration::hours(24),
            clock.clone(),
        );
        (dir, clock)
    }

    fn auth_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn login_and_resolve() {
        let (dir, _clock) = directory();
        let issued = dir.login("operator", "password123").unwrap();
        assert_eq!(issued.token.len(), 64);
        assert_ne!(issued.token, issued.refresh_token);

        let principal = dir.authenticate(&auth_headers(&issued.token)).unwrap();
        assert_eq!(principal.username, "operator");
        assert!(principal.require_operator().is_ok());
    }

    #[test]
    fn passwords_stored_as_salted_phc_strings() {
        let a = User::new(1, "a", "password123", vec![Role::User]).unwrap();
        let b = User::new(2, "b", "password123", vec![Role::User]).unwrap();
        assert!(a.password_hash.starts_with("$argon2"));
        assert_ne!(a.password_hash, b.password_hash);
        assert!(verify_password("password123", &a.password_hash).unwrap());
        assert!(!verify_password("password124", &a.password_hash).unwrap());
    }

    #[test]
    fn bad_password_rejected() {
        let (dir, _clock) = directory();
        assert!(matches!(
            dir.login("admin", "nope"),
            Err(ApiError::InvalidCredentials)
        ));
        assert!(matches!(
            dir.login("ghost", "password123"),
            Err(ApiError::InvalidCredentials)
        ));
    }

    #[test]
    fn plain_user_cannot_deploy() {
        let (dir, _clock) = directory();
        let issued = dir.login("user", "password123").unwrap();
        let principal = dir.resolve(&issued.token).unwrap();
        assert!(matches!(
            principal.require_operator(),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn tokens_expire_and_revoke() {
        let (dir, clock) = directory();
        let a = dir.login("admin", "password123").unwrap();
        let b = dir.login("admin", "password123").unwrap();

        assert!(dir.logout(&a.token));
        assert!(dir.resolve(&a.token).is_none());

        clock.advance(Duration::hours(25));
        assert!(dir.resolve(&b.token).is_none());
    }

    #[test]
    fn refresh_issues_new_access_token() {
        let (dir, clock) = directory();
        let issued = dir.login("operator", "password123").unwrap();

        // refresh tokens are not bearer credentials
        assert!(dir.resolve(&issued.refresh_token).is_none());
        assert!(dir.refresh(&issued.token).is_err());

        clock.advance(Duration::hours(25));
        assert!(dir.resolve(&issued.token).is_none());
        let refreshed = dir.refresh(&issued.refresh_token).unwrap();
        assert_eq!(dir.resolve(&refreshed.token).unwrap().username, "operator");

        clock.advance(Duration::days(7));
        assert!(matches!(
            dir.refresh(&issued.refresh_token),
            Err(ApiError::Unauthenticated(_))
        ));
    }

    #[test]
    fn verify_reports_expiry() {
        let (dir, clock) = directory();
        let issued = dir.login("admin", "password123").unwrap();
        let info = dir.verify(&issued.token).unwrap();
        assert!(info.valid);
        assert_eq!(info.user.username, "admin");
        assert_eq!(info.expires_at, clock.now() + Duration::hours(24));
        assert!(dir.verify("not-a-token").is_none());
    }

    #[test]
    fn change_password_checks_current_and_length() {
        let (dir, _clock) = directory();
        let issued = dir.login("operator", "password123").unwrap();
        let me = issued.user;

        assert!(matches!(
            dir.change_password(&me, "password123", "short"),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            dir.change_password(&me, "wrong-one", "longenough1"),
            Err(ApiError::WrongPassword)
        ));

        dir.change_password(&me, "password123", "longenough1").unwrap();
        assert!(dir.login("operator", "password123").is_err());
        assert!(dir.login("operator", "longenough1").is_ok());
    }

    #[test]
    fn missing_header_is_unauthenticated() {
        let (dir, _clock) = directory();
        assert!(matches!(
            dir.authenticate(&HeaderMap::new()),
            Err(ApiError::Unauthenticated(_))
        ));
    }

    #[test]
    fn purge_drops_expired_sessions() {
        let (dir, clock) = directory();
        dir.login("admin", "password123").unwrap();
        clock.advance(Duration::hours(25));
        dir.login("operator", "password123").unwrap();
        // admin's access token only; its refresh token lives for a week
        assert_eq!(dir.purge_expired(), 1);
    }

    #[test]
    fn user_spec_parsing() {
        let user = parse_user_spec(9, "ci:s3cret:operator+user").unwrap();
        assert_eq!(user.username, "ci");
        assert_eq!(user.roles, vec![Role::Operator, Role::User]);
        assert!(verify_password("s3cret", &user.password_hash).unwrap());

        assert!(parse_user_spec(1, "ci:s3cret").is_err());
        assert!(parse_user_spec(1, "ci:s3cret:root").is_err());
    }
}
