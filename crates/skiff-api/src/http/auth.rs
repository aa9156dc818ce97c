//! Authentication: JWT issuance and validation, password hashing, the
//! bearer middleware, and the `/auth` handlers.
//!
//! Access tokens are short-lived HS256 JWTs; refresh tokens are long-lived
//! JWTs whose `jti` is registered in the store so they can be revoked and
//! rotated. The middleware accepts the bearer in the `Authorization` header
//! or a `token=` query parameter; the latter exists because browser
//! `EventSource` cannot set headers.

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skiff_core::Caller;
use skiff_data::{Role, User};
use uuid::Uuid;

use crate::http::errors::ApiError;
use crate::state::ApiState;

/// Signing and lifetime material for JWTs.
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: ChronoDuration,
    refresh_ttl: ChronoDuration,
}

impl AuthKeys {
    /// Build the key material from the configured secret and lifetimes.
    #[must_use]
    pub fn new(secret: &str, access_ttl: std::time::Duration, refresh_ttl: std::time::Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: ChronoDuration::from_std(access_ttl)
                .unwrap_or_else(|_| ChronoDuration::minutes(15)),
            refresh_ttl: ChronoDuration::from_std(refresh_ttl)
                .unwrap_or_else(|_| ChronoDuration::days(7)),
        }
    }
}

/// JWT claim set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: Uuid,
    /// Role label at issuance time.
    pub role: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Token id; refresh tokens register it for revocation.
    pub jti: String,
    /// `"access"` or `"refresh"`.
    pub typ: String,
}

fn issue(keys: &AuthKeys, user: &User, typ: &str, ttl: ChronoDuration) -> Result<(String, Claims), ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id,
        role: user.role.as_str().to_string(),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
        jti: Uuid::new_v4().to_string(),
        typ: typ.to_string(),
    };
    let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
        .map_err(|err| ApiError::internal(format!("failed to sign token: {err}")))?;
    Ok((token, claims))
}

/// Issue an access token.
pub fn issue_access(keys: &AuthKeys, user: &User) -> Result<String, ApiError> {
    issue(keys, user, "access", keys.access_ttl).map(|(token, _)| token)
}

/// Issue a refresh token, returning the token and its claims (the caller
/// registers the `jti`).
pub fn issue_refresh(keys: &AuthKeys, user: &User) -> Result<(String, Claims), ApiError> {
    issue(keys, user, "refresh", keys.refresh_ttl)
}

/// Decode outcome distinguishing expiry (the client refreshes) from
/// everything else.
pub enum DecodeOutcome {
    /// Token verified.
    Valid(Claims),
    /// Signature fine, lifetime over.
    Expired,
    /// Anything else.
    Invalid,
}

/// Verify a JWT against the key material.
#[must_use]
pub fn decode_token(keys: &AuthKeys, token: &str) -> DecodeOutcome {
    let validation = Validation::new(Algorithm::HS256);
    match decode::<Claims>(token, &keys.decoding, &validation) {
        Ok(data) => DecodeOutcome::Valid(data.claims),
        Err(err) if matches!(err.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
            DecodeOutcome::Expired
        }
        Err(_) => DecodeOutcome::Invalid,
    }
}

/// Hash a password with Argon2id.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ApiError::internal(format!("failed to hash password: {err}")))
}

/// Verify a password against a stored hash.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

fn bearer_from(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Middleware resolving `(user_id, role)` into request extensions.
pub(crate) async fn require_auth(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TokenQuery>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_from(&request)
        .or(query.token)
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let claims = match decode_token(&state.keys, &token) {
        DecodeOutcome::Valid(claims) => claims,
        DecodeOutcome::Expired => {
            return Err(ApiError::unauthorized("token expired").with_code("TOKEN_EXPIRED"));
        }
        DecodeOutcome::Invalid => return Err(ApiError::unauthorized("invalid bearer token")),
    };
    if claims.typ != "access" {
        return Err(ApiError::unauthorized("invalid bearer token"));
    }
    let role = Role::parse(&claims.role)
        .map_err(|_| ApiError::unauthorized("invalid bearer token"))?;

    request.extensions_mut().insert(Caller {
        user_id: claims.sub,
        role,
    });
    Ok(next.run(request).await)
}

/// Middleware requiring the operator role; layered inside `require_auth`.
pub(crate) async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let caller = request
        .extensions()
        .get::<Caller>()
        .copied()
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    if !caller.is_admin() {
        return Err(ApiError::forbidden("admin access required"));
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegisterRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshRequest {
    refresh_token: String,
}

fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "role": user.role,
        "created_at": user.created_at,
    })
}

async fn issue_pair(state: &ApiState, user: &User) -> Result<Value, ApiError> {
    let access_token = issue_access(&state.keys, user)?;
    let (refresh_token, claims) = issue_refresh(&state.keys, user)?;
    let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);
    state
        .store
        .insert_refresh_token(user.id, &claims.jti, expires_at)
        .await?;
    Ok(json!({
        "user": user_json(user),
        "access_token": access_token,
        "refresh_token": refresh_token,
    }))
}

pub(crate) async fn register(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<(axum::http::StatusCode, Json<Value>), ApiError> {
    let email = body.email.trim().to_ascii_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::bad_request("invalid email address"));
    }
    if body.password.len() < 8 {
        return Err(ApiError::bad_request("password must be at least 8 characters"));
    }
    if state.store.user_by_email(&email).await?.is_some() {
        return Err(ApiError::conflict("email already registered"));
    }

    // The first account becomes the operator; demo mailboxes get the trial
    // role.
    let role = if state.store.count_users().await? == 0 {
        Role::Admin
    } else if email.starts_with("demo@") {
        Role::Demo
    } else {
        Role::User
    };

    let user = User {
        id: Uuid::new_v4(),
        email,
        password_hash: hash_password(&body.password)?,
        role,
        plan_customer_ref: None,
        created_at: Utc::now(),
    };
    state.store.insert_user(&user).await?;
    let body = issue_pair(&state, &user).await?;
    Ok((axum::http::StatusCode::CREATED, Json(body)))
}

pub(crate) async fn login(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = body.email.trim().to_ascii_lowercase();
    let user = state
        .store
        .user_by_email(&email)
        .await?
        .filter(|user| verify_password(&body.password, &user.password_hash))
        .ok_or_else(|| ApiError::unauthorized("invalid email or password"))?;
    Ok(Json(issue_pair(&state, &user).await?))
}

pub(crate) async fn refresh(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    let claims = match decode_token(&state.keys, &body.refresh_token) {
        DecodeOutcome::Valid(claims) if claims.typ == "refresh" => claims,
        DecodeOutcome::Expired => {
            return Err(ApiError::unauthorized("refresh token expired").with_code("TOKEN_EXPIRED"));
        }
        _ => return Err(ApiError::unauthorized("invalid refresh token")),
    };
    if !state
        .store
        .refresh_token_active(&claims.jti, Utc::now())
        .await?
    {
        return Err(ApiError::unauthorized("invalid refresh token"));
    }
    let user = state
        .store
        .user_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid refresh token"))?;

    // Rotate: the presented token dies with this exchange.
    state.store.revoke_refresh_token(&claims.jti).await?;
    Ok(Json(issue_pair(&state, &user).await?))
}

pub(crate) async fn logout(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    if let DecodeOutcome::Valid(claims) = decode_token(&state.keys, &body.refresh_token) {
        state.store.revoke_refresh_token(&claims.jti).await?;
    }
    Ok(Json(json!({ "status": "logged out" })))
}

pub(crate) async fn me(
    State(state): State<Arc<ApiState>>,
    axum::Extension(caller): axum::Extension<Caller>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .store
        .user_by_id(caller.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    let subscription = state.store.subscription_for(user.id).await?;
    let plan = skiff_data::plans::resolve(user.role, subscription.as_ref());
    Ok(Json(json!({
        "user": user_json(&user),
        "plan": {
            "name": plan.name,
            "limit_bytes_per_month": plan.limit_bytes_per_month,
            "concurrent_limit": plan.concurrent_limit,
            "retention_days": plan.retention_days,
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> AuthKeys {
        AuthKeys::new(
            "test-secret",
            std::time::Duration::from_secs(900),
            std::time::Duration::from_secs(7 * 24 * 3600),
        )
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            password_hash: String::new(),
            role: Role::User,
            plan_customer_ref: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn access_tokens_round_trip() {
        let keys = keys();
        let user = user();
        let token = issue_access(&keys, &user).expect("token issues");
        match decode_token(&keys, &token) {
            DecodeOutcome::Valid(claims) => {
                assert_eq!(claims.sub, user.id);
                assert_eq!(claims.typ, "access");
                assert_eq!(claims.role, "user");
            }
            _ => panic!("expected a valid token"),
        }
    }

    #[test]
    fn refresh_tokens_carry_a_jti() {
        let keys = keys();
        let (token, claims) = issue_refresh(&keys, &user()).expect("token issues");
        assert_eq!(claims.typ, "refresh");
        assert!(!claims.jti.is_empty());
        assert!(matches!(decode_token(&keys, &token), DecodeOutcome::Valid(_)));
    }

    #[test]
    fn tampered_tokens_are_invalid() {
        let keys = keys();
        let token = issue_access(&keys, &user()).expect("token issues");
        let other = AuthKeys::new(
            "other-secret",
            std::time::Duration::from_secs(900),
            std::time::Duration::from_secs(3600),
        );
        assert!(matches!(decode_token(&other, &token), DecodeOutcome::Invalid));
        assert!(matches!(decode_token(&keys, "garbage"), DecodeOutcome::Invalid));
    }

    #[test]
    fn password_hashing_verifies_and_rejects() {
        let hash = hash_password("correct horse").expect("hashes");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong pony", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }
}
