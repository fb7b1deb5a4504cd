//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs signed with the shared secret. Claims carry the
//! user id under any of `sub`, `id`, or `userId`, plus `email` and an
//! optional `orgId`. Missing or invalid tokens are 401; org-role
//! mismatches surface as 403 from the handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Job, OrgRole};
use conductor_db::queries::orgs;

use crate::error::ApiError;
use crate::serve_cmd::AppState;

/// Raw claim shape accepted on the wire.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "orgId")]
    org_id: Option<Uuid>,
    #[allow(dead_code)]
    exp: i64,
}

/// The authenticated caller, extracted from the Authorization header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub org_id: Option<Uuid>,
}

impl AuthUser {
    /// Decode and verify a bearer token.
    pub fn from_token(token: &str, secret: &str) -> Result<Self, ApiError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|err| ApiError::auth(format!("invalid token: {err}")))?;

        let claims = data.claims;
        let user_id = claims
            .sub
            .or(claims.id)
            .or(claims.user_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::auth("token carries no subject"))?;

        Ok(Self {
            user_id,
            email: claims.email,
            org_id: claims.org_id,
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::auth("missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::auth("Authorization header is not a bearer token"))?;

        AuthUser::from_token(token, &state.jwt_secret)
    }
}

/// Check that the caller may read a job: the owner always can, and any
/// member of the job's organization can.
pub async fn ensure_job_read(pool: &PgPool, user: &AuthUser, job: &Job) -> Result<(), ApiError> {
    if job.owner_id == user.user_id {
        return Ok(());
    }
    if user.org_id == Some(job.org_id) {
        return Ok(());
    }
    if orgs::get_member(pool, job.org_id, &user.user_id).await?.is_some() {
        return Ok(());
    }
    Err(ApiError::forbidden("not a member of this job's organization"))
}

/// Check that the caller may mutate a job: the owner, or an org admin or
/// owner.
pub async fn ensure_job_write(pool: &PgPool, user: &AuthUser, job: &Job) -> Result<(), ApiError> {
    if job.owner_id == user.user_id {
        return Ok(());
    }
    match orgs::get_member(pool, job.org_id, &user.user_id).await? {
        Some(member) if member.role >= OrgRole::Admin => Ok(()),
        Some(_) => Err(ApiError::forbidden(
            "org admin role required to modify another member's job",
        )),
        None => Err(ApiError::forbidden("not a member of this job's organization")),
    }
}

/// The org a new resource should belong to. Callers without an org claim
/// get a deterministic personal org derived from their user id.
pub fn effective_org(user: &AuthUser) -> Uuid {
    user.org_id.unwrap_or_else(|| {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, user.user_id.as_bytes())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encoding succeeds")
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn sub_claim_is_accepted() {
        let t = token(json!({"sub": "user-1", "email": "u@example.com", "exp": exp()}));
        let user = AuthUser::from_token(&t, SECRET).expect("valid token");
        assert_eq!(user.user_id, "user-1");
        assert_eq!(user.email.as_deref(), Some("u@example.com"));
        assert!(user.org_id.is_none());
    }

    #[test]
    fn id_and_user_id_aliases_are_accepted() {
        let t = token(json!({"id": "user-2", "exp": exp()}));
        assert_eq!(AuthUser::from_token(&t, SECRET).unwrap().user_id, "user-2");

        let t = token(json!({"userId": "user-3", "exp": exp()}));
        assert_eq!(AuthUser::from_token(&t, SECRET).unwrap().user_id, "user-3");
    }

    #[test]
    fn org_claim_is_parsed() {
        let org = Uuid::new_v4();
        let t = token(json!({"sub": "user-1", "orgId": org, "exp": exp()}));
        assert_eq!(AuthUser::from_token(&t, SECRET).unwrap().org_id, Some(org));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let t = token(json!({"sub": "user-1", "exp": exp()}));
        assert!(AuthUser::from_token(&t, "other-secret").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let t = token(json!({"sub": "user-1", "exp": chrono::Utc::now().timestamp() - 10}));
        assert!(AuthUser::from_token(&t, SECRET).is_err());
    }

    #[test]
    fn subjectless_token_is_rejected() {
        let t = token(json!({"email": "u@example.com", "exp": exp()}));
        assert!(AuthUser::from_token(&t, SECRET).is_err());
    }

    #[test]
    fn effective_org_is_stable() {
        let user = AuthUser {
            user_id: "user-1".to_owned(),
            email: None,
            org_id: None,
        };
        assert_eq!(effective_org(&user), effective_org(&user));
    }
}
