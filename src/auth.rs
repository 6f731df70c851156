//! Request authentication: one typed [`Actor`] per request.
//!
//! Two credential forms resolve to an actor: a JWT bearer token (HMAC,
//! `sub` = user id) or an `X-API-Key` header looked up in the database.
//! Everything downstream keys per-actor views by `public_key` when present,
//! falling back to `user_id` — the OR-logic lives in the queue loaders, not
//! in handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use sqlx::Row;

use crate::error::ApiError;
use crate::state::AppState;
use crate::types::StellarAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: i64,
    pub public_key: Option<StellarAddress>,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[allow(dead_code)]
    exp: i64,
}

fn actor_from_jwt(secret: &str, token: &str) -> Result<Actor, ApiError> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ApiError::AuthRequired)?;

    let user_id = decoded
        .claims
        .sub
        .parse::<i64>()
        .map_err(|_| ApiError::AuthRequired)?;
    let public_key = decoded
        .claims
        .public_key
        .as_deref()
        .map(StellarAddress::parse)
        .transpose()
        .map_err(|_| ApiError::AuthRequired)?;
    Ok(Actor {
        user_id,
        public_key,
        role: decoded.claims.role.unwrap_or(Role::User),
    })
}

async fn actor_from_api_key(state: &AppState, api_key: &str) -> Result<Actor, ApiError> {
    let row = sqlx::query(
        "SELECT u.id, u.public_key, u.role FROM users u \
         JOIN api_keys k ON k.user_id = u.id \
         WHERE k.key = $1 AND NOT k.revoked",
    )
    .bind(api_key)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::AuthRequired)?;

    let public_key: Option<String> = row.try_get("public_key").map_err(ApiError::from)?;
    let role: String = row.try_get("role").map_err(ApiError::from)?;
    Ok(Actor {
        user_id: row.try_get("id").map_err(ApiError::from)?,
        public_key: public_key
            .as_deref()
            .map(StellarAddress::parse)
            .transpose()
            .map_err(|_| ApiError::AuthRequired)?,
        role: if role == "admin" { Role::Admin } else { Role::User },
    })
}

impl FromRequestParts<AppState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(bearer) = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return actor_from_jwt(&state.config.jwt_secret, bearer);
        }
        if let Some(api_key) = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
        {
            return actor_from_api_key(state, api_key).await;
        }
        Err(ApiError::AuthRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_jwt_resolves_actor() {
        let pk = format!("G{}", "A".repeat(55));
        let exp = chrono::Utc::now().timestamp() + 3600;
        let jwt = token(
            "secret",
            json!({"sub": "42", "public_key": pk, "role": "admin", "exp": exp}),
        );
        let actor = actor_from_jwt("secret", &jwt).unwrap();
        assert_eq!(actor.user_id, 42);
        assert_eq!(actor.public_key.unwrap().as_str(), pk);
        assert_eq!(actor.role, Role::Admin);
    }

    #[test]
    fn test_jwt_wrong_secret_rejected() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let jwt = token("secret-a", json!({"sub": "42", "exp": exp}));
        assert!(matches!(
            actor_from_jwt("secret-b", &jwt),
            Err(ApiError::AuthRequired)
        ));
    }

    #[test]
    fn test_expired_jwt_rejected() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let jwt = token("secret", json!({"sub": "42", "exp": exp}));
        assert!(matches!(
            actor_from_jwt("secret", &jwt),
            Err(ApiError::AuthRequired)
        ));
    }

    #[test]
    fn test_missing_role_defaults_to_user() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let jwt = token("secret", json!({"sub": "7", "exp": exp}));
        let actor = actor_from_jwt("secret", &jwt).unwrap();
        assert_eq!(actor.role, Role::User);
        assert!(actor.public_key.is_none());
    }
}
