//! Admin authentication.
//!
//! Authorization in this core is exactly "is this caller an admin": handlers
//! take an [`AdminUser`] extractor, which validates the bearer token and
//! requires an `admin` role claim. Non-admins get 403, missing or invalid
//! tokens 401, and neither response leaks anything about the order.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::ServiceError, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (staff user id)
    pub sub: String,
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

/// An authenticated staff member with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| {
                ServiceError::Unauthorized("Missing bearer token".to_string())
            })?;

        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| ServiceError::Unauthorized("Invalid or expired token".to_string()))?
        .claims;

        if !claims.roles.iter().any(|role| role == "admin") {
            return Err(ServiceError::Forbidden(
                "Admin role required".to_string(),
            ));
        }

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Malformed token subject".to_string()))?;

        Ok(AdminUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub fn issue_token(secret: &str, roles: Vec<String>) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            roles,
            iat: now,
            exp: now + 3600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("token encodes")
    }

    #[test]
    fn issued_tokens_decode_with_the_same_secret() {
        let token = issue_token("test-secret", vec!["admin".to_string()]);
        let claims = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"test-secret"),
            &Validation::default(),
        )
        .expect("decodes")
        .claims;
        assert!(claims.roles.contains(&"admin".to_string()));
    }
}
