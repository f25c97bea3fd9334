use std::str::FromStr;

use axum::async_trait;
use axum::extract::FromRef;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use clap::ValueEnum;
use expo_common::{Role, SessionInfo};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Jwt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum JwtAlgorithm {
    Hs256,
    Hs384,
    Hs512,
    Rs256,
    Rs384,
    Rs512,
    Es256,
    Es384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtKeyKind {
    Secret,
    Rsa,
    Ec,
}

impl JwtAlgorithm {
    pub fn key_kind(self) -> JwtKeyKind {
        match self {
            JwtAlgorithm::Hs256 | JwtAlgorithm::Hs384 | JwtAlgorithm::Hs512 => JwtKeyKind::Secret,
            JwtAlgorithm::Rs256 | JwtAlgorithm::Rs384 | JwtAlgorithm::Rs512 => JwtKeyKind::Rsa,
            JwtAlgorithm::Es256 | JwtAlgorithm::Es384 => JwtKeyKind::Ec,
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            JwtAlgorithm::Hs256 => Algorithm::HS256,
            JwtAlgorithm::Hs384 => Algorithm::HS384,
            JwtAlgorithm::Hs512 => Algorithm::HS512,
            JwtAlgorithm::Rs256 => Algorithm::RS256,
            JwtAlgorithm::Rs384 => Algorithm::RS384,
            JwtAlgorithm::Rs512 => Algorithm::RS512,
            JwtAlgorithm::Es256 => Algorithm::ES256,
            JwtAlgorithm::Es384 => Algorithm::ES384,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub api_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_public_key: Option<String>,
    pub jwt_algorithm: JwtAlgorithm,
}

/// Identity of an authenticated caller. The role is parsed once, here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub subject: String,
    pub role: Role,
}

impl AuthUser {
    /// Reject with 403 unless the caller holds `role`. For role-gated handlers
    /// that take `AuthUser`.
    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "{} requires role {role}, has {}",
                self.subject, self.role
            )))
        }
    }

    pub fn session(&self) -> SessionInfo {
        SessionInfo {
            subject: self.subject.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    #[allow(dead_code)]
    exp: Option<usize>,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);

        match config.mode {
            AuthMode::ApiKey => authorize_api_key(parts, &config),
            AuthMode::Jwt => authorize_jwt(parts, &config),
        }
    }
}

fn authorize_api_key(parts: &Parts, config: &AuthConfig) -> Result<AuthUser, ApiError> {
    let expected = config
        .api_key
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("missing EXPO_API_KEY".into()))?;

    let provided = parts
        .headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".into()))?;

    if provided != expected {
        return Err(ApiError::Unauthorized("invalid API key".into()));
    }

    // The shared key is an operator credential.
    Ok(AuthUser {
        subject: "api_key".to_string(),
        role: Role::Admin,
    })
}

fn decoding_key(config: &AuthConfig) -> Result<DecodingKey, ApiError> {
    match config.jwt_algorithm.key_kind() {
        JwtKeyKind::Secret => config
            .jwt_secret
            .as_deref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()))
            .ok_or_else(|| ApiError::Unauthorized("missing JWT_SECRET".into())),
        JwtKeyKind::Rsa => {
            let pem = config
                .jwt_public_key
                .as_deref()
                .ok_or_else(|| ApiError::Unauthorized("missing JWT_PUBLIC_KEY".into()))?;
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|err| ApiError::Internal(format!("invalid RSA public key: {err}")))
        }
        JwtKeyKind::Ec => {
            let pem = config
                .jwt_public_key
                .as_deref()
                .ok_or_else(|| ApiError::Unauthorized("missing JWT_PUBLIC_KEY".into()))?;
            DecodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|err| ApiError::Internal(format!("invalid EC public key: {err}")))
        }
    }
}

fn authorize_jwt(parts: &Parts, config: &AuthConfig) -> Result<AuthUser, ApiError> {
    let key = decoding_key(config)?;

    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("expected Bearer token".into()))?;

    let mut validation = Validation::new(config.jwt_algorithm.algorithm());
    // `exp` is optional but still checked when present.
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &key, &validation)
        .map_err(|err| ApiError::Unauthorized(format!("invalid token: {err}")))?;

    let role = Role::from_str(&data.claims.role)
        .map_err(|_| ApiError::Unauthorized(format!("unknown role: {}", data.claims.role)))?;

    Ok(AuthUser {
        subject: data.claims.sub,
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        role: &'a str,
        exp: usize,
    }

    fn jwt_config() -> AuthConfig {
        AuthConfig {
            mode: AuthMode::Jwt,
            api_key: None,
            jwt_secret: Some(SECRET.into()),
            jwt_public_key: None,
            jwt_algorithm: JwtAlgorithm::Hs256,
        }
    }

    fn token(role: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                sub: "user-7",
                role,
                exp: 4_102_444_800,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn parts_with(header: &str, value: &str) -> Parts {
        let (parts, _) = Request::builder()
            .header(header, value)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn jwt_role_is_resolved_once_into_enum() {
        let parts = parts_with("authorization", &format!("Bearer {}", token("Exhibitor")));

        let user = authorize_jwt(&parts, &jwt_config()).unwrap();
        assert_eq!(user.subject, "user-7");
        assert_eq!(user.role, Role::Exhibitor);
    }

    #[test]
    fn jwt_without_exp_is_accepted() {
        #[derive(Serialize)]
        struct NoExpiry<'a> {
            sub: &'a str,
            role: &'a str,
        }

        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoExpiry {
                sub: "u",
                role: "admin",
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let parts = parts_with("authorization", &format!("Bearer {token}"));

        let user = authorize_jwt(&parts, &jwt_config()).unwrap();
        assert_eq!(user.subject, "u");
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn jwt_with_past_exp_is_unauthorized() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                sub: "user-7",
                role: "admin",
                exp: 1_000_000,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let parts = parts_with("authorization", &format!("Bearer {token}"));

        assert!(matches!(
            authorize_jwt(&parts, &jwt_config()),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn jwt_with_unknown_role_is_unauthorized() {
        let parts = parts_with("authorization", &format!("Bearer {}", token("superuser")));

        let err = authorize_jwt(&parts, &jwt_config()).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn jwt_requires_bearer_scheme() {
        let parts = parts_with("authorization", &format!("Token {}", token("admin")));

        assert!(matches!(
            authorize_jwt(&parts, &jwt_config()),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn api_key_grants_admin() {
        let config = AuthConfig {
            mode: AuthMode::ApiKey,
            api_key: Some("k".into()),
            ..jwt_config()
        };

        let user = authorize_api_key(&parts_with("x-api-key", "k"), &config).unwrap();
        assert_eq!(user.role, Role::Admin);

        assert!(authorize_api_key(&parts_with("x-api-key", "nope"), &config).is_err());
    }

    #[test]
    fn require_rejects_other_roles_with_forbidden() {
        let attendee = AuthUser {
            subject: "user-1".into(),
            role: Role::Attendee,
        };

        assert!(attendee.require(Role::Attendee).is_ok());
        assert!(matches!(
            attendee.require(Role::Admin),
            Err(ApiError::Forbidden(_))
        ));
    }
}
