use crate::AppState;
use crate::config::SecurityConfig;
use crate::gateway::error::{ErrorCode, ToolExecutionError};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use jsonwebtoken::{DecodingKey, Validation, decode};
use std::fmt;
use uuid::Uuid;

use super::claims::{CallerIdentity, UserClaims};

/// Resolves bearer tokens into a [`CallerIdentity`].
pub struct JwtIdentityProvider {
    required: bool,
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl JwtIdentityProvider {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            required: config.jwt_required,
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// A presented token is always verified, even when authentication is
    /// optional.
    pub fn identify(&self, headers: &HeaderMap) -> Result<CallerIdentity, ToolExecutionError> {
        match headers.typed_get::<Authorization<Bearer>>() {
            Some(Authorization(bearer)) => {
                decode::<UserClaims>(bearer.token(), &self.key, &self.validation)
                    .map(|data| CallerIdentity::from(data.claims))
                    .map_err(|e| {
                        ToolExecutionError::new(
                            ErrorCode::InvalidCredentials,
                            "Invalid or expired bearer token",
                        )
                        .with_source(e)
                    })
            }
            None if self.required => Err(ToolExecutionError::new(
                ErrorCode::AuthenticationRequired,
                "A bearer token is required",
            )),
            None => Ok(CallerIdentity::anonymous()),
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.identity.identify(request.headers()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(
                name: "security.auth.rejected",
                code = %err.code(),
                path = %request.uri().path(),
                "Request rejected by authentication"
            );
            err.with_request_id(Uuid::new_v4().to_string())
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn provider(required: bool) -> JwtIdentityProvider {
        JwtIdentityProvider::new(&SecurityConfig {
            jwt_required: required,
            jwt_secret: "test-secret".to_string(),
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    fn token(secret: &str) -> String {
        let claims = UserClaims {
            sub: "athlete-7".to_string(),
            name: Some("Ada".to_string()),
            roles: Some(vec!["coach".to_string()]),
            workspace: Some("team-a".to_string()),
            exp: 4_102_444_800, // 2100-01-01
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn missing_token() {
        assert!(provider(true).is_required());
        assert!(!provider(false).is_required());
        let err = provider(true).identify(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationRequired);

        let identity = provider(false).identify(&HeaderMap::new()).unwrap();
        assert_eq!(identity, CallerIdentity::anonymous());
    }

    #[test]
    fn valid_token_yields_identity() {
        let identity = provider(true)
            .identify(&bearer(&token("test-secret")))
            .unwrap();
        assert_eq!(identity.user_id, "athlete-7");
        assert_eq!(identity.workspace.as_deref(), Some("team-a"));
        assert!(identity.has_role("coach"));
    }

    #[test]
    fn wrong_signature_is_invalid_credentials() {
        let err = provider(false)
            .identify(&bearer(&token("other-secret")))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCredentials);
    }
}
