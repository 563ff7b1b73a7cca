//! Mesh authentication.
//!
//! Every inter-node request carries the caller's instance id in
//! `X-Instance-ID` and an HS256 token signed with the shared mesh secret in
//! `Authorization: Bearer`. The server checks both before touching data.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockmesh_core::NodeRole;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{NodeInfo, INSTANCE_HEADER};

const TOKEN_TYPE: &str = "mesh_handshake";
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Mesh token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshClaims {
    /// Instance id of the caller.
    pub sub: String,

    pub role: NodeRole,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub weight: i32,

    /// Always `mesh_handshake`.
    pub token_type: String,

    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Issues and verifies mesh tokens for one node.
#[derive(Clone)]
pub struct MeshAuth {
    secret: String,
    node: NodeInfo,
    require_token: bool,
}

impl std::fmt::Debug for MeshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshAuth")
            .field("instance_id", &self.node.instance_id)
            .field("require_token", &self.require_token)
            .finish_non_exhaustive()
    }
}

impl MeshAuth {
    pub fn new(secret: impl Into<String>, node: NodeInfo) -> Self {
        MeshAuth {
            secret: secret.into(),
            node,
            require_token: true,
        }
    }

    /// With `false`, a missing token is tolerated but a present one is
    /// still verified.
    pub fn require_token(mut self, require: bool) -> Self {
        self.require_token = require;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.node.instance_id
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    /// Signs a fresh token for this node.
    pub fn issue_token(&self) -> SyncResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(TOKEN_LIFETIME_SECS);

        let claims = MeshClaims {
            sub: self.node.instance_id.clone(),
            role: self.node.role,
            base_url: self.node.base_url.clone(),
            weight: self.node.weight,
            token_type: TOKEN_TYPE.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| SyncError::Internal(format!("Failed to sign mesh token: {}", e)))
    }

    /// Validates signature, expiry and token type.
    pub fn verify_token(&self, token: &str) -> SyncResult<MeshClaims> {
        let token_data: TokenData<MeshClaims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| SyncError::Unauthorized(format!("Invalid mesh token: {}", e)))?;

        if token_data.claims.token_type != TOKEN_TYPE {
            return Err(SyncError::Unauthorized("Expected a mesh token".into()));
        }
        Ok(token_data.claims)
    }

    /// Authenticates an incoming request. Returns the caller's instance id.
    pub fn authenticate(&self, headers: &HeaderMap) -> SyncResult<String> {
        let instance_id = headers
            .get(INSTANCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SyncError::Unauthorized("Missing X-Instance-ID header".into()))?;

        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer_token);

        match token {
            Some(token) => {
                let claims = self.verify_token(token)?;
                if claims.sub != instance_id {
                    return Err(SyncError::Forbidden(format!(
                        "Token subject {} does not match instance {}",
                        claims.sub, instance_id
                    )));
                }
            }
            None if self.require_token => {
                return Err(SyncError::Unauthorized("Missing bearer token".into()));
            }
            None => {}
        }

        Ok(instance_id.to_string())
    }
}

/// Extract bearer token from an authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            instance_id: id.into(),
            role: NodeRole::Peer,
            base_url: Some("http://10.0.0.2:8080".into()),
            weight: 50,
            is_online: true,
            last_seen: Utc::now(),
        }
    }

    fn headers(instance: &str, token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(INSTANCE_HEADER, HeaderValue::from_str(instance).unwrap());
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_token_roundtrip() {
        let auth = MeshAuth::new("secret", node("nodeA"));
        let token = auth.issue_token().unwrap();
        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "nodeA");
        assert_eq!(claims.token_type, "mesh_handshake");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = MeshAuth::new("secret", node("nodeA"));
        let b = MeshAuth::new("other", node("nodeB"));
        let token = a.issue_token().unwrap();
        assert!(matches!(b.verify_token(&token), Err(SyncError::Unauthorized(_))));
    }

    #[test]
    fn test_authenticate_checks_subject() {
        let caller = MeshAuth::new("secret", node("nodeA"));
        let server = MeshAuth::new("secret", node("nodeB"));
        let token = caller.issue_token().unwrap();

        assert_eq!(server.authenticate(&headers("nodeA", Some(&token))).unwrap(), "nodeA");
        assert!(matches!(
            server.authenticate(&headers("nodeC", Some(&token))),
            Err(SyncError::Forbidden(_))
        ));
        assert!(matches!(
            server.authenticate(&headers("nodeA", None)),
            Err(SyncError::Unauthorized(_))
        ));
        assert!(server.authenticate(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_optional_token() {
        let server = MeshAuth::new("secret", node("nodeB")).require_token(false);
        assert_eq!(server.authenticate(&headers("nodeA", None)).unwrap(), "nodeA");
        assert!(server.authenticate(&headers("nodeA", Some("garbage"))).is_err());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }
}
