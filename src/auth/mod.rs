//! Identity-claims seam
//!
//! Token format and cryptography live outside this crate; the server only
//! consumes a verifier that turns a credential into claims or a rejection.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::core::connection::Connection;
use crate::core::namespace::Middleware;
use crate::error::{Result, RoomcastError};

/// Validated identity claims attached to a connection after the middleware
/// chain accepts it.
#[derive(Debug, Clone)]
pub struct Claims {
    pub subject: String,
    pub extra: Value,
}

impl Claims {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// External collaborator: `(credential) -> claims | reject`
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Claims>;
}

/// Accept-middleware adapting an identity verifier: reads the `token`
/// handshake parameter, verifies it, and attaches the claims.
pub struct AuthMiddleware {
    verifier: Arc<dyn IdentityVerifier>,
}

impl AuthMiddleware {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn accept(&self, connection: &mut Connection) -> Result<()> {
        let credential = connection
            .handshake()
            .get("token")
            .cloned()
            .ok_or_else(|| {
                RoomcastError::AuthenticationRejected("missing token parameter".to_string())
            })?;
        let claims = self
            .verifier
            .verify(&credential)
            .await
            .map_err(|e| RoomcastError::AuthenticationRejected(e.to_string()))?;
        connection.set_claims(claims);
        Ok(())
    }
}
