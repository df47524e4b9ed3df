//! Request guards.
//!
//! Every command declares a [`Capability`]. The [`Pipeline`] runs its guards
//! in order against that capability before the handler is reached; the first
//! rejection is terminal.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::AppError;
use crate::token::{Claims, TokenService};

/// What a command requires of its caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub require_login: bool,
    /// Permission names, all of which must be held.
    pub permissions: Vec<&'static str>,
}

impl Capability {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn login() -> Self {
        Self {
            require_login: true,
            permissions: Vec::new(),
        }
    }

    pub fn permissions(permissions: &[&'static str]) -> Self {
        Self {
            require_login: true,
            permissions: permissions.to_vec(),
        }
    }
}

/// Per-request state threaded through the guards.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Raw bearer token as presented by the session, if any.
    pub bearer: Option<String>,
    /// Verified claims, attached by [`AuthenticationGuard`].
    pub claims: Option<Claims>,
}

impl RequestContext {
    pub fn new(bearer: Option<String>) -> Self {
        Self {
            bearer,
            claims: None,
        }
    }
}

pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, capability: &Capability, ctx: &mut RequestContext) -> Result<(), AppError>;
}

fn auth_failure(reason: &'static str) {
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Verifies the bearer token when the capability requires login and
/// attaches its claims to the context.
pub struct AuthenticationGuard {
    tokens: Arc<TokenService>,
}

impl AuthenticationGuard {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

impl Guard for AuthenticationGuard {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn check(&self, capability: &Capability, ctx: &mut RequestContext) -> Result<(), AppError> {
        if !capability.require_login {
            return Ok(());
        }
        let Some(token) = ctx.bearer.as_deref() else {
            auth_failure("missing");
            tracing::debug!("rejected: no access token on session");
            return Err(AppError::Unauthenticated("login required".into()));
        };
        match self.tokens.verify_access(token) {
            Ok(claims) => {
                ctx.claims = Some(claims);
                Ok(())
            }
            Err(e) => {
                auth_failure("invalid");
                tracing::debug!("rejected access token: {e}");
                Err(e.into())
            }
        }
    }
}

/// Enforces the capability's permission set. Never authenticates by
/// itself: without attached claims a non-empty requirement is rejected.
pub struct AuthorizationGuard;

impl Guard for AuthorizationGuard {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn check(&self, capability: &Capability, ctx: &mut RequestContext) -> Result<(), AppError> {
        if capability.permissions.is_empty() {
            return Ok(());
        }
        let Some(claims) = ctx.claims.as_ref() else {
            return Err(AppError::Forbidden(format!(
                "requires {}",
                capability.permissions.join(", ")
            )));
        };
        if claims.is_admin {
            return Ok(());
        }
        let held: BTreeSet<&str> = claims.permissions.iter().map(|p| p.name.as_str()).collect();
        let missing: Vec<&str> = capability
            .permissions
            .iter()
            .copied()
            .filter(|p| !held.contains(p))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            tracing::debug!("{} lacks {missing:?}", claims.username);
            Err(AppError::Forbidden(format!("missing permission: {}", missing.join(", "))))
        }
    }
}

/// Ordered guard chain, built once and run per request.
pub struct Pipeline {
    guards: Vec<Box<dyn Guard>>,
}

impl Pipeline {
    pub fn new(guards: Vec<Box<dyn Guard>>) -> Self {
        Self { guards }
    }

    /// Authentication, then authorization.
    pub fn standard(tokens: Arc<TokenService>) -> Self {
        Self::new(vec![
            Box::new(AuthenticationGuard::new(tokens)),
            Box::new(AuthorizationGuard),
        ])
    }

    pub fn run(&self, capability: &Capability, ctx: &mut RequestContext) -> Result<(), AppError> {
        for guard in &self.guards {
            if let Err(e) = guard.check(capability, ctx) {
                tracing::debug!("{} guard rejected request: {e}", guard.name());
                return Err(e);
            }
        }
        Ok(())
    }
}
