//! Tenant context: the capability object that scopes every database
//! operation to one organization, or to the privileged root role.
//!
//! Application code never appends `org_id = ?` predicates to its own SQL.
//! Instead, every operation opens its transaction through
//! [`TenantContext::begin`], which installs the transaction-local
//! `app.current_org_id` setting and switches to the `foreman_rls` role; the
//! row-level policies do the filtering from there. Both settings are
//! transaction-local, so the scope clears automatically at commit or
//! rollback, and statements inside the transaction never re-set it.

use std::fmt;

use anyhow::{Context, Result};
use sqlx::{Postgres, Transaction};
use tracing::warn;

use crate::pool::Db;

/// Maximum accepted length of an organization identifier.
pub const MAX_ORG_ID_LEN: usize = 255;

/// A per-operation capability carrying either one organization identifier
/// (normal) or root privileges.
///
/// `Tenant` is the only variant ordinary API paths can construct; `Root` is
/// reached through [`TenantContext::root`] or
/// [`TenantContext::upgrade_to_root`], both of which log the stated reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantContext {
    Tenant { org_id: String },
    Root,
}

impl TenantContext {
    /// Build a tenant-scoped context, validating the organization id.
    pub fn tenant(org_id: impl Into<String>) -> Result<Self, InvalidOrgId> {
        let org_id = org_id.into();
        if org_id.is_empty() {
            return Err(InvalidOrgId("organization id must not be empty".to_owned()));
        }
        if org_id.len() > MAX_ORG_ID_LEN {
            return Err(InvalidOrgId(format!(
                "organization id exceeds {MAX_ORG_ID_LEN} characters"
            )));
        }
        Ok(Self::Tenant { org_id })
    }

    /// Build a root context for an administrative caller.
    ///
    /// Root sessions bypass the row-level policies entirely, so every
    /// construction is logged with its reason.
    pub fn root(reason: &str) -> Self {
        warn!(reason, "constructing root database context");
        Self::Root
    }

    /// Upgrade this context to root, logging the reason.
    ///
    /// Ordinary API paths must not call this; it exists for administrative
    /// code (the queue worker, operational tooling).
    pub fn upgrade_to_root(self, reason: &str) -> Self {
        Self::root(reason)
    }

    /// The organization id, or `None` for root.
    pub fn org_id(&self) -> Option<&str> {
        match self {
            Self::Tenant { org_id } => Some(org_id),
            Self::Root => None,
        }
    }

    /// Whether this is the privileged root context.
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// Open a transaction scoped to this context.
    ///
    /// Tenant contexts begin on the rls pool, install the transaction-local
    /// `app.current_org_id` setting, and switch to the `foreman_rls` role so
    /// the policies apply even when the connection's login role is
    /// privileged. Root contexts begin on the root pool and set neither.
    pub async fn begin(&self, db: &Db) -> Result<Transaction<'static, Postgres>> {
        match self {
            Self::Tenant { org_id } => {
                let mut tx = db
                    .rls_pool()
                    .begin()
                    .await
                    .context("failed to begin tenant-scoped transaction")?;
                sqlx::query("SELECT set_config('app.current_org_id', $1, true)")
                    .bind(org_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to set tenant org context")?;
                sqlx::query("SET LOCAL ROLE foreman_rls")
                    .execute(&mut *tx)
                    .await
                    .context("failed to assume rls role")?;
                Ok(tx)
            }
            Self::Root => db
                .root_pool()
                .begin()
                .await
                .context("failed to begin root transaction"),
        }
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant { org_id } => write!(f, "org:{org_id}"),
            Self::Root => f.write_str("root"),
        }
    }
}

/// Error returned when an organization id fails validation.
#[derive(Debug, Clone)]
pub struct InvalidOrgId(pub String);

impl fmt::Display for InvalidOrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidOrgId {}
