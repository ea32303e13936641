use std::ops::{Deref, DerefMut};

use anyhow::Result;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

/// Cross-tenant data access for pipeline handlers.
///
/// The product API scopes every query to one organization; pipeline jobs
/// operate across all of them. `begin` opens a transaction tagged with the
/// calling job's label via the `app.service_context` session setting, which
/// the product's row security policies allow-list and its audit log records.
/// A handler performs all reads and writes for one logical unit of work
/// inside a single `ServiceTx` and commits once.
#[derive(Clone)]
pub struct ServiceContext {
    pool: PgPool,
}

impl ServiceContext {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self, label: &'static str) -> Result<ServiceTx<'_>> {
        let mut tx = self.pool.begin().await?;

        // transaction-local marker, reset automatically at commit/rollback
        sqlx::query("SELECT set_config('app.service_context', $1, true)")
            .bind(label)
            .execute(&mut *tx)
            .await?;

        tracing::debug!(label, "service context opened");
        Ok(ServiceTx { tx, label })
    }
}

/// An open service-context transaction. Dropping it without `commit`
/// rolls everything back, the same as a handler error path.
pub struct ServiceTx<'c> {
    tx: Transaction<'c, Postgres>,
    label: &'static str,
}

impl<'c> ServiceTx<'c> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        tracing::warn!(label = self.label, "service context rolled back");
        self.tx.rollback().await?;
        Ok(())
    }
}

impl<'c> Deref for ServiceTx<'c> {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl<'c> DerefMut for ServiceTx<'c> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}
