//! PolicyEngine - database roles and row-level-security policies
//!
//! Every tenant-scoped table gets two policies:
//! - `tenant_isolation` admits a row only when its tenant column equals
//!   `pulsegrid_current_tenant()`, for reads (`USING`) and writes (`WITH CHECK`)
//! - `admin_bypass` admits every row for members of `pulsegrid_admin`
//!
//! RLS is enabled and forced only after both policies exist, inside the same
//! transaction, so writers never observe a table with RLS on and no policy.

use pulsegrid_core::Result;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::classify;
use crate::sql::quote_ident;

pub const ROLE_READ: &str = "pulsegrid_read";
pub const ROLE_WRITE: &str = "pulsegrid_write";
pub const ROLE_ADMIN: &str = "pulsegrid_admin";

pub const TENANT_ISOLATION_POLICY: &str = "tenant_isolation";
pub const ADMIN_BYPASS_POLICY: &str = "admin_bypass";

/// A table guarded by tenant isolation and the column holding its tenant id
#[derive(Debug, Clone, Copy)]
pub struct ScopedTable {
    pub table: &'static str,
    pub tenant_column: &'static str,
}

pub const TENANT_SCOPED_TABLES: &[ScopedTable] = &[
    ScopedTable {
        table: "tenants",
        tenant_column: "id",
    },
    ScopedTable {
        table: "users",
        tenant_column: "tenant_id",
    },
    ScopedTable {
        table: "activity_events",
        tenant_column: "tenant_id",
    },
    ScopedTable {
        table: "connection_attempts",
        tenant_column: "tenant_id",
    },
];

/// NULL when the context is unset or empty, so every comparison is false
const CONTEXT_FUNCTION_SQL: &str = r#"
    CREATE OR REPLACE FUNCTION pulsegrid_current_tenant() RETURNS UUID
    LANGUAGE sql STABLE
    AS $$
        SELECT NULLIF(current_setting('app.current_organization_id', true), '')::uuid
    $$;
"#;

const ROLES_SQL: &str = r#"
    DO $$
    BEGIN
        IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'pulsegrid_read') THEN
            CREATE ROLE pulsegrid_read NOLOGIN;
        END IF;
        IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'pulsegrid_write') THEN
            CREATE ROLE pulsegrid_write NOLOGIN;
        END IF;
        IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'pulsegrid_admin') THEN
            CREATE ROLE pulsegrid_admin NOLOGIN;
        END IF;
    END
    $$;

    GRANT pulsegrid_read TO CURRENT_USER;
    GRANT pulsegrid_write TO CURRENT_USER;
    GRANT pulsegrid_admin TO CURRENT_USER;
"#;

/// Tables the write role may UPDATE, for deactivation. Events and connection
/// attempts are append-only once written.
pub const WRITE_UPDATABLE_TABLES: &[&str] = &["tenants", "users"];

/// Privileges for the three access roles
///
/// UPDATE is revoked from the write role before being granted back on
/// `WRITE_UPDATABLE_TABLES`, so reinstalling over an older grant set narrows it.
pub fn grants_sql() -> String {
    let updatable = WRITE_UPDATABLE_TABLES
        .iter()
        .map(|table| quote_ident(table))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "GRANT USAGE ON SCHEMA public TO {read}, {write}, {admin};\n\
         GRANT EXECUTE ON FUNCTION pulsegrid_current_tenant() TO {read}, {write}, {admin};\n\
         GRANT SELECT ON ALL TABLES IN SCHEMA public TO {read};\n\
         REVOKE UPDATE, DELETE, TRUNCATE ON ALL TABLES IN SCHEMA public FROM {write};\n\
         GRANT SELECT, INSERT ON ALL TABLES IN SCHEMA public TO {write};\n\
         GRANT UPDATE ON {updatable} TO {write};\n\
         GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA public TO {admin};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT ON TABLES TO {read};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public REVOKE UPDATE, DELETE, TRUNCATE ON TABLES FROM {write};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT, INSERT ON TABLES TO {write};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL PRIVILEGES ON TABLES TO {admin};",
        read = ROLE_READ,
        write = ROLE_WRITE,
        admin = ROLE_ADMIN,
        updatable = updatable,
    )
}

/// Build the per-table policy DDL, policies first and RLS last
pub fn table_policy_sql(scoped: &ScopedTable) -> String {
    let table = quote_ident(scoped.table);
    let column = quote_ident(scoped.tenant_column);
    format!(
        "DROP POLICY IF EXISTS {isolation} ON {table};\n\
         CREATE POLICY {isolation} ON {table}\n    \
             USING ({column} = pulsegrid_current_tenant())\n    \
             WITH CHECK ({column} = pulsegrid_current_tenant());\n\
         DROP POLICY IF EXISTS {bypass} ON {table};\n\
         CREATE POLICY {bypass} ON {table} TO {admin}\n    \
             USING (true)\n    \
             WITH CHECK (true);\n\
         ALTER TABLE {table} ENABLE ROW LEVEL SECURITY;\n\
         ALTER TABLE {table} FORCE ROW LEVEL SECURITY;",
        isolation = TENANT_ISOLATION_POLICY,
        bypass = ADMIN_BYPASS_POLICY,
        admin = ROLE_ADMIN,
        table = table,
        column = column,
    )
}

/// Installed RLS state for one table
#[derive(Debug, Clone, Serialize)]
pub struct TablePolicyStatus {
    pub table: String,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policies: Vec<String>,
}

impl TablePolicyStatus {
    /// Both policies installed and RLS enforced for the owner too
    pub fn is_protected(&self) -> bool {
        self.rls_enabled
            && self.rls_forced
            && self.policies.iter().any(|p| p == TENANT_ISOLATION_POLICY)
            && self.policies.iter().any(|p| p == ADMIN_BYPASS_POLICY)
    }
}

pub struct PolicyEngine {
    pool: PgPool,
}

impl PolicyEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Install the context function, roles, grants and every table policy
    ///
    /// Run after all tables and views exist so table grants cover them.
    pub async fn install(&self) -> Result<()> {
        self.create_context_function().await?;
        self.create_roles().await?;
        self.grant_privileges().await?;
        for scoped in TENANT_SCOPED_TABLES {
            self.apply_table_policy(scoped).await?;
        }
        info!(
            tables = TENANT_SCOPED_TABLES.len(),
            "Row-level security installed"
        );
        Ok(())
    }

    pub async fn create_context_function(&self) -> Result<()> {
        sqlx::raw_sql(CONTEXT_FUNCTION_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create tenant context function"))?;
        Ok(())
    }

    pub async fn create_roles(&self) -> Result<()> {
        sqlx::raw_sql(ROLES_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create roles"))?;
        Ok(())
    }

    pub async fn grant_privileges(&self) -> Result<()> {
        sqlx::raw_sql(&grants_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to grant privileges"))?;
        Ok(())
    }

    /// Create both policies and enable RLS on one table, atomically
    pub async fn apply_table_policy(&self, scoped: &ScopedTable) -> Result<()> {
        let sql = table_policy_sql(scoped);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, "Failed to begin policy transaction"))?;

        sqlx::raw_sql(&sql).execute(&mut *tx).await.map_err(|e| {
            classify(
                e,
                &format!("Failed to apply policies on {}", scoped.table),
            )
        })?;

        tx.commit()
            .await
            .map_err(|e| classify(e, "Failed to commit policy transaction"))?;
        debug!(table = scoped.table, "Tenant isolation policy applied");
        Ok(())
    }

    /// RLS state and installed policy names for every tenant-scoped table
    pub async fn policy_status(&self) -> Result<Vec<TablePolicyStatus>> {
        let mut statuses = Vec::with_capacity(TENANT_SCOPED_TABLES.len());
        for scoped in TENANT_SCOPED_TABLES {
            let flags: Option<(bool, bool)> = sqlx::query_as(
                "SELECT relrowsecurity, relforcerowsecurity FROM pg_class \
                 WHERE oid = to_regclass($1)",
            )
            .bind(scoped.table)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to read RLS flags"))?;

            let policies: Vec<String> = sqlx::query_scalar(
                "SELECT policyname::text FROM pg_policies \
                 WHERE schemaname = 'public' AND tablename = $1 ORDER BY policyname",
            )
            .bind(scoped.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to list policies"))?;

            let (rls_enabled, rls_forced) = flags.unwrap_or((false, false));
            statuses.push(TablePolicyStatus {
                table: scoped.table.to_string(),
                rls_enabled,
                rls_forced,
                policies,
            });
        }
        Ok(statuses)
    }
}
