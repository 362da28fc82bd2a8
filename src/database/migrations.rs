//! # Schema Migrations
//!
//! A minimal apply-once ledger. Each [`Migration`] is an idempotent SQL batch
//! identified by a stable id; applied ids are recorded in `schema_migrations`
//! together with the time they were applied.
//!
//! Every statement uses `IF NOT EXISTS`, and each run holds a transaction-scoped
//! advisory lock while it reads and extends the ledger. Concurrent runs against
//! a fresh database are serialized: the second one waits, then finds every id
//! already recorded. A bare `CREATE TABLE IF NOT EXISTS` race can still fail on
//! the `pg_type` unique index (SQLSTATE 23505), which is why the lock is taken.

use crate::constants::database::{MIGRATIONS_LOCK_KEY, MIGRATIONS_TABLE};
use crate::error::{IngestError, Result};
use crate::logging::log_database_operation;
use sqlx::{Executor, PgConnection, PgPool, Row};
use std::collections::HashSet;
use tracing::{debug, info};

/// A single ordered schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Stable identifier recorded in the ledger
    pub id: &'static str,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Ordered list of schema steps. Never edit an applied entry; append a new one.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_create_orders",
        description: "order header table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_uid VARCHAR(255) PRIMARY KEY,
                track_number VARCHAR(255) NOT NULL,
                entry VARCHAR(255) NOT NULL,
                locale VARCHAR(10) NOT NULL,
                internal_signature VARCHAR(255) NOT NULL DEFAULT '',
                customer_id VARCHAR(255) NOT NULL,
                delivery_service VARCHAR(255) NOT NULL,
                shardkey VARCHAR(255) NOT NULL,
                sm_id INTEGER NOT NULL,
                date_created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                oof_shard VARCHAR(255) NOT NULL
            );
        "#,
    },
    Migration {
        id: "0002_create_delivery",
        description: "delivery details, cascade-deleted with the order",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delivery (
                order_uid VARCHAR(255) PRIMARY KEY REFERENCES orders(order_uid) ON DELETE CASCADE,
                name VARCHAR(255) NOT NULL,
                phone VARCHAR(255) NOT NULL,
                zip VARCHAR(255) NOT NULL,
                city VARCHAR(255) NOT NULL,
                address VARCHAR(255) NOT NULL,
                region VARCHAR(255) NOT NULL,
                email VARCHAR(255) NOT NULL
            );
        "#,
    },
    Migration {
        id: "0003_create_payment",
        description: "payment details, cascade-deleted with the order",
        sql: r#"
            CREATE TABLE IF NOT EXISTS payment (
                order_uid VARCHAR(255) PRIMARY KEY REFERENCES orders(order_uid) ON DELETE CASCADE,
                transaction VARCHAR(255) NOT NULL,
                request_id VARCHAR(255) NOT NULL DEFAULT '',
                currency VARCHAR(10) NOT NULL,
                provider VARCHAR(255) NOT NULL,
                amount BIGINT NOT NULL,
                payment_dt BIGINT NOT NULL,
                bank VARCHAR(255) NOT NULL,
                delivery_cost BIGINT NOT NULL,
                goods_total BIGINT NOT NULL,
                custom_fee BIGINT NOT NULL
            );
        "#,
    },
    Migration {
        id: "0004_create_items",
        description: "order lines, cascade-deleted with the order",
        sql: r#"
            CREATE TABLE IF NOT EXISTS items (
                id SERIAL PRIMARY KEY,
                order_uid VARCHAR(255) NOT NULL REFERENCES orders(order_uid) ON DELETE CASCADE,
                chrt_id BIGINT NOT NULL,
                track_number VARCHAR(255) NOT NULL,
                price BIGINT NOT NULL,
                rid VARCHAR(255) NOT NULL,
                name VARCHAR(255) NOT NULL,
                sale INTEGER NOT NULL,
                size VARCHAR(255) NOT NULL,
                total_price BIGINT NOT NULL,
                nm_id BIGINT NOT NULL,
                brand VARCHAR(255) NOT NULL,
                status INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        id: "0005_create_indexes",
        description: "lookup indexes for items and order listing",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_items_order_uid ON items(order_uid);
            CREATE INDEX IF NOT EXISTS idx_orders_track_number ON orders(track_number);
            CREATE INDEX IF NOT EXISTS idx_orders_date_created ON orders(date_created);
        "#,
    },
];

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply every migration not yet recorded in the ledger, in order.
    /// Returns the ids applied by this call.
    pub async fn run_all(pool: PgPool) -> Result<Vec<&'static str>> {
        Self::run(pool, MIGRATIONS).await
    }

    pub async fn run(
        pool: PgPool,
        migrations: &'static [Migration],
    ) -> Result<Vec<&'static str>> {
        Self::ensure_migration_table(&pool).await?;

        let mut newly_applied = Vec::new();
        for migration in migrations.iter().copied() {
            let started = std::time::Instant::now();
            if !Self::apply(&pool, migration).await? {
                debug!(migration = migration.id, "Migration already applied");
                continue;
            }

            log_database_operation(
                "apply_migration",
                Some(MIGRATIONS_TABLE),
                None,
                "applied",
                Some(started.elapsed().as_millis() as u64),
                Some(migration.id),
            );
            newly_applied.push(migration.id);
        }

        Ok(newly_applied)
    }

    /// Ids recorded in the ledger
    pub async fn get_applied_migrations(pool: &PgPool) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!("SELECT id FROM {MIGRATIONS_TABLE}"))
            .fetch_all(pool)
            .await
            .map_err(|e| IngestError::from_sqlx("load_migrations", e))?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("id"))
            .collect())
    }

    async fn ensure_migration_table(pool: &PgPool) -> Result<()> {
        let operation = "create_migrations_table";
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;
        Self::lock(&mut *tx, operation).await?;

        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                id TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"
        );
        (&mut *tx)
            .execute(sqlx::raw_sql(&create_sql))
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))
    }

    /// Serialize ledger access across processes until the transaction ends
    async fn lock(conn: &mut PgConnection, operation: &'static str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATIONS_LOCK_KEY)
            .execute(conn)
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;
        Ok(())
    }

    /// Schema batch and ledger row commit together. Returns `false` when the
    /// ledger already holds the id.
    async fn apply(pool: &PgPool, migration: Migration) -> Result<bool> {
        let operation = "apply_migration";
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;
        Self::lock(&mut *tx, operation).await?;

        let recorded = sqlx::query(&format!(
            "SELECT 1 FROM {MIGRATIONS_TABLE} WHERE id = $1"
        ))
        .bind(migration.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| IngestError::from_sqlx(operation, e))?;
        if recorded.is_some() {
            return Ok(false);
        }

        info!(
            migration = migration.id,
            description = migration.description,
            "📦 Applying migration"
        );
        (&mut *tx)
            .execute(sqlx::raw_sql(migration.sql))
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;

        sqlx::query(&format!("INSERT INTO {MIGRATIONS_TABLE} (id) VALUES ($1)"))
            .bind(migration.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| IngestError::from_sqlx(operation, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_ids_are_unique_and_ordered() {
        let ids: Vec<&str> = MIGRATIONS.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_migrations_are_idempotent_statements() {
        for migration in MIGRATIONS {
            assert!(
                migration.sql.contains("IF NOT EXISTS"),
                "{} is not idempotent",
                migration.id
            );
        }
    }

    #[test]
    fn test_child_tables_cascade() {
        for id in ["0002_create_delivery", "0003_create_payment", "0004_create_items"] {
            let migration = MIGRATIONS.iter().find(|m| m.id == id).unwrap();
            assert!(migration.sql.contains("ON DELETE CASCADE"));
        }
    }
}
