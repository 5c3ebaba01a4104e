//! PostgreSQL schema inspector
//!
//! Reads table structure from `information_schema` and `pg_catalog` for a
//! single schema (default `public`).

use super::{ColumnDef, ConstraintDef, ConstraintKind, ForeignKeyDef, IndexDef, SchemaInspector, TableInfo};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Schema inspector for PostgreSQL
pub struct PostgresInspector {
    pool: Pool,
    schema: String,
}

impl PostgresInspector {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Build a pool from configuration and verify it with a round trip
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = create_pool(config)?;

        let client = pool.get().await?;
        client.query_one("SELECT 1 as ok", &[]).await?;

        info!(
            host = %config.host,
            database = %config.database,
            tls = config.use_tls,
            "Database connection successful"
        );
        Ok(Self::new(pool, "public"))
    }

    async fn get_columns(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> AppResult<Vec<ColumnDef>> {
        // format_type keeps precision, scale, array dimensions and enum/domain names
        let query = r#"
            SELECT
                a.attname::text as column_name,
                format_type(a.atttypid, a.atttypmod) as data_type,
                NOT a.attnotnull as is_nullable,
                pg_get_expr(d.adbin, d.adrelid) as column_default,
                a.attidentity <> '' as is_identity,
                EXISTS (
                    SELECT 1 FROM pg_index ix
                    WHERE ix.indrelid = a.attrelid
                      AND ix.indisprimary
                      AND a.attnum = ANY(ix.indkey)
                ) as is_primary_key
            FROM pg_attribute a
            JOIN pg_class t ON t.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE n.nspname = $1
              AND t.relname = $2
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        let columns = rows
            .iter()
            .map(|row| {
                let default_value: Option<String> = row.get("column_default");
                let is_identity: bool = row.get("is_identity");
                let autoincrement = is_identity || is_sequence_default(default_value.as_deref());
                ColumnDef {
                    name: row.get("column_name"),
                    data_type: row.get::<_, String>("data_type").to_uppercase(),
                    nullable: row.get("is_nullable"),
                    default_value: if autoincrement { None } else { default_value },
                    is_primary_key: row.get("is_primary_key"),
                    autoincrement,
                }
            })
            .collect();

        Ok(columns)
    }

    async fn get_indexes(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> AppResult<Vec<IndexDef>> {
        let query = r#"
            SELECT
                i.relname as index_name,
                COALESCE(array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)), ARRAY[]::text[]) as columns,
                ix.indisunique as is_unique,
                ix.indisprimary as is_primary
            FROM pg_class t
            JOIN pg_index ix ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1
              AND t.relname = $2
              AND t.relkind = 'r'
            GROUP BY i.relname, ix.indisunique, ix.indisprimary
            ORDER BY i.relname
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        Ok(rows
            .iter()
            .map(|row| IndexDef {
                name: row.get("index_name"),
                columns: row.try_get("columns").unwrap_or_default(),
                is_unique: row.get("is_unique"),
                is_primary: row.get("is_primary"),
            })
            .collect())
    }

    async fn get_foreign_keys(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> AppResult<Vec<ForeignKeyDef>> {
        // conkey/confkey are positionally paired, so composite keys keep
        // their column order without a cross product
        let query = r#"
            SELECT
                con.conname::text as constraint_name,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) as source_columns,
                rt.relname::text as referenced_table,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) as referenced_columns,
                con.confupdtype::text as on_update,
                con.confdeltype::text as on_delete
            FROM pg_constraint con
            JOIN pg_class t ON t.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_class rt ON rt.oid = con.confrelid
            WHERE n.nspname = $1
              AND t.relname = $2
              AND con.contype = 'f'
            ORDER BY con.conname
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        Ok(rows
            .iter()
            .map(|row| ForeignKeyDef {
                constraint_name: row.get("constraint_name"),
                columns: row.try_get("source_columns").unwrap_or_default(),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.try_get("referenced_columns").unwrap_or_default(),
                on_update: referential_action(row.get("on_update")).to_string(),
                on_delete: referential_action(row.get("on_delete")).to_string(),
            })
            .collect())
    }

    async fn get_constraints(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> AppResult<Vec<ConstraintDef>> {
        let query = r#"
            SELECT
                con.conname::text as constraint_name,
                con.contype::text as constraint_type,
                COALESCE(
                    (SELECT array_agg(a.attname::text ORDER BY a.attnum)
                     FROM pg_attribute a
                     WHERE a.attrelid = con.conrelid AND a.attnum = ANY(con.conkey)),
                    ARRAY[]::text[]
                ) as columns,
                CASE WHEN con.contype = 'c' THEN pg_get_constraintdef(con.oid) END as expression
            FROM pg_constraint con
            JOIN pg_class t ON t.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE n.nspname = $1
              AND t.relname = $2
              AND con.contype IN ('u', 'c')
            ORDER BY con.conname
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let contype: String = row.get("constraint_type");
                ConstraintDef {
                    name: row.get("constraint_name"),
                    kind: if contype == "u" {
                        ConstraintKind::Unique
                    } else {
                        ConstraintKind::Check
                    },
                    columns: row.try_get("columns").unwrap_or_default(),
                    expression: row.get("expression"),
                }
            })
            .collect())
    }
}

#[async_trait]
impl SchemaInspector for PostgresInspector {
    async fn get_all_tables(&self) -> AppResult<Vec<String>> {
        let client = self.pool.get().await?;

        let query = r#"
            SELECT t.table_name
            FROM information_schema.tables t
            WHERE t.table_schema = $1
              AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_name
        "#;

        let rows = client.query(query, &[&self.schema]).await?;
        Ok(rows.iter().map(|row| row.get("table_name")).collect())
    }

    async fn analyze_table(&self, name: &str) -> AppResult<TableInfo> {
        let client = self.pool.get().await?;

        let columns = Self::get_columns(&client, &self.schema, name).await?;
        if columns.is_empty() {
            return Err(AppError::Inspector(format!(
                "Table {}.{} has no visible columns",
                self.schema, name
            )));
        }
        let indexes = Self::get_indexes(&client, &self.schema, name).await?;
        let foreign_keys = Self::get_foreign_keys(&client, &self.schema, name).await?;
        let constraints = Self::get_constraints(&client, &self.schema, name).await?;

        debug!(
            table = name,
            columns = columns.len(),
            indexes = indexes.len(),
            foreign_keys = foreign_keys.len(),
            "Analyzed table"
        );

        Ok(TableInfo {
            name: name.to_string(),
            columns,
            indexes,
            foreign_keys,
            constraints,
        })
    }
}

/// Serial and identity-style defaults draw from a sequence
fn is_sequence_default(default: Option<&str>) -> bool {
    default.map(|d| d.starts_with("nextval(")).unwrap_or(false)
}

/// Spell out a `pg_constraint.confupdtype`/`confdeltype` code
fn referential_action(code: &str) -> &'static str {
    match code {
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        "r" => "RESTRICT",
        _ => "NO ACTION",
    }
}

/// Create a connection pool, with rustls when the target demands TLS
fn create_pool(config: &DatabaseConfig) -> AppResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    if config.use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referential_action_codes() {
        assert_eq!(referential_action("c"), "CASCADE");
        assert_eq!(referential_action("n"), "SET NULL");
        assert_eq!(referential_action("d"), "SET DEFAULT");
        assert_eq!(referential_action("r"), "RESTRICT");
        assert_eq!(referential_action("a"), "NO ACTION");
    }

    #[test]
    fn test_sequence_default_marks_autoincrement() {
        assert!(is_sequence_default(Some("nextval('users_id_seq'::regclass)")));
        assert!(!is_sequence_default(Some("now()")));
        assert!(!is_sequence_default(None));
    }
}
