//! Destination storage seam and its SQLite implementation.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;
use tracing::{debug, instrument};

use super::batch::RowBatch;
use super::decode::Value;
use super::table::TableSpec;
use crate::db::Database;

/// SQLite's default bound on host parameters per statement.
const MAX_BIND_PARAMETERS: usize = 32_766;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Query failed or was rejected by the database.
    #[error("storage query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Table or column name is not a plain identifier.
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// A row does not match the table's column count.
    #[error("row has {found} values, table {table} has {expected} columns")]
    RowWidth {
        table: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Destination of loaded rows.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, StorageError>;

    /// Drops the table if present and recreates it empty.
    async fn reset_table(&self, spec: &TableSpec) -> Result<(), StorageError>;

    /// Inserts every row of the batch atomically; returns the inserted count.
    async fn bulk_insert(&self, batch: &RowBatch) -> Result<u64, StorageError>;

    /// Creates an index on `table(column)`; a no-op when it already exists.
    async fn create_index(&self, table: &str, column: &str) -> Result<(), StorageError>;

    async fn row_count(&self, table: &str) -> Result<u64, StorageError>;
}

/// [`Storage`] backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Names of the indexes defined on `table`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails.
    pub async fn index_names(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? ORDER BY name",
        )
        .bind(table)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

fn identifier(name: &str) -> Result<&str, StorageError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(self.db.pool())
        .await?;
        Ok(count > 0)
    }

    #[instrument(skip(self, spec), fields(table = spec.name))]
    async fn reset_table(&self, spec: &TableSpec) -> Result<(), StorageError> {
        let table = identifier(spec.name)?;
        let mut columns = Vec::with_capacity(spec.columns.len());
        for column in spec.columns {
            columns.push(format!(
                "\"{}\" {}",
                identifier(column.name)?,
                column.kind.sql_type()
            ));
        }

        let mut tx = self.db.pool().begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE \"{table}\" ({})",
            columns.join(", ")
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("table recreated");
        Ok(())
    }

    #[instrument(skip(self, batch), fields(table = batch.table.name, rows = batch.len()))]
    async fn bulk_insert(&self, batch: &RowBatch) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let spec = batch.table;
        let table = identifier(spec.name)?;
        let width = spec.columns.len();
        if let Some(row) = batch.rows.iter().find(|row| row.len() != width) {
            return Err(StorageError::RowWidth {
                table: spec.name,
                expected: width,
                found: row.len(),
            });
        }

        let mut column_list = Vec::with_capacity(width);
        for name in spec.column_names() {
            column_list.push(format!("\"{}\"", identifier(name)?));
        }
        let header = format!("INSERT INTO \"{table}\" ({}) ", column_list.join(", "));
        let rows_per_statement = (MAX_BIND_PARAMETERS / width.max(1)).max(1);

        let mut inserted = 0u64;
        let mut tx = self.db.pool().begin().await?;
        for chunk in batch.rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(&header);
            builder.push_values(chunk, |mut row_builder, row| {
                for value in row {
                    match value {
                        Value::Null => row_builder.push_bind(None::<String>),
                        Value::Text(text) => row_builder.push_bind(text.as_str()),
                        Value::Integer(number) => row_builder.push_bind(*number),
                        Value::Decimal(number) => row_builder.push_bind(*number),
                    };
                }
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn create_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        let table = identifier(table)?;
        let column = identifier(column)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_{column}_idx\" ON \"{table}\" (\"{column}\")"
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64, StorageError> {
        let table = identifier(table)?;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{table}\""))
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::load::table::table_spec;

    async fn storage() -> SqliteStorage {
        SqliteStorage::new(Database::new_in_memory().await.unwrap())
    }

    fn pais_batch(rows: &[(i64, &str)]) -> RowBatch {
        let mut batch = RowBatch::new(table_spec("pais").unwrap(), 100, 1 << 20);
        for (i, (code, name)) in rows.iter().enumerate() {
            batch.push(
                vec![Value::Integer(*code), Value::Text((*name).to_string())],
                i as u64 + 1,
            );
        }
        batch
    }

    #[tokio::test]
    async fn test_reset_table_creates_empty_table() {
        let storage = storage().await;
        let spec = table_spec("pais").unwrap();
        assert!(!storage.table_exists("pais").await.unwrap());

        storage.reset_table(spec).await.unwrap();
        assert!(storage.table_exists("pais").await.unwrap());
        assert_eq!(storage.row_count("pais").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_insert_and_reset_clears_rows() {
        let storage = storage().await;
        let spec = table_spec("pais").unwrap();
        storage.reset_table(spec).await.unwrap();

        let inserted = storage
            .bulk_insert(&pais_batch(&[(105, "BRASIL"), (63, "ARGENTINA")]))
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(storage.row_count("pais").await.unwrap(), 2);

        storage.reset_table(spec).await.unwrap();
        assert_eq!(storage.row_count("pais").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_insert_stores_nulls_and_decimals() {
        let storage = storage().await;
        let spec = table_spec("empresa").unwrap();
        storage.reset_table(spec).await.unwrap();

        let mut batch = RowBatch::new(spec, 10, 1 << 20);
        batch.push(
            vec![
                Value::Text("00000000".into()),
                Value::Text("BANCO".into()),
                Value::Integer(2038),
                Value::Integer(10),
                Value::Decimal(1500.5),
                Value::Null,
                Value::Null,
            ],
            1,
        );
        storage.bulk_insert(&batch).await.unwrap();

        let (basico, capital, porte): (String, f64, Option<i64>) = sqlx::query_as(
            "SELECT cnpj_basico, capital_social, porte_empresa FROM empresa",
        )
        .fetch_one(storage.db.pool())
        .await
        .unwrap();
        assert_eq!(basico, "00000000");
        assert!((capital - 1500.5).abs() < f64::EPSILON);
        assert_eq!(porte, None);
    }

    #[tokio::test]
    async fn test_bulk_insert_into_missing_table_fails() {
        let storage = storage().await;
        let err = storage
            .bulk_insert(&pais_batch(&[(1, "X")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[tokio::test]
    async fn test_create_index_twice_keeps_one_index() {
        let storage = storage().await;
        storage
            .reset_table(table_spec("socios").unwrap())
            .await
            .unwrap();

        storage.create_index("socios", "cnpj_basico").await.unwrap();
        storage.create_index("socios", "cnpj_basico").await.unwrap();

        assert_eq!(
            storage.index_names("socios").await.unwrap(),
            ["socios_cnpj_basico_idx"]
        );
    }

    #[tokio::test]
    async fn test_identifiers_are_checked() {
        let storage = storage().await;
        assert!(matches!(
            storage.create_index("pais; DROP TABLE x", "codigo").await,
            Err(StorageError::InvalidIdentifier(_))
        ));
    }
}
