// ABOUTME: Source table schema cache backed by information_schema
// ABOUTME: Maps binlog row ordinals to column names for each replicated table

use std::collections::HashMap;
use std::sync::Arc;

use mysql_async::prelude::Queryable;
use mysql_async::Pool;

use crate::error::ReplicateError;

/// One column of a source table, in binlog ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub ordinal_position: u32,
    pub data_type: String,
    pub is_primary_key: bool,
}

/// Lazy cache of source table layouts.
///
/// Binlog row events carry values by ordinal only, so every rows event needs
/// the column list of its table. Each (database, table) pair is fetched from
/// `information_schema` once and reused for the rest of the run; a schema
/// change mid-run requires a restart, matching the binlog's own assumption
/// that the table map event describes the current layout.
pub struct SchemaCache {
    pool: Option<Pool>,
    tables: HashMap<(String, String), Arc<Vec<ColumnDescriptor>>>,
}

impl SchemaCache {
    pub fn new(pool: Pool) -> Self {
        SchemaCache {
            pool: Some(pool),
            tables: HashMap::new(),
        }
    }

    /// A cache with fixed contents and no backing connection, for tests and
    /// offline replay.
    pub fn preloaded(
        tables: impl IntoIterator<Item = ((String, String), Vec<ColumnDescriptor>)>,
    ) -> Self {
        SchemaCache {
            pool: None,
            tables: tables
                .into_iter()
                .map(|(key, columns)| (key, Arc::new(columns)))
                .collect(),
        }
    }

    /// Returns the ordered column list for `database`.`table`, querying the
    /// source on first use.
    pub async fn resolve(
        &mut self,
        database: &str,
        table: &str,
    ) -> Result<Arc<Vec<ColumnDescriptor>>, ReplicateError> {
        let key = (database.to_string(), table.to_string());
        if let Some(columns) = self.tables.get(&key) {
            return Ok(Arc::clone(columns));
        }
        let pool = self.pool.as_ref().ok_or_else(|| {
            ReplicateError::schema_lookup(database, table, "table not preloaded")
        })?;
        let columns = fetch_columns(pool, database, table).await?;
        if columns.is_empty() {
            return Err(ReplicateError::schema_lookup(
                database,
                table,
                "no such table in information_schema",
            ));
        }
        let columns = Arc::new(columns);
        self.tables.insert(key, Arc::clone(&columns));
        Ok(columns)
    }
}

async fn fetch_columns(
    pool: &Pool,
    database: &str,
    table: &str,
) -> Result<Vec<ColumnDescriptor>, ReplicateError> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| ReplicateError::schema_lookup(database, table, e))?;
    let rows: Vec<(String, u32, String, String)> = conn
        .exec(
            "SELECT column_name, ordinal_position, data_type, column_key \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position",
            (database, table),
        )
        .await
        .map_err(|e| ReplicateError::schema_lookup(database, table, e))?;
    Ok(rows
        .into_iter()
        .map(
            |(name, ordinal_position, data_type, column_key)| ColumnDescriptor {
                name,
                ordinal_position,
                data_type,
                is_primary_key: column_key == "PRI",
            },
        )
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_and_name() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor {
                name: "id".into(),
                ordinal_position: 1,
                data_type: "int".into(),
                is_primary_key: true,
            },
            ColumnDescriptor {
                name: "name".into(),
                ordinal_position: 2,
                data_type: "varchar".into(),
                is_primary_key: false,
            },
        ]
    }

    #[tokio::test]
    async fn test_preloaded_resolve() {
        let mut cache = SchemaCache::preloaded([(
            ("shop".to_string(), "items".to_string()),
            id_and_name(),
        )]);
        let columns = cache.resolve("shop", "items").await.unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert!(columns[0].is_primary_key);
        assert_eq!(columns[1].name, "name");
    }

    #[tokio::test]
    async fn test_same_table_name_in_other_database_is_a_miss() {
        let mut cache = SchemaCache::preloaded([(
            ("shop".to_string(), "items".to_string()),
            id_and_name(),
        )]);
        let err = cache.resolve("warehouse", "items").await.unwrap_err();
        assert!(matches!(err, ReplicateError::SchemaLookup { .. }));
    }
}
