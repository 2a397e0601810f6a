// PostgreSQL-backed document repository
//
// Every collection lives in one JSONB table keyed by
// (partition_key, collection, id). The etag column is the concurrency token;
// each conditional write is a single statement guarded by it.

use super::{
    is_valid_field_path, Collection, ConcurrencyToken, Document, DocumentRepository, FieldKind,
    FieldValue, Filter, Query,
};
use crate::config::StoreConfig;
use crate::errors::RepositoryError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Production repository variant
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    table: String,
}

impl PostgresDocumentStore {
    /// Wrap an existing pool; `table` must already be a validated identifier
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Connect using the store section of the settings
    #[instrument(skip(config), fields(database = %config.database_id, collection = %config.collection_id))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, RepositoryError> {
        info!("Connecting to document store");

        let mut options = PgConnectOptions::from_str(&config.endpoint)
            .map_err(|e| RepositoryError::StoreUnavailable(format!("Invalid endpoint: {}", e)))?
            .database(&config.database_id);
        if let Some(key) = config.access_key.as_deref().filter(|k| !k.is_empty()) {
            options = options.password(key);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to document store");
                RepositoryError::StoreUnavailable(e.to_string())
            })?;

        info!(
            max_connections = config.max_connections,
            "Document store connection pool initialized"
        );
        Ok(Self::new(pool, config.collection_id.clone()))
    }

    /// Create the document table and its indexes when missing
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS "{table}" (
                    partition_key TEXT NOT NULL,
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    etag UUID NOT NULL,
                    body JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (partition_key, collection, id)
                )
                "#,
                table = self.table
            ),
            format!(
                r#"
                CREATE INDEX IF NOT EXISTS "{table}_due_idx" ON "{table}"
                    (partition_key, collection, (body ->> 'state'), ((body ->> 'next_fire_time')::bigint))
                "#,
                table = self.table
            ),
            format!(
                r#"
                CREATE INDEX IF NOT EXISTS "{table}_owner_idx" ON "{table}"
                    (partition_key, collection, (body ->> 'instance_id'))
                "#,
                table = self.table
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!("Document table ready");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!("Document store health check passed");
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing document store connection pool");
        self.pool.close().await;
    }
}

fn row_to_document(row: &PgRow) -> Result<Document, RepositoryError> {
    let etag: Uuid = row.try_get("etag")?;
    Ok(Document {
        id: row.try_get("id")?,
        body: row.try_get("body")?,
        token: ConcurrencyToken::new(etag.to_string()),
    })
}

fn parse_token(token: &ConcurrencyToken) -> Option<Uuid> {
    Uuid::parse_str(token.as_str()).ok()
}

fn conflict(collection: Collection, id: &str) -> RepositoryError {
    RepositoryError::ConcurrencyConflict {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

/// `body #>> '{a,b}'` with the cast matching the compared value
fn push_field(qb: &mut QueryBuilder<'_, Postgres>, path: &str, kind: FieldKind) {
    let json_path = format!("(body #>> '{{{}}}')", path.replace('.', ","));
    match kind {
        FieldKind::Integer => qb.push(format!("({})::bigint", json_path)),
        FieldKind::Text => qb.push(format!("{} COLLATE \"C\"", json_path)),
    };
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    let op = match filter {
        Filter::Eq(..) => " = ",
        Filter::Lt(..) => " < ",
        Filter::Lte(..) => " <= ",
    };
    qb.push(" AND ");
    match filter.value() {
        FieldValue::Text(s) => {
            push_field(qb, filter.field(), FieldKind::Text);
            qb.push(op);
            qb.push_bind(s.clone());
        }
        FieldValue::Integer(i) => {
            push_field(qb, filter.field(), FieldKind::Integer);
            qb.push(op);
            qb.push_bind(*i);
        }
        FieldValue::Bool(b) => {
            qb.push(format!(
                "((body #>> '{{{}}}')::boolean)",
                filter.field().replace('.', ",")
            ));
            qb.push(op);
            qb.push_bind(*b);
        }
    }
}

fn build_select(
    table: &str,
    partition: String,
    collection: Collection,
    query: &Query,
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let all_paths = query
        .filters
        .iter()
        .map(Filter::field)
        .chain(query.order_by.iter().map(|k| k.field.as_str()));
    for path in all_paths {
        if !is_valid_field_path(path) {
            return Err(RepositoryError::Query(format!(
                "invalid field path '{}'",
                path
            )));
        }
    }

    let mut qb = QueryBuilder::new(format!(
        r#"SELECT id, etag, body FROM "{}" WHERE partition_key = "#,
        table
    ));
    qb.push_bind(partition);
    qb.push(" AND collection = ");
    qb.push_bind(collection.as_str());

    for filter in &query.filters {
        push_filter(&mut qb, filter);
    }

    qb.push(" ORDER BY ");
    for key in &query.order_by {
        push_field(&mut qb, &key.field, key.kind);
        qb.push(if key.descending {
            " DESC NULLS LAST, "
        } else {
            " ASC NULLS LAST, "
        });
    }
    qb.push("id COLLATE \"C\" ASC");

    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    Ok(qb)
}

#[async_trait]
impl DocumentRepository for PostgresDocumentStore {
    #[instrument(skip(self), fields(collection = %collection))]
    async fn get(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
    ) -> Result<Document, RepositoryError> {
        let sql = format!(
            r#"SELECT id, etag, body FROM "{}" WHERE partition_key = $1 AND collection = $2 AND id = $3"#,
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(partition)
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_document(&row),
            None => Err(RepositoryError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    #[instrument(skip(self, body, expected), fields(collection = %collection, conditional = expected.is_some()))]
    async fn upsert(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        body: Value,
        expected: Option<&ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, RepositoryError> {
        let new_etag = Uuid::new_v4();

        let written: Option<Uuid> = match expected {
            None => {
                let sql = format!(
                    r#"
                    INSERT INTO "{}" (partition_key, collection, id, etag, body)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (partition_key, collection, id) DO NOTHING
                    RETURNING etag
                    "#,
                    self.table
                );
                sqlx::query_scalar(&sql)
                    .bind(partition)
                    .bind(collection.as_str())
                    .bind(id)
                    .bind(new_etag)
                    .bind(&body)
                    .fetch_optional(&self.pool)
                    .await?
            }
            Some(token) => {
                let current = match parse_token(token) {
                    Some(current) => current,
                    None => return Err(conflict(collection, id)),
                };
                let sql = format!(
                    r#"
                    UPDATE "{}" SET body = $4, etag = $5, updated_at = now()
                    WHERE partition_key = $1 AND collection = $2 AND id = $3 AND etag = $6
                    RETURNING etag
                    "#,
                    self.table
                );
                sqlx::query_scalar(&sql)
                    .bind(partition)
                    .bind(collection.as_str())
                    .bind(id)
                    .bind(&body)
                    .bind(new_etag)
                    .bind(current)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        match written {
            Some(etag) => Ok(ConcurrencyToken::new(etag.to_string())),
            None => Err(conflict(collection, id)),
        }
    }

    fn query(
        &self,
        partition: &str,
        collection: Collection,
        query: Query,
    ) -> BoxStream<'static, Result<Document, RepositoryError>> {
        let pool = self.pool.clone();
        let table = self.table.clone();
        let partition = partition.to_string();

        stream::once(async move {
            let mut qb = build_select(&table, partition, collection, &query)?;
            let rows = qb.build().fetch_all(&pool).await?;
            let documents = rows
                .iter()
                .map(row_to_document)
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, RepositoryError>(stream::iter(documents.into_iter().map(Ok)))
        })
        .try_flatten()
        .boxed()
    }

    #[instrument(skip(self, expected), fields(collection = %collection))]
    async fn delete(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        expected: &ConcurrencyToken,
    ) -> Result<(), RepositoryError> {
        let deleted = match parse_token(expected) {
            Some(etag) => {
                let sql = format!(
                    r#"DELETE FROM "{}" WHERE partition_key = $1 AND collection = $2 AND id = $3 AND etag = $4"#,
                    self.table
                );
                sqlx::query(&sql)
                    .bind(partition)
                    .bind(collection.as_str())
                    .bind(id)
                    .bind(etag)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            None => 0,
        };

        if deleted == 1 {
            return Ok(());
        }

        // tell a lost race apart from a missing document
        match self.get(partition, collection, id).await {
            Ok(_) => Err(conflict(collection, id)),
            Err(RepositoryError::NotFound { .. }) => Err(RepositoryError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
