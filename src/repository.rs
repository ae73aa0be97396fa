//! Thin typed repository over PostgreSQL.
//!
//! Entities are serde structs persisted as JSONB rows with framework-
//! managed id and timestamp columns. Every query is built with sea-query
//! and bound through sea-query-binder, so user input never lands in SQL
//! text. Transactions use sqlx's RAII guard: an uncommitted transaction
//! rolls back when dropped, on every exit path.

use std::marker::PhantomData;

use chrono::Utc;
use sea_query::{Alias, Expr, Iden, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors raised by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("entity serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity '{0}' not found")]
    NotFound(String),
}

/// A persistable entity: a serde struct with a framework-assigned ID.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    /// Table the entity lives in.
    fn table() -> &'static str;

    /// Current ID, if assigned.
    fn id(&self) -> Option<String>;

    /// Record the assigned ID.
    fn set_id(&mut self, id: String);
}

/// Framework-managed columns of every entity table.
enum EntityRow {
    Id,
    Data,
    CreatedAt,
    UpdatedAt,
}

impl Iden for EntityRow {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let name = match self {
            EntityRow::Id => "id",
            EntityRow::Data => "data",
            EntityRow::CreatedAt => "created_at",
            EntityRow::UpdatedAt => "updated_at",
        };
        let _ = s.write_str(name);
    }
}

/// Equality filters on entity fields, rendered as `data ->> key = value`.
pub type Filters<'a> = &'a [(&'a str, Value)];

fn filter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Typed CRUD over one entity table.
pub struct Repository<E: Entity> {
    pool: PgPool,
    _marker: PhantomData<E>,
}

impl<E: Entity> Repository<E> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    fn table() -> Alias {
        Alias::new(E::table())
    }

    /// Create the backing table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        // Table name is a compile-time constant of the entity type, not
        // user input.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id TEXT PRIMARY KEY, \
             data JSONB NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL)",
            E::table()
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert an entity, assigning an ID and timestamps if unset.
    pub async fn create(&self, mut entity: E) -> Result<E> {
        let id = entity
            .id()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        entity.set_id(id.clone());

        let data = serde_json::to_value(&entity)?;
        let now = Utc::now();

        let (sql, values) = Query::insert()
            .into_table(Self::table())
            .columns([
                EntityRow::Id,
                EntityRow::Data,
                EntityRow::CreatedAt,
                EntityRow::UpdatedAt,
            ])
            .values_panic([id.into(), data.into(), now.into(), now.into()])
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(entity)
    }

    /// Fetch by ID.
    pub async fn get(&self, id: &str) -> Result<Option<E>> {
        let (sql, values) = Query::select()
            .column(EntityRow::Data)
            .from(Self::table())
            .and_where(Expr::col(EntityRow::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    fn filtered_select(filters: Filters<'_>) -> sea_query::SelectStatement {
        let mut select = Query::select();
        select.column(EntityRow::Data).from(Self::table());
        for (key, value) in filters {
            select.and_where(Expr::cust_with_values(
                "data ->> ? = ?",
                [
                    sea_query::Value::from(*key),
                    sea_query::Value::from(filter_text(value)),
                ],
            ));
        }
        select
    }

    /// First entity matching every filter, if any.
    pub async fn find_one(&self, filters: Filters<'_>) -> Result<Option<E>> {
        let (sql, values) = Self::filtered_select(filters)
            .limit(1)
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    /// All entities matching every filter.
    pub async fn find_by(&self, filters: Filters<'_>) -> Result<Vec<E>> {
        let (sql, values) = Self::filtered_select(filters)
            .order_by(EntityRow::CreatedAt, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row.try_get("data")?;
            entities.push(serde_json::from_value(data)?);
        }
        Ok(entities)
    }

    /// Merge the given object fields into the entity and persist it.
    pub async fn update(&self, id: &str, changes: Value) -> Result<E> {
        let entity = self
            .get(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        let mut data = serde_json::to_value(&entity)?;
        if let (Some(target), Some(patch)) = (data.as_object_mut(), changes.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        let updated: E = serde_json::from_value(data.clone())?;

        let (sql, values) = Query::update()
            .table(Self::table())
            .values([
                (EntityRow::Data, data.into()),
                (EntityRow::UpdatedAt, Utc::now().into()),
            ])
            .and_where(Expr::col(EntityRow::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(updated)
    }

    /// Delete by ID; false when nothing matched.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(Self::table())
            .and_where(Expr::col(EntityRow::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of entities matching every filter.
    pub async fn count(&self, filters: Filters<'_>) -> Result<u64> {
        let mut select = Query::select();
        select
            .expr(Expr::col(EntityRow::Id).count())
            .from(Self::table());
        for (key, value) in filters {
            select.and_where(Expr::cust_with_values(
                "data ->> ? = ?",
                [
                    sea_query::Value::from(*key),
                    sea_query::Value::from(filter_text(value)),
                ],
            ));
        }
        let (sql, values) = select.build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    /// Whether any entity matches every filter.
    pub async fn exists(&self, filters: Filters<'_>) -> Result<bool> {
        Ok(self.count(filters).await? > 0)
    }

    /// Page through entities in creation order.
    pub async fn list(&self, limit: u64, offset: u64) -> Result<Vec<E>> {
        let (sql, values) = Query::select()
            .column(EntityRow::Data)
            .from(Self::table())
            .order_by(EntityRow::CreatedAt, Order::Asc)
            .limit(limit)
            .offset(offset)
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row.try_get("data")?;
            entities.push(serde_json::from_value(data)?);
        }
        Ok(entities)
    }

    /// Begin a transaction. The guard rolls back on drop unless
    /// committed, so early returns and errors release cleanly.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}
