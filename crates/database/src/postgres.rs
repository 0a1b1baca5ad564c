//! PostgreSQL catalogue backend.
//!
//! Uses PostGIS for geometry (GEOGRAPHY columns, GIST indexes) and relies on
//! `COLLATE "C"` for deterministic text ordering across locales. Connections
//! are pooled and established lazily on first use.

use crate::backend::{DatabaseBackend, SearchQuery, SummaryQuery, SummaryResult};
use crate::sql::{BuiltQuery, Description, SqlBuilder, SqlDialect, SummaryColumn};
use async_trait::async_trait;
use muninn_core::expr::Parameters;
use muninn_core::{DataType, Error, Geometry, Properties, Result, SchemaRegistry, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, PrimitiveDateTime};
use tracing::instrument;
use uuid::Uuid;

/// SQLSTATE class for unique-constraint violations.
const PG_UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn column_type(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Boolean => "BOOLEAN",
            DataType::Integer => "INTEGER",
            DataType::Long => "BIGINT",
            DataType::Real => "DOUBLE PRECISION",
            DataType::Text => "TEXT COLLATE \"C\"",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Uuid => "UUID",
            DataType::Geometry => "GEOGRAPHY",
            DataType::Json => "JSONB",
        }
    }

    fn geometry_from_text(&self, expr: &str) -> String {
        format!("ST_GeogFromText({expr})")
    }

    fn geometry_as_text(&self, column: &str) -> String {
        format!("ST_AsText({column})")
    }

    fn geometry_covers(&self, lhs: &str, rhs: &str) -> String {
        format!("ST_Covers({lhs}, {rhs})")
    }

    fn geometry_intersects(&self, lhs: &str, rhs: &str) -> String {
        format!("ST_Intersects({lhs}, {rhs})")
    }

    fn geometry_distance(&self, lhs: &str, rhs: &str) -> String {
        // non-spheroid distance is considerably faster and close enough
        format!("ST_Distance({lhs}, {rhs}, false)")
    }

    fn like(&self, lhs: &str, rhs: &str) -> String {
        format!("({lhs}) LIKE ({rhs})")
    }

    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String {
        format!("EXTRACT(EPOCH FROM ({lhs}) - ({rhs}))")
    }

    fn timestamp_bin(&self, column: &str, subscript: &str) -> String {
        let pattern = match subscript {
            "year" => "YYYY",
            "month" => "MM",
            "yearmonth" => "YYYY-MM",
            "date" => "YYYY-MM-DD",
            "day" => "DD",
            "hour" => "HH24",
            "minute" => "MI",
            "second" => "SS",
            _ => "HH24:MI:SS",
        };
        format!("TO_CHAR({column}, '{pattern}')")
    }

    fn text_length(&self, column: &str) -> String {
        format!("CHAR_LENGTH({column})")
    }

    fn now_utc(&self) -> String {
        "now() AT TIME ZONE 'UTC'".to_string()
    }

    fn surrogate_key(&self) -> &'static str {
        "id SERIAL PRIMARY KEY"
    }

    fn spatial_index(&self, name: &str, table: &str, column: &str) -> Option<String> {
        Some(format!(
            "CREATE INDEX {name} ON {table} USING GIST ({column})"
        ))
    }

    fn cast_long(&self, expr: &str) -> String {
        format!("CAST({expr} AS BIGINT)")
    }

    fn cast_real(&self, expr: &str) -> String {
        format!("CAST({expr} AS DOUBLE PRECISION)")
    }
}

/// PostgreSQL-backed catalogue.
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    schemas: Arc<SchemaRegistry>,
    table_prefix: String,
    dialect: PostgresDialect,
}

impl PostgresBackend {
    /// Create a backend from a connection string; the pool connects lazily.
    pub fn new(
        connection_string: &str,
        table_prefix: &str,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<Self> {
        let options = sqlx::postgres::PgConnectOptions::from_str(connection_string)
            .map_err(|e| Error::Config(format!("invalid connection string: {e}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schemas,
            table_prefix: table_prefix.to_string(),
            dialect: PostgresDialect,
        })
    }

    fn builder(&self) -> SqlBuilder<'_> {
        SqlBuilder::new(&self.schemas, &self.dialect, &self.table_prefix)
    }

    async fn run(&self, query: &BuiltQuery) -> Result<u64> {
        let result = bind_params(sqlx::query(&query.sql), &query.params)
            .execute(&self.pool)
            .await
            .map_err(translate)?;
        Ok(result.rows_affected())
    }

    async fn fetch_products(
        &self,
        query: &BuiltQuery,
        description: &Description,
    ) -> Result<Vec<Properties>> {
        let rows = bind_params(sqlx::query(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await
            .map_err(translate)?;
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            decoded.push(decode_product_row(row, description)?);
        }
        Ok(SqlBuilder::unpack_rows(description, decoded))
    }
}

fn translate(error: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
            return Error::Conflict(db_error.message().to_string());
        }
    }
    Error::Backend(error.to_string())
}

fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Conflict(_))
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_params<'q>(mut query: PgQuery<'q>, params: &[Value]) -> PgQuery<'q> {
    for value in params {
        query = match value {
            Value::Boolean(v) => query.bind(*v),
            Value::Integer(v) => query.bind(*v),
            Value::Long(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Timestamp(v) => query.bind(*v),
            Value::Uuid(v) => query.bind(*v),
            Value::Geometry(v) => query.bind(v.to_wkt()),
            Value::Json(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_column(row: &PgRow, index: usize, data_type: DataType) -> Result<Option<Value>> {
    let value = match data_type {
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Boolean),
        DataType::Integer => row
            .try_get::<Option<i32>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Integer),
        DataType::Long => row
            .try_get::<Option<i64>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Long),
        DataType::Real => row
            .try_get::<Option<f64>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Real),
        DataType::Text => row
            .try_get::<Option<String>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Text),
        DataType::Timestamp => row
            .try_get::<Option<PrimitiveDateTime>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Timestamp),
        DataType::Uuid => row
            .try_get::<Option<Uuid>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Uuid),
        DataType::Geometry => row
            .try_get::<Option<String>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(|wkt| Geometry::from_wkt(&wkt).map(Value::Geometry))
            .transpose()?,
        DataType::Json => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map_err(|e| Error::Backend(e.to_string()))?
            .map(Value::Json),
    };
    Ok(value)
}

fn decode_product_row(row: &PgRow, description: &Description) -> Result<Vec<Option<Value>>> {
    let mut values = Vec::new();
    let mut index = 0;
    for (_, fields) in description {
        for (_, data_type) in fields {
            values.push(decode_column(row, index, *data_type)?);
            index += 1;
        }
    }
    Ok(values)
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    #[instrument(skip(self))]
    async fn prepare(&self) -> Result<()> {
        let statements = self.builder().build_ddl();
        let mut tx = self.pool.begin().await.map_err(translate)?;
        for statement in statements {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(translate)?;
        }
        tx.commit().await.map_err(translate)
    }

    async fn exists(&self) -> Result<bool> {
        let core_table = self.builder().table_name("core");
        let found: Option<String> =
            sqlx::query_scalar("SELECT relname::text FROM pg_class WHERE relname = $1")
                .bind(core_table)
                .fetch_optional(&self.pool)
                .await
                .map_err(translate)?;
        Ok(found.is_some())
    }

    #[instrument(skip(self))]
    async fn destroy(&self) -> Result<()> {
        let statements = self.builder().build_drop();
        let mut tx = self.pool.begin().await.map_err(translate)?;
        for statement in statements {
            // CASCADE sweeps dependent objects such as spatial indexes
            sqlx::query(&format!("{statement} CASCADE"))
                .execute(&mut *tx)
                .await
                .map_err(translate)?;
        }
        tx.commit().await.map_err(translate)
    }

    async fn server_time_utc(&self) -> Result<PrimitiveDateTime> {
        sqlx::query_scalar("SELECT now() AT TIME ZONE 'UTC'")
            .fetch_one(&self.pool)
            .await
            .map_err(translate)
    }

    #[instrument(skip(self, properties))]
    async fn insert_product(&self, properties: &Properties) -> Result<()> {
        let uuid = properties.core_uuid()?;
        let builder = self.builder();
        let core = properties
            .namespace("core")
            .ok_or_else(|| Error::Schema("core namespace is not set".to_string()))?;

        let mut tx = self.pool.begin().await.map_err(translate)?;
        let query = builder.build_insert("core", core, uuid);
        bind_params(sqlx::query(&query.sql), &query.params)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        for (namespace, record) in properties.iter() {
            if namespace == "core" {
                continue;
            }
            if let Some(record) = record {
                let query = builder.build_insert(namespace, record, uuid);
                bind_params(sqlx::query(&query.sql), &query.params)
                    .execute(&mut *tx)
                    .await
                    .map_err(translate)?;
            }
        }
        tx.commit().await.map_err(translate)
    }

    #[instrument(skip(self, update))]
    async fn update_product(
        &self,
        uuid: Uuid,
        update: &Properties,
        new_namespaces: &[String],
    ) -> Result<()> {
        let builder = self.builder();
        let mut tx = self.pool.begin().await.map_err(translate)?;
        for (namespace, record) in update.iter() {
            match record {
                None => {
                    if namespace == "core" {
                        return Err(Error::Schema(
                            "the core namespace cannot be removed".to_string(),
                        ));
                    }
                    sqlx::query(&format!(
                        "DELETE FROM {} WHERE uuid = $1",
                        builder.table_name(namespace)
                    ))
                    .bind(uuid)
                    .execute(&mut *tx)
                    .await
                    .map_err(translate)?;
                }
                Some(record) => {
                    if record.is_empty() || record.len() == 1 && record.contains_key("uuid") {
                        continue;
                    }
                    let query = if new_namespaces.contains(&namespace.to_string()) {
                        builder.build_insert(namespace, record, uuid)
                    } else {
                        builder.build_update(namespace, record, uuid)
                    };
                    let result = bind_params(sqlx::query(&query.sql), &query.params)
                        .execute(&mut *tx)
                        .await
                        .map_err(translate)?;
                    if namespace == "core" && result.rows_affected() == 0 {
                        return Err(Error::NotFound(format!(
                            "product with uuid '{uuid}' not found"
                        )));
                    }
                }
            }
        }
        tx.commit().await.map_err(translate)
    }

    async fn clear_core_fields(&self, uuid: Uuid, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> =
            fields.iter().map(|field| format!("{field} = NULL")).collect();
        let result = sqlx::query(&format!(
            "UPDATE {} SET {} WHERE uuid = $1",
            self.builder().table_name("core"),
            assignments.join(", ")
        ))
        .bind(uuid)
        .execute(&self.pool)
        .await
        .map_err(translate)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "product with uuid '{uuid}' not found"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_product(&self, uuid: Uuid) -> Result<()> {
        let builder = self.builder();
        let link = builder.link_table();
        let tag = builder.tag_table();
        let core = builder.table_name("core");

        let mut tx = self.pool.begin().await.map_err(translate)?;
        // links of products derived from this one disappear with it, which
        // is what makes them visible to the cascade engine
        sqlx::query(&format!("DELETE FROM {link} WHERE source_uuid = $1"))
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        sqlx::query(&format!("DELETE FROM {link} WHERE uuid = $1"))
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = $1"))
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        let result = sqlx::query(&format!("DELETE FROM {core} WHERE uuid = $1"))
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "product with uuid '{uuid}' not found"
            )));
        }
        tx.commit().await.map_err(translate)
    }

    #[instrument(skip(self, query))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Properties>> {
        let builder = self.builder();
        let (built, description) = builder.build_search(
            &query.where_clause,
            &query.order_by,
            query.limit,
            &query.parameters,
            &query.namespaces,
            &query.property_names,
        )?;
        self.fetch_products(&built, &description).await
    }

    async fn count(&self, where_clause: &str, parameters: &Parameters) -> Result<i64> {
        let query = self.builder().build_count(where_clause, parameters)?;
        let count: i64 = bind_params(sqlx::query(&query.sql), &query.params)
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?
            .try_get(0)
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(count)
    }

    #[instrument(skip(self, query))]
    async fn summary(&self, query: &SummaryQuery) -> Result<SummaryResult> {
        let builder = self.builder();
        let (built, columns) = builder.build_summary(
            &query.where_clause,
            &query.parameters,
            &query.aggregates,
            &query.group_by,
            query.group_by_tag,
            query.having.as_deref(),
            &query.order_by,
        )?;
        let rows = bind_params(sqlx::query(&built.sql), &built.params)
            .fetch_all(&self.pool)
            .await
            .map_err(translate)?;
        let mut result_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            result_rows.push(decode_summary_row(row, &columns)?);
        }
        Ok(SummaryResult {
            columns: columns.into_iter().map(|c| c.label).collect(),
            rows: result_rows,
        })
    }

    async fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        let link = self.builder().link_table();
        let sql = format!(
            "INSERT INTO {link} (uuid, source_uuid) SELECT $1, $2 \
             WHERE NOT EXISTS (SELECT 1 FROM {link} WHERE uuid = $1 AND source_uuid = $2)"
        );
        for source_uuid in source_uuids {
            let result = sqlx::query(&sql)
                .bind(uuid)
                .bind(source_uuid)
                .execute(&self.pool)
                .await
                .map_err(translate);
            // a racing insert may still hit the unique constraint
            if let Err(error) = result {
                if !is_conflict(&error) {
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    async fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        let link = self.builder().link_table();
        match source_uuids {
            None => {
                sqlx::query(&format!("DELETE FROM {link} WHERE uuid = $1"))
                    .bind(uuid)
                    .execute(&self.pool)
                    .await
                    .map_err(translate)?;
            }
            Some(source_uuids) => {
                for source_uuid in source_uuids {
                    sqlx::query(&format!(
                        "DELETE FROM {link} WHERE uuid = $1 AND source_uuid = $2"
                    ))
                    .bind(uuid)
                    .bind(source_uuid)
                    .execute(&self.pool)
                    .await
                    .map_err(translate)?;
                }
            }
        }
        Ok(())
    }

    async fn tag(&self, uuid: Uuid, tags: &[String]) -> Result<()> {
        let tag = self.builder().tag_table();
        let sql = format!(
            "INSERT INTO {tag} (uuid, tag) SELECT $1, $2 \
             WHERE NOT EXISTS (SELECT 1 FROM {tag} WHERE uuid = $1 AND tag = $2)"
        );
        for text in tags {
            let result = sqlx::query(&sql)
                .bind(uuid)
                .bind(text)
                .execute(&self.pool)
                .await
                .map_err(translate);
            if let Err(error) = result {
                if !is_conflict(&error) {
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    async fn untag(&self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        let tag = self.builder().tag_table();
        match tags {
            None => {
                sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = $1"))
                    .bind(uuid)
                    .execute(&self.pool)
                    .await
                    .map_err(translate)?;
            }
            Some(tags) => {
                for text in tags {
                    sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = $1 AND tag = $2"))
                        .bind(uuid)
                        .bind(text)
                        .execute(&self.pool)
                        .await
                        .map_err(translate)?;
                }
            }
        }
        Ok(())
    }

    async fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        let tag = self.builder().tag_table();
        sqlx::query_scalar(&format!(
            "SELECT tag FROM {tag} WHERE uuid = $1 ORDER BY tag"
        ))
        .bind(uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(translate)
    }

    async fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let link = self.builder().link_table();
        sqlx::query_scalar(&format!(
            "SELECT uuid FROM {link} WHERE source_uuid = $1"
        ))
        .bind(uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(translate)
    }

    async fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let link = self.builder().link_table();
        sqlx::query_scalar(&format!(
            "SELECT source_uuid FROM {link} WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(translate)
    }

    async fn find_products_without_source(
        &self,
        product_type: &str,
        grace_period: Duration,
        archived_only: bool,
    ) -> Result<Vec<Properties>> {
        let cutoff = self.server_time_utc().await? - grace_period;
        let (built, description) =
            self.builder()
                .build_find_without_source(product_type, cutoff, archived_only)?;
        self.fetch_products(&built, &description).await
    }

    async fn find_products_without_available_source(
        &self,
        product_type: &str,
        grace_period: Duration,
    ) -> Result<Vec<Properties>> {
        let cutoff = self.server_time_utc().await? - grace_period;
        let (built, description) = self
            .builder()
            .build_find_without_available_source(product_type, cutoff)?;
        self.fetch_products(&built, &description).await
    }
}

fn decode_summary_row(row: &PgRow, columns: &[SummaryColumn]) -> Result<Vec<Option<Value>>> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| decode_column(row, index, column.data_type))
        .collect()
}
