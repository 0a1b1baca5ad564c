//! SQLite catalogue backend.
//!
//! Timestamps and UUIDs are stored as text; geometry is stored as WKT text
//! so that catalogues without spatial predicates need no native library.
//! Spatial functions go through SpatiaLite, loaded from a configured path;
//! without it, a query using a geometry function fails at execution time.
//!
//! Timestamp arithmetic goes through `julianday`, which caps the precision
//! of timestamp differences at about a millisecond. This is a property of
//! the backend, not a defect: stored timestamps keep full microsecond text
//! precision.

use crate::backend::{DatabaseBackend, SearchQuery, SummaryQuery, SummaryResult};
use crate::sql::{BuiltQuery, Description, SqlBuilder, SqlDialect, SummaryColumn};
use async_trait::async_trait;
use muninn_core::expr::Parameters;
use muninn_core::{DataType, Error, Geometry, Properties, Result, SchemaRegistry, Value};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::instrument;
use uuid::Uuid;

/// Stored timestamp layout; the space separator keeps `julianday` and
/// `strftime` happy while string comparison still orders correctly.
const STORED_TIMESTAMP: &[FormatItem<'_>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
);

fn format_stored_timestamp(timestamp: &PrimitiveDateTime) -> String {
    timestamp
        .format(STORED_TIMESTAMP)
        .expect("timestamp formatting cannot fail")
}

fn parse_stored_timestamp(text: &str) -> Result<PrimitiveDateTime> {
    if let Ok(timestamp) = PrimitiveDateTime::parse(text, STORED_TIMESTAMP) {
        return Ok(timestamp);
    }
    // seconds without a fraction, as produced by datetime('now')
    const BARE: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(timestamp) = PrimitiveDateTime::parse(text, BARE) {
        return Ok(timestamp);
    }
    muninn_core::parse_timestamp(text)
}

pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn column_type(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Boolean => "BOOLEAN",
            DataType::Integer => "INTEGER",
            DataType::Long => "INTEGER",
            DataType::Real => "REAL",
            DataType::Text => "TEXT",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Uuid => "TEXT",
            DataType::Geometry => "GEOMETRY",
            DataType::Json => "TEXT",
        }
    }

    fn geometry_from_text(&self, expr: &str) -> String {
        // geometry is stored as WKT text; conversion happens per predicate
        expr.to_string()
    }

    fn geometry_as_text(&self, column: &str) -> String {
        column.to_string()
    }

    fn geometry_covers(&self, lhs: &str, rhs: &str) -> String {
        format!(
            "(ST_Covers(GeomFromText({lhs}, 4326), GeomFromText({rhs}, 4326)) = 1)"
        )
    }

    fn geometry_intersects(&self, lhs: &str, rhs: &str) -> String {
        format!(
            "(ST_Intersects(GeomFromText({lhs}, 4326), GeomFromText({rhs}, 4326)) = 1)"
        )
    }

    fn geometry_distance(&self, lhs: &str, rhs: &str) -> String {
        format!(
            "ST_Distance(GeomFromText({lhs}, 4326), GeomFromText({rhs}, 4326))"
        )
    }

    fn like(&self, lhs: &str, rhs: &str) -> String {
        format!("({lhs}) LIKE ({rhs}) ESCAPE '\\'")
    }

    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String {
        format!("(julianday({lhs}) - julianday({rhs})) * 86400.0")
    }

    fn timestamp_bin(&self, column: &str, subscript: &str) -> String {
        let pattern = match subscript {
            "year" => "%Y",
            "month" => "%m",
            "yearmonth" => "%Y-%m",
            "date" => "%Y-%m-%d",
            "day" => "%d",
            "hour" => "%H",
            "minute" => "%M",
            "second" => "%S",
            _ => "%H:%M:%S",
        };
        format!("STRFTIME('{pattern}', {column})")
    }

    fn text_length(&self, column: &str) -> String {
        format!("LENGTH({column})")
    }

    fn now_utc(&self) -> String {
        "datetime('now')".to_string()
    }

    fn surrogate_key(&self) -> &'static str {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn spatial_index(&self, _name: &str, _table: &str, _column: &str) -> Option<String> {
        // WKT text columns cannot carry an R*Tree index
        None
    }

    fn cast_long(&self, expr: &str) -> String {
        format!("CAST({expr} AS INTEGER)")
    }

    fn cast_real(&self, expr: &str) -> String {
        format!("CAST({expr} AS REAL)")
    }
}

/// SQLite-backed catalogue.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    schemas: Arc<SchemaRegistry>,
    table_prefix: String,
    dialect: SqliteDialect,
}

impl SqliteBackend {
    /// Create a backend for the given database path or `sqlite:` URL.
    ///
    /// A single pooled connection avoids "database is locked" failures;
    /// SpatiaLite is loaded only when a path is configured.
    pub fn new(
        connection_string: &str,
        table_prefix: &str,
        mod_spatialite_path: Option<&str>,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<Self> {
        let url = if connection_string.starts_with("sqlite:") {
            connection_string.to_string()
        } else {
            format!("sqlite:{connection_string}?mode=rwc")
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| Error::Config(format!("invalid connection string: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        if let Some(path) = mod_spatialite_path {
            options = options.extension(path.to_string());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schemas,
            table_prefix: table_prefix.to_string(),
            dialect: SqliteDialect,
        })
    }

    fn builder(&self) -> SqlBuilder<'_> {
        SqlBuilder::new(&self.schemas, &self.dialect, &self.table_prefix)
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
        if db_error.message().contains("UNIQUE constraint") {
            return Error::Conflict(db_error.message().to_string());
        }
    }
    Error::Backend(error.to_string())
}

fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Conflict(_))
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_params<'q>(mut query: SqliteQuery<'q>, params: &[Value]) -> SqliteQuery<'q> {
    for value in params {
        query = match value {
            Value::Boolean(v) => query.bind(*v),
            Value::Integer(v) => query.bind(*v),
            Value::Long(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Timestamp(v) => query.bind(format_stored_timestamp(v)),
            Value::Uuid(v) => query.bind(v.to_string()),
            Value::Geometry(v) => query.bind(v.to_wkt()),
            Value::Json(v) => query.bind(v.to_string()),
        };
    }
    query
}

fn decode_column(row: &SqliteRow, index: usize, data_type: DataType) -> Result<Option<Value>> {
    let backend_error = |e: sqlx::Error| Error::Backend(e.to_string());
    let value = match data_type {
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(index)
            .map_err(backend_error)?
            .map(Value::Boolean),
        DataType::Integer => row
            .try_get::<Option<i32>, _>(index)
            .map_err(backend_error)?
            .map(Value::Integer),
        DataType::Long => row
            .try_get::<Option<i64>, _>(index)
            .map_err(backend_error)?
            .map(Value::Long),
        DataType::Real => row
            .try_get::<Option<f64>, _>(index)
            .map_err(backend_error)?
            .map(Value::Real),
        DataType::Text => row
            .try_get::<Option<String>, _>(index)
            .map_err(backend_error)?
            .map(Value::Text),
        DataType::Timestamp => row
            .try_get::<Option<String>, _>(index)
            .map_err(backend_error)?
            .map(|text| parse_stored_timestamp(&text).map(Value::Timestamp))
            .transpose()?,
        DataType::Uuid => row
            .try_get::<Option<String>, _>(index)
            .map_err(backend_error)?
            .map(|text| {
                Uuid::parse_str(&text)
                    .map(Value::Uuid)
                    .map_err(|e| Error::Backend(format!("invalid stored uuid: {e}")))
            })
            .transpose()?,
        DataType::Geometry => row
            .try_get::<Option<String>, _>(index)
            .map_err(backend_error)?
            .map(|wkt| Geometry::from_wkt(&wkt).map(Value::Geometry))
            .transpose()?,
        DataType::Json => row
            .try_get::<Option<String>, _>(index)
            .map_err(backend_error)?
            .map(|text| {
                serde_json::from_str(&text)
                    .map(Value::Json)
                    .map_err(|e| Error::Backend(format!("invalid stored json: {e}")))
            })
            .transpose()?,
    };
    Ok(value)
}

fn decode_product_row(row: &SqliteRow, description: &Description) -> Result<Vec<Option<Value>>> {
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
impl DatabaseBackend for SqliteBackend {
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
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
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
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(translate)?;
        }
        tx.commit().await.map_err(translate)
    }

    async fn server_time_utc(&self) -> Result<PrimitiveDateTime> {
        // there is no separate server process; local UTC is the server time
        let now = OffsetDateTime::now_utc();
        Ok(PrimitiveDateTime::new(now.date(), now.time()))
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
                        "DELETE FROM {} WHERE uuid = ?",
                        builder.table_name(namespace)
                    ))
                    .bind(uuid.to_string())
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
            "UPDATE {} SET {} WHERE uuid = ?",
            self.builder().table_name("core"),
            assignments.join(", ")
        ))
        .bind(uuid.to_string())
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
        let uuid_text = uuid.to_string();

        let mut tx = self.pool.begin().await.map_err(translate)?;
        sqlx::query(&format!("DELETE FROM {link} WHERE source_uuid = ?"))
            .bind(&uuid_text)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        sqlx::query(&format!("DELETE FROM {link} WHERE uuid = ?"))
            .bind(&uuid_text)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = ?"))
            .bind(&uuid_text)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;
        let result = sqlx::query(&format!("DELETE FROM {core} WHERE uuid = ?"))
            .bind(&uuid_text)
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
            "INSERT INTO {link} (uuid, source_uuid) SELECT ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM {link} WHERE uuid = ? AND source_uuid = ?)"
        );
        for source_uuid in source_uuids {
            let result = sqlx::query(&sql)
                .bind(uuid.to_string())
                .bind(source_uuid.to_string())
                .bind(uuid.to_string())
                .bind(source_uuid.to_string())
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

    async fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        let link = self.builder().link_table();
        match source_uuids {
            None => {
                sqlx::query(&format!("DELETE FROM {link} WHERE uuid = ?"))
                    .bind(uuid.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(translate)?;
            }
            Some(source_uuids) => {
                for source_uuid in source_uuids {
                    sqlx::query(&format!(
                        "DELETE FROM {link} WHERE uuid = ? AND source_uuid = ?"
                    ))
                    .bind(uuid.to_string())
                    .bind(source_uuid.to_string())
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
            "INSERT INTO {tag} (uuid, tag) SELECT ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM {tag} WHERE uuid = ? AND tag = ?)"
        );
        for text in tags {
            let result = sqlx::query(&sql)
                .bind(uuid.to_string())
                .bind(text)
                .bind(uuid.to_string())
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
                sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = ?"))
                    .bind(uuid.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(translate)?;
            }
            Some(tags) => {
                for text in tags {
                    sqlx::query(&format!("DELETE FROM {tag} WHERE uuid = ? AND tag = ?"))
                        .bind(uuid.to_string())
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
        sqlx::query_scalar(&format!("SELECT tag FROM {tag} WHERE uuid = ? ORDER BY tag"))
            .bind(uuid.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(translate)
    }

    async fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let link = self.builder().link_table();
        let rows: Vec<String> =
            sqlx::query_scalar(&format!("SELECT uuid FROM {link} WHERE source_uuid = ?"))
                .bind(uuid.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(translate)?;
        rows.iter()
            .map(|text| {
                Uuid::parse_str(text).map_err(|e| Error::Backend(format!("invalid stored uuid: {e}")))
            })
            .collect()
    }

    async fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let link = self.builder().link_table();
        let rows: Vec<String> =
            sqlx::query_scalar(&format!("SELECT source_uuid FROM {link} WHERE uuid = ?"))
                .bind(uuid.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(translate)?;
        rows.iter()
            .map(|text| {
                Uuid::parse_str(text).map_err(|e| Error::Backend(format!("invalid stored uuid: {e}")))
            })
            .collect()
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

fn decode_summary_row(row: &SqliteRow, columns: &[SummaryColumn]) -> Result<Vec<Option<Value>>> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| decode_column(row, index, column.data_type))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DatabaseBackend, SearchQuery, SummaryQuery};
    use muninn_core::expr::ParameterValue;
    use muninn_core::schema::{FieldDef, NamespaceDef};
    use muninn_core::PropertyMap;

    fn test_schemas() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                NamespaceDef::new(
                    "mission",
                    vec![
                        FieldDef::optional("orbit", DataType::Long),
                        FieldDef::optional("station", DataType::Text),
                    ],
                )
                .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    struct TestDb {
        backend: SqliteBackend,
        _dir: tempfile::TempDir,
    }

    async fn test_backend() -> TestDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalogue.db");
        let backend = SqliteBackend::new(
            path.to_str().unwrap(),
            "",
            None,
            test_schemas(),
        )
        .unwrap();
        backend.prepare().await.unwrap();
        TestDb {
            backend,
            _dir: dir,
        }
    }

    fn product(name: &str, product_type: &str) -> (Uuid, Properties) {
        let uuid = Uuid::new_v4();
        let mut core = PropertyMap::new();
        core.insert("uuid".to_string(), Value::Uuid(uuid));
        core.insert("active".to_string(), Value::Boolean(true));
        core.insert(
            "metadata_date".to_string(),
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:00:00").unwrap()),
        );
        core.insert("product_type".to_string(), Value::Text(product_type.to_string()));
        core.insert("product_name".to_string(), Value::Text(name.to_string()));
        core.insert("physical_name".to_string(), Value::Text(name.to_string()));
        let mut properties = Properties::new();
        properties.set_namespace("core", core);
        (uuid, properties)
    }

    #[tokio::test]
    async fn prepare_exists_destroy() {
        let db = test_backend().await;
        assert!(db.backend.exists().await.unwrap());
        db.backend.destroy().await.unwrap();
        assert!(!db.backend.exists().await.unwrap());
    }

    #[tokio::test]
    async fn insert_and_search_roundtrip() {
        let db = test_backend().await;
        let (uuid, mut properties) = product("alpha.dat", "ABC");
        properties.set("size", Value::Long(5));
        properties.set("mission.orbit", Value::Long(7));
        db.backend.insert_product(&properties).await.unwrap();

        let query = SearchQuery::new("product_name == \"alpha.dat\"")
            .with_namespaces(vec!["mission".to_string()]);
        let results = db.backend.search(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        let found = &results[0];
        assert_eq!(found.core_uuid().unwrap(), uuid);
        assert_eq!(found.core_long("size"), Some(5));
        assert_eq!(found.get("mission.orbit"), Some(&Value::Long(7)));
        assert!(found.is_defined("mission"));
    }

    #[tokio::test]
    async fn unique_constraints_conflict() {
        let db = test_backend().await;
        let (_, properties) = product("alpha.dat", "ABC");
        db.backend.insert_product(&properties).await.unwrap();

        // same type and name, different uuid
        let (_, mut duplicate) = product("alpha.dat", "ABC");
        duplicate.set("physical_name", Value::Text("other.dat".to_string()));
        let error = db.backend.insert_product(&duplicate).await.unwrap_err();
        assert!(matches!(error, Error::Conflict(_)), "{error}");
        assert_eq!(db.backend.count("", &Parameters::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn null_semantics() {
        let db = test_backend().await;
        let (_, properties) = product("alpha.dat", "ABC");
        db.backend.insert_product(&properties).await.unwrap();

        // remote_url is NULL: != matches, is_defined does not
        let hits = db
            .backend
            .search(&SearchQuery::new("remote_url != \"x\""))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = db
            .backend
            .search(&SearchQuery::new("is_defined(remote_url)"))
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = db
            .backend
            .search(&SearchQuery::new("not is_defined(mission)"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn timestamp_difference_in_seconds() {
        let db = test_backend().await;
        let (uuid, mut properties) = product("alpha.dat", "ABC");
        properties.set(
            "validity_start",
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:00:00").unwrap()),
        );
        properties.set(
            "validity_stop",
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:05:00").unwrap()),
        );
        db.backend.insert_product(&properties).await.unwrap();

        let hits = db
            .backend
            .search(&SearchQuery::new("validity_stop - validity_start > 299"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].core_uuid().unwrap(), uuid);

        let hits = db
            .backend
            .search(&SearchQuery::new("validity_stop - validity_start > 301"))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn pattern_match_with_escape() {
        let db = test_backend().await;
        let (_, properties) = product("S1A_2024.dat", "ABC");
        db.backend.insert_product(&properties).await.unwrap();

        let hits = db
            .backend
            .search(&SearchQuery::new("product_name ~= \"S1%\""))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = db
            .backend
            .search(&SearchQuery::new("product_name ~= \"S_A%\""))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = db
            .backend
            .search(&SearchQuery::new("product_name ~= \"X%\""))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn parameter_binding() {
        let db = test_backend().await;
        let (uuid, properties) = product("alpha.dat", "ABC");
        db.backend.insert_product(&properties).await.unwrap();

        let mut parameters = Parameters::new();
        parameters.insert("uuid".to_string(), ParameterValue::Single(Value::Uuid(uuid)));
        let query = SearchQuery::new("uuid == @uuid").with_parameters(parameters);
        let hits = db.backend.search(&query).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn update_and_namespace_removal() {
        let db = test_backend().await;
        let (uuid, mut properties) = product("alpha.dat", "ABC");
        properties.set("mission.orbit", Value::Long(7));
        db.backend.insert_product(&properties).await.unwrap();

        // plain field update
        let mut update = Properties::new();
        update.set("size", Value::Long(99));
        db.backend.update_product(uuid, &update, &[]).await.unwrap();

        // insert a fresh namespace row
        let mut update = Properties::new();
        update.set("mission.station", Value::Text("kiruna".to_string()));
        db.backend
            .update_product(uuid, &update, &["mission".to_string()])
            .await
            .unwrap_err(); // row exists, insert conflicts
        db.backend.update_product(uuid, &update, &[]).await.unwrap();

        // namespace removal sentinel
        let mut update = Properties::new();
        update.remove_namespace("mission");
        db.backend.update_product(uuid, &update, &[]).await.unwrap();

        let hits = db
            .backend
            .search(&SearchQuery::new("").with_namespaces(vec!["mission".to_string()]))
            .await
            .unwrap();
        assert_eq!(hits[0].core_long("size"), Some(99));
        assert!(!hits[0].is_defined("mission"));
    }

    #[tokio::test]
    async fn links_tags_and_cascade_candidates() {
        let db = test_backend().await;
        let (source, mut source_props) = product("source.dat", "RAW");
        source_props.set("archive_path", Value::Text("raw/2024".to_string()));
        source_props.set(
            "archive_date",
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:00:00").unwrap()),
        );
        let (derived, mut derived_props) = product("derived.dat", "L1");
        derived_props.set("archive_path", Value::Text("l1/2024".to_string()));
        derived_props.set(
            "archive_date",
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-02T00:00:00").unwrap()),
        );
        db.backend.insert_product(&source_props).await.unwrap();
        db.backend.insert_product(&derived_props).await.unwrap();

        db.backend.link(derived, &[source]).await.unwrap();
        db.backend.link(derived, &[source]).await.unwrap(); // idempotent
        assert_eq!(db.backend.source_products(derived).await.unwrap(), vec![source]);
        assert_eq!(db.backend.derived_products(source).await.unwrap(), vec![derived]);

        db.backend
            .tag(derived, &["nrt".to_string(), "test".to_string()])
            .await
            .unwrap();
        db.backend.tag(derived, &["nrt".to_string()]).await.unwrap();
        assert_eq!(
            db.backend.tags(derived).await.unwrap(),
            vec!["nrt".to_string(), "test".to_string()]
        );

        let hits = db
            .backend
            .search(&SearchQuery::new("has_tag(\"nrt\")"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].core_uuid().unwrap(), derived);

        let hits = db
            .backend
            .search(&SearchQuery::new("is_source_of(product_type == \"L1\")"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].core_uuid().unwrap(), source);

        // nothing is orphaned yet
        let orphans = db
            .backend
            .find_products_without_source("L1", Duration::ZERO, false)
            .await
            .unwrap();
        assert!(orphans.is_empty());

        // removing the source takes its link rows with it
        db.backend.delete_product(source).await.unwrap();
        let orphans = db
            .backend
            .find_products_without_source("L1", Duration::ZERO, false)
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].core_uuid().unwrap(), derived);
    }

    #[tokio::test]
    async fn stripped_source_detection() {
        let db = test_backend().await;
        // the source is stripped: catalogued, but no archive_path
        let (source, source_props) = product("source.dat", "RAW");
        let (derived, mut derived_props) = product("derived.dat", "L1");
        derived_props.set("archive_path", Value::Text("l1/2024".to_string()));
        derived_props.set(
            "archive_date",
            Value::Timestamp(muninn_core::parse_timestamp("2024-01-02T00:00:00").unwrap()),
        );
        db.backend.insert_product(&source_props).await.unwrap();
        db.backend.insert_product(&derived_props).await.unwrap();
        db.backend.link(derived, &[source]).await.unwrap();

        let candidates = db
            .backend
            .find_products_without_available_source("L1", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].core_uuid().unwrap(), derived);

        // a grace period reprieves freshly orphaned products
        let candidates = db
            .backend
            .find_products_without_available_source("L1", Duration::days(365 * 100))
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn summary_grouping_and_aggregates() {
        let db = test_backend().await;
        for (name, product_type, size) in [
            ("a.dat", "ABC", 5),
            ("b.dat", "ABC", 7),
            ("c.dat", "XYZ", 11),
        ] {
            let (_, mut properties) = product(name, product_type);
            properties.set("size", Value::Long(size));
            db.backend.insert_product(&properties).await.unwrap();
        }

        let result = db
            .backend
            .summary(&SummaryQuery {
                group_by: vec!["core.product_type".to_string()],
                aggregates: vec!["core.size.sum".to_string(), "core.size.avg".to_string()],
                ..SummaryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(
            result.columns,
            vec!["core.product_type", "count", "core.size.sum", "core.size.avg"]
        );
        assert_eq!(result.rows.len(), 2);
        let abc = &result.rows[0];
        assert_eq!(abc[0], Some(Value::Text("ABC".to_string())));
        assert_eq!(abc[1], Some(Value::Long(2)));
        assert_eq!(abc[2], Some(Value::Long(12)));
        assert_eq!(abc[3], Some(Value::Real(6.0)));

        // having filters on aggregate results
        let result = db
            .backend
            .summary(&SummaryQuery {
                group_by: vec!["core.product_type".to_string()],
                having: Some("count > 1".to_string()),
                ..SummaryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], Some(Value::Text("ABC".to_string())));
    }

    #[tokio::test]
    async fn membership_and_order_by() {
        let db = test_backend().await;
        for (name, size) in [("a.dat", 5i64), ("b.dat", 7), ("c.dat", 3)] {
            let (_, mut properties) = product(name, "ABC");
            properties.set("size", Value::Long(size));
            db.backend.insert_product(&properties).await.unwrap();
        }

        let query = SearchQuery {
            where_clause: "product_name in [\"a.dat\", \"c.dat\"]".to_string(),
            order_by: vec!["-size".to_string()],
            ..SearchQuery::default()
        };
        let hits = db.backend.search(&query).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].core_text("product_name"), Some("a.dat"));
        assert_eq!(hits[1].core_text("product_name"), Some("c.dat"));
    }

    #[tokio::test]
    async fn geometry_stored_as_wkt() {
        let db = test_backend().await;
        let (_, mut properties) = product("geo.dat", "ABC");
        properties.set(
            "footprint",
            Value::Geometry(Geometry::from_wkt("POINT (4.5 52.3)").unwrap()),
        );
        db.backend.insert_product(&properties).await.unwrap();

        let hits = db
            .backend
            .search(&SearchQuery::new("is_defined(footprint)"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].get("footprint"),
            Some(&Value::Geometry(Geometry::from_wkt("POINT (4.5 52.3)").unwrap()))
        );
    }
}
