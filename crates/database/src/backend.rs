//! Database backend contract.

use async_trait::async_trait;
use muninn_core::expr::Parameters;
use muninn_core::{Properties, Result, Value};
use time::{Duration, PrimitiveDateTime};
use uuid::Uuid;

/// A catalogue search request.
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    /// Search expression; empty selects everything.
    pub where_clause: String,
    /// Property names with optional `+`/`-` prefixes.
    pub order_by: Vec<String>,
    pub limit: Option<i64>,
    pub parameters: Parameters,
    /// Extension namespaces to return next to `core`.
    pub namespaces: Vec<String>,
    /// When non-empty, only these dotted properties are returned and
    /// `namespaces` is ignored.
    pub property_names: Vec<String>,
}

impl SearchQuery {
    pub fn new(where_clause: impl Into<String>) -> Self {
        Self {
            where_clause: where_clause.into(),
            ..Self::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_property_names(mut self, property_names: &[&str]) -> Self {
        self.property_names = property_names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// A catalogue summary (aggregation) request.
#[derive(Clone, Debug, Default)]
pub struct SummaryQuery {
    pub where_clause: String,
    pub parameters: Parameters,
    /// `<property>.<min|max|sum|avg>` aggregate specifications.
    pub aggregates: Vec<String>,
    /// Grouping keys; timestamps need a binning subscript.
    pub group_by: Vec<String>,
    /// Additionally group by tag (one result row per product per tag).
    pub group_by_tag: bool,
    /// Expression over the aggregated result columns.
    pub having: Option<String>,
    /// Result column labels with optional `+`/`-` prefixes.
    pub order_by: Vec<String>,
}

/// Aggregation result: labeled columns plus one row of values per group.
#[derive(Clone, Debug)]
pub struct SummaryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Value>>>,
}

/// Contract between the archive orchestrator and a catalogue database.
///
/// Implementations own the SQL dialect, the physical schema and the
/// transactional envelope. Multi-statement mutations are atomic: either the
/// whole product (core row plus namespace rows) is written, or nothing is.
/// Expressions are passed in source form and are parsed and analyzed against
/// the schema registry the backend was constructed with.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Create all tables and indexes.
    async fn prepare(&self) -> Result<()>;

    /// Whether the catalogue tables exist.
    async fn exists(&self) -> Result<bool>;

    /// Drop all catalogue tables.
    async fn destroy(&self) -> Result<()>;

    /// The current UTC time as observed by the database server.
    async fn server_time_utc(&self) -> Result<PrimitiveDateTime>;

    /// Insert a new product (core row plus any namespace rows).
    ///
    /// Fails with a conflict error when the UUID, the product type/name pair
    /// or the archive path/physical name pair is already taken.
    async fn insert_product(&self, properties: &Properties) -> Result<()>;

    /// Apply a partial property update to an existing product.
    ///
    /// Namespaces marked with the removal sentinel are deleted; namespaces
    /// listed in `new_namespaces` are inserted instead of updated.
    async fn update_product(
        &self,
        uuid: Uuid,
        update: &Properties,
        new_namespaces: &[String],
    ) -> Result<()>;

    /// Set the listed core fields to NULL (strip clears the archive fields,
    /// rebuild may clear a stale hash).
    async fn clear_core_fields(&self, uuid: Uuid, fields: &[String]) -> Result<()>;

    /// Delete a product row, its namespace and tag rows, and all links in
    /// which it participates.
    async fn delete_product(&self, uuid: Uuid) -> Result<()>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Properties>>;

    async fn count(&self, where_clause: &str, parameters: &Parameters) -> Result<i64>;

    async fn summary(&self, query: &SummaryQuery) -> Result<SummaryResult>;

    /// Record *derived was produced from each source*. Idempotent.
    async fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()>;

    /// Remove links to the given sources, or all links when `None`.
    async fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()>;

    /// Set tags on a product. Idempotent.
    async fn tag(&self, uuid: Uuid, tags: &[String]) -> Result<()>;

    /// Remove the given tags, or all tags when `None`.
    async fn untag(&self, uuid: Uuid, tags: Option<&[String]>) -> Result<()>;

    /// Tags of a product, sorted.
    async fn tags(&self, uuid: Uuid) -> Result<Vec<String>>;

    /// UUIDs of products derived from the given product.
    async fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    /// UUIDs of the source products of the given product.
    async fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    /// Active products of a type whose link rows have all disappeared
    /// (their sources were removed), archived longer ago than the grace
    /// period. With `archived_only`, restricted to products with bytes.
    async fn find_products_without_source(
        &self,
        product_type: &str,
        grace_period: Duration,
        archived_only: bool,
    ) -> Result<Vec<Properties>>;

    /// Active products of a type that still have link rows, but whose every
    /// source exists in the catalogue without bytes (all sources stripped),
    /// archived longer ago than the grace period.
    async fn find_products_without_available_source(
        &self,
        product_type: &str,
        grace_period: Duration,
    ) -> Result<Vec<Properties>>;
}
