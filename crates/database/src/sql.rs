//! Shared SQL generation.
//!
//! Both backends speak almost the same SQL; everything dialect-specific is
//! behind [`SqlDialect`]. The [`SqlBuilder`] lowers analyzed expressions to
//! WHERE clauses, assembles search/count/summary statements, and emits the
//! DDL for the catalogue layout (core table, one table per extension
//! namespace, link and tag tables).
//!
//! NULL handling deliberately coerces three-valued logic into two-valued:
//! `p != x` with `p` NULL is true, `p == x` and `p ~= x` are false, and
//! `is_defined` is the explicit NULL probe.

use muninn_core::expr::{
    parse_and_analyze, parse_and_analyze_having, AnalyzedExpr, ExprType, Parameters,
    SummaryIdentifier, TypedExpr,
};
use muninn_core::{DataType, Error, Properties, Result, SchemaRegistry, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Everything that differs between PostgreSQL and SQLite.
pub trait SqlDialect: Send + Sync {
    /// Parameter placeholder for the 1-based bind index.
    fn placeholder(&self, index: usize) -> String;

    /// Column type in DDL.
    fn column_type(&self, data_type: DataType) -> &'static str;

    /// Wrap a bound placeholder where the wire format is not the column
    /// type (geometry travels as WKT text).
    fn bind_expr(&self, placeholder: &str, data_type: DataType) -> String {
        match data_type {
            DataType::Geometry => self.geometry_from_text(placeholder),
            _ => placeholder.to_string(),
        }
    }

    /// Wrap a selected column (geometry is read back as WKT text).
    fn select_expr(&self, column: &str, data_type: DataType) -> String {
        match data_type {
            DataType::Geometry => self.geometry_as_text(column),
            _ => column.to_string(),
        }
    }

    fn geometry_from_text(&self, expr: &str) -> String;
    fn geometry_as_text(&self, column: &str) -> String;
    fn geometry_covers(&self, lhs: &str, rhs: &str) -> String;
    fn geometry_intersects(&self, lhs: &str, rhs: &str) -> String;
    fn geometry_distance(&self, lhs: &str, rhs: &str) -> String;

    /// Pattern match with `%`/`_` wildcards and backslash escapes.
    fn like(&self, lhs: &str, rhs: &str) -> String;

    /// Timestamp difference in (real) seconds.
    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String;

    /// Timestamp binning for summary group-by subscripts.
    fn timestamp_bin(&self, column: &str, subscript: &str) -> String;

    /// Character length of a text column, typed long.
    fn text_length(&self, column: &str) -> String;

    /// Current UTC time as a timestamp expression.
    fn now_utc(&self) -> String;

    /// Surrogate-key column declaration for the link and tag tables.
    fn surrogate_key(&self) -> &'static str;

    /// Spatial index statement, if the dialect supports one.
    fn spatial_index(&self, name: &str, table: &str, column: &str) -> Option<String>;

    fn cast_long(&self, expr: &str) -> String;
    fn cast_real(&self, expr: &str) -> String;
}

/// A statement with its positional bind values.
#[derive(Clone, Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Column layout of a search result: per namespace, the selected fields in
/// order. Non-core namespaces lead with the implicit `uuid` column, whose
/// NULLness tells namespace presence apart from an all-NULL record.
pub type Description = Vec<(String, Vec<(String, DataType)>)>;

/// One column of a summary result and the type to decode it as.
#[derive(Clone, Debug)]
pub struct SummaryColumn {
    pub label: String,
    pub data_type: DataType,
}

/// Aggregate functions allowed per property type (`None` is the synthesized
/// `validity_duration`).
fn aggregate_functions(data_type: Option<DataType>) -> &'static [&'static str] {
    match data_type {
        Some(DataType::Long) | Some(DataType::Integer) | Some(DataType::Real) | None => {
            &["min", "max", "sum", "avg"]
        }
        Some(DataType::Text) | Some(DataType::Timestamp) => &["min", "max"],
        _ => &[],
    }
}

/// Group-by subscripts allowed per property type; `None` entries mean the
/// bare property may be used without a subscript.
fn group_by_functions(data_type: DataType) -> &'static [Option<&'static str>] {
    match data_type {
        DataType::Long | DataType::Integer | DataType::Boolean => &[None],
        DataType::Text => &[None, Some("length")],
        DataType::Timestamp => &[
            Some("year"),
            Some("month"),
            Some("yearmonth"),
            Some("date"),
            Some("day"),
            Some("hour"),
            Some("minute"),
            Some("second"),
            Some("time"),
        ],
        _ => &[],
    }
}

pub struct SqlBuilder<'a> {
    schemas: &'a SchemaRegistry,
    dialect: &'a dyn SqlDialect,
    prefix: &'a str,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(schemas: &'a SchemaRegistry, dialect: &'a dyn SqlDialect, prefix: &'a str) -> Self {
        Self {
            schemas,
            dialect,
            prefix,
        }
    }

    pub fn table_name(&self, namespace: &str) -> String {
        format!("{}{}", self.prefix, namespace)
    }

    pub fn link_table(&self) -> String {
        self.table_name("link")
    }

    pub fn tag_table(&self) -> String {
        self.table_name("tag")
    }

    fn column(&self, namespace: &str, field: &str) -> String {
        format!("{}.{}", self.table_name(namespace), field)
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    /// Statements creating the full catalogue layout.
    pub fn build_ddl(&self) -> Vec<String> {
        let mut statements = Vec::new();
        let core_table = self.table_name("core");
        let uuid_type = self.dialect.column_type(DataType::Uuid);

        for namespace in self.schemas.iter() {
            let table = self.table_name(namespace.name());
            let mut columns = Vec::new();
            if namespace.name() == "core" {
                for field in namespace.fields() {
                    let mut sql = format!(
                        "{} {}",
                        field.name,
                        self.dialect.column_type(field.data_type)
                    );
                    if field.name == "uuid" {
                        sql.push_str(" PRIMARY KEY");
                    } else if !field.optional {
                        sql.push_str(" NOT NULL");
                    }
                    columns.push(sql);
                }
                columns.push("UNIQUE (product_type, product_name)".to_string());
                columns.push("UNIQUE (archive_path, physical_name)".to_string());
            } else {
                columns.push(format!(
                    "uuid {uuid_type} PRIMARY KEY REFERENCES {core_table} (uuid) ON DELETE CASCADE"
                ));
                for field in namespace.fields() {
                    let mut sql = format!(
                        "{} {}",
                        field.name,
                        self.dialect.column_type(field.data_type)
                    );
                    if !field.optional {
                        sql.push_str(" NOT NULL");
                    }
                    columns.push(sql);
                }
            }
            statements.push(format!("CREATE TABLE {table} ({})", columns.join(", ")));

            for field in namespace.fields() {
                let index_name = format!("idx_{table}_{}", field.name);
                if field.data_type == DataType::Geometry {
                    // geometry columns always get a spatial index
                    if let Some(sql) = self.dialect.spatial_index(&index_name, &table, &field.name)
                    {
                        statements.push(sql);
                    }
                } else if field.indexed {
                    statements.push(format!(
                        "CREATE INDEX {index_name} ON {table} ({})",
                        field.name
                    ));
                }
            }
        }

        let link_table = self.link_table();
        statements.push(format!(
            "CREATE TABLE {link_table} ({}, uuid {uuid_type} NOT NULL, source_uuid {uuid_type} NOT NULL, UNIQUE (uuid, source_uuid))",
            self.dialect.surrogate_key()
        ));
        statements.push(format!(
            "CREATE INDEX idx_{link_table}_uuid ON {link_table} (uuid)"
        ));
        statements.push(format!(
            "CREATE INDEX idx_{link_table}_source_uuid ON {link_table} (source_uuid)"
        ));

        let tag_table = self.tag_table();
        statements.push(format!(
            "CREATE TABLE {tag_table} ({}, uuid {uuid_type} NOT NULL, tag {} NOT NULL, UNIQUE (uuid, tag))",
            self.dialect.surrogate_key(),
            self.dialect.column_type(DataType::Text)
        ));
        statements.push(format!(
            "CREATE INDEX idx_{tag_table}_uuid ON {tag_table} (uuid)"
        ));
        statements.push(format!(
            "CREATE INDEX idx_{tag_table}_tag ON {tag_table} (tag)"
        ));

        statements
    }

    /// Statements dropping the catalogue layout; extension tables first,
    /// core last.
    pub fn build_drop(&self) -> Vec<String> {
        let mut statements = vec![
            format!("DROP TABLE IF EXISTS {}", self.tag_table()),
            format!("DROP TABLE IF EXISTS {}", self.link_table()),
        ];
        for namespace in self.schemas.iter() {
            if namespace.name() != "core" {
                statements.push(format!(
                    "DROP TABLE IF EXISTS {}",
                    self.table_name(namespace.name())
                ));
            }
        }
        statements.push(format!("DROP TABLE IF EXISTS {}", self.table_name("core")));
        statements
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// INSERT for one namespace record. For non-core namespaces the implicit
    /// `uuid` key is added when the map does not carry it.
    pub fn build_insert(
        &self,
        namespace: &str,
        record: &muninn_core::PropertyMap,
        uuid: Uuid,
    ) -> BuiltQuery {
        let mut fields = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();

        if namespace != "core" && !record.contains_key("uuid") {
            fields.push("uuid".to_string());
            params.push(Value::Uuid(uuid));
            placeholders.push(self.bind(params.len(), DataType::Uuid));
        }
        for (field, value) in record {
            fields.push(field.clone());
            params.push(value.clone());
            placeholders.push(self.bind(params.len(), value.data_type()));
        }

        BuiltQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table_name(namespace),
                fields.join(", "),
                placeholders.join(", ")
            ),
            params,
        }
    }

    /// UPDATE for one namespace record, keyed by product UUID.
    pub fn build_update(
        &self,
        namespace: &str,
        record: &muninn_core::PropertyMap,
        uuid: Uuid,
    ) -> BuiltQuery {
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (field, value) in record {
            if field == "uuid" {
                continue;
            }
            params.push(value.clone());
            assignments.push(format!(
                "{field} = {}",
                self.bind(params.len(), value.data_type())
            ));
        }
        params.push(Value::Uuid(uuid));
        let sql = format!(
            "UPDATE {} SET {} WHERE uuid = {}",
            self.table_name(namespace),
            assignments.join(", "),
            self.bind(params.len(), DataType::Uuid)
        );
        BuiltQuery { sql, params }
    }

    fn bind(&self, index: usize, data_type: DataType) -> String {
        self.dialect
            .bind_expr(&self.dialect.placeholder(index), data_type)
    }

    // ------------------------------------------------------------------
    // Search / count
    // ------------------------------------------------------------------

    pub fn build_search(
        &self,
        where_clause: &str,
        order_by: &[String],
        limit: Option<i64>,
        parameters: &Parameters,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<(BuiltQuery, Description)> {
        let mut join_set: BTreeSet<String> = BTreeSet::new();
        let description = if property_names.is_empty() {
            let mut description: Description = vec![(
                "core".to_string(),
                self.schemas
                    .get("core")?
                    .fields()
                    .iter()
                    .map(|field| (field.name.clone(), field.data_type))
                    .collect(),
            )];
            for namespace in namespaces {
                if namespace == "core" {
                    continue;
                }
                let schema = self.schemas.get(namespace)?;
                join_set.insert(namespace.clone());
                let mut fields = vec![("uuid".to_string(), DataType::Uuid)];
                fields.extend(
                    schema
                        .fields()
                        .iter()
                        .map(|field| (field.name.clone(), field.data_type)),
                );
                description.push((namespace.clone(), fields));
            }
            description
        } else {
            let mut description: Description = Vec::new();
            for name in property_names {
                let (namespace, field) = self.schemas.resolve(name)?;
                let field = field.ok_or_else(|| {
                    Error::Expression(format!("invalid property name: \"{name}\""))
                })?;
                let schema = self.schemas.get(&namespace)?;
                let data_type = if field == "uuid" && namespace != "core" {
                    DataType::Uuid
                } else {
                    schema
                        .field(&field)
                        .ok_or_else(|| {
                            Error::Expression(format!(
                                "no property \"{field}\" defined within namespace \"{namespace}\""
                            ))
                        })?
                        .data_type
                };
                join_set.insert(namespace.clone());
                let entry = description.iter_mut().find(|(ns, _)| *ns == namespace);
                match entry {
                    Some((_, fields)) => {
                        if !fields.iter().any(|(name, _)| *name == field) {
                            fields.push((field, data_type));
                        }
                    }
                    None => {
                        // uuid always rides along to tell namespace presence
                        let mut fields = vec![("uuid".to_string(), DataType::Uuid)];
                        if field != "uuid" {
                            fields.push((field, data_type));
                        }
                        description.push((namespace.clone(), fields));
                    }
                }
            }
            description
        };

        let mut visitor = WhereBuilder::new(self);
        let where_sql = if where_clause.is_empty() {
            None
        } else {
            let analyzed = parse_and_analyze(where_clause, self.schemas, parameters)?;
            Some(visitor.build(&analyzed, &mut join_set)?)
        };

        let order_by_sql = self.build_order_by(order_by, &mut join_set)?;

        let mut select_list = Vec::new();
        for (namespace, fields) in &description {
            for (field, data_type) in fields {
                select_list.push(
                    self.dialect
                        .select_expr(&self.column(namespace, field), *data_type),
                );
            }
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list.join(", "),
            self.table_name("core")
        );
        join_set.remove("core");
        for namespace in &join_set {
            sql.push_str(&format!(
                " LEFT JOIN {} USING (uuid)",
                self.table_name(namespace)
            ));
        }
        if let Some(where_sql) = where_sql {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !order_by_sql.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_by_sql.join(", ")));
        }
        if let Some(limit) = limit {
            if limit < 0 {
                return Err(Error::Expression(format!(
                    "limit {limit} must be a positive integer"
                )));
            }
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        Ok((
            BuiltQuery {
                sql,
                params: visitor.params,
            },
            description,
        ))
    }

    pub fn build_count(&self, where_clause: &str, parameters: &Parameters) -> Result<BuiltQuery> {
        let mut join_set = BTreeSet::new();
        let mut visitor = WhereBuilder::new(self);
        let where_sql = if where_clause.is_empty() {
            None
        } else {
            let analyzed = parse_and_analyze(where_clause, self.schemas, parameters)?;
            Some(visitor.build(&analyzed, &mut join_set)?)
        };

        let mut sql = format!(
            "SELECT COUNT(*) FROM {}",
            self.table_name("core")
        );
        join_set.remove("core");
        for namespace in &join_set {
            sql.push_str(&format!(
                " LEFT JOIN {} USING (uuid)",
                self.table_name(namespace)
            ));
        }
        if let Some(where_sql) = where_sql {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        Ok(BuiltQuery {
            sql,
            params: visitor.params,
        })
    }

    fn build_order_by(
        &self,
        order_by: &[String],
        join_set: &mut BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let mut list = Vec::new();
        for item in order_by {
            let (direction, name) = split_direction(item);
            let (namespace, field) = self.schemas.resolve(name)?;
            let field = field.ok_or_else(|| {
                Error::Expression(format!("invalid property name: \"{name}\""))
            })?;
            let schema = self.schemas.get(&namespace)?;
            if !schema.has_field(&field) {
                return Err(Error::Expression(format!(
                    "no property \"{field}\" defined within namespace \"{namespace}\""
                )));
            }
            join_set.insert(namespace.clone());
            list.push(format!("{} {direction}", self.column(&namespace, &field)));
        }
        Ok(list)
    }

    // ------------------------------------------------------------------
    // Summary
    // ------------------------------------------------------------------

    pub fn build_summary(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        having: Option<&str>,
        order_by: &[String],
    ) -> Result<(BuiltQuery, Vec<SummaryColumn>)> {
        let mut group_by: Vec<String> = group_by.to_vec();
        if group_by_tag {
            group_by.push("tag".to_string());
        }

        let mut join_set: BTreeSet<String> = BTreeSet::new();
        let mut columns: Vec<SummaryColumn> = Vec::new();
        let mut select_list: Vec<String> = Vec::new();

        // group-by keys
        for item in &group_by {
            let identifier = SummaryIdentifier::resolve(item, self.schemas)?;
            if let Some(namespace) = &identifier.namespace {
                join_set.insert(namespace.clone());
            }
            let (expr, data_type) = self.group_by_expr(&identifier)?;
            select_list.push(format!("{expr} AS \"{}\"", identifier.resolved()));
            columns.push(SummaryColumn {
                label: identifier.resolved(),
                data_type,
            });
        }

        // row count, always present
        select_list.push("COUNT(*) AS count".to_string());
        columns.push(SummaryColumn {
            label: "count".to_string(),
            data_type: DataType::Long,
        });

        // aggregated fields
        for item in aggregates {
            let identifier = SummaryIdentifier::resolve(item, self.schemas)?;
            if let Some(namespace) = &identifier.namespace {
                join_set.insert(namespace.clone());
            }
            let (expr, data_type) = self.aggregate_expr(&identifier)?;
            select_list.push(format!("{expr} AS \"{}\"", identifier.canonical));
            columns.push(SummaryColumn {
                label: identifier.canonical.clone(),
                data_type,
            });
        }

        let result_fields: Vec<String> = columns.iter().map(|c| c.label.clone()).collect();

        // WHERE
        let mut visitor = WhereBuilder::new(self);
        let where_sql = if where_clause.is_empty() {
            None
        } else {
            let analyzed = parse_and_analyze(where_clause, self.schemas, parameters)?;
            Some(visitor.build(&analyzed, &mut join_set)?)
        };

        // HAVING (parameters share the bind sequence with WHERE)
        let having_sql = match having {
            None => None,
            Some(having) => {
                let analyzed = parse_and_analyze_having(having, self.schemas, parameters)?;
                Some(visitor.build(&analyzed, &mut join_set)?)
            }
        };

        // ORDER BY result labels, group keys as the default tail
        let mut order_by_list = Vec::new();
        for item in order_by {
            let (direction, name) = split_direction(item);
            let identifier = SummaryIdentifier::resolve(name, self.schemas)?;
            let label = if identifier.is_count() || identifier.is_tag() {
                identifier.canonical.clone()
            } else {
                identifier.resolved()
            };
            if !result_fields.contains(&label) {
                return Err(Error::Expression(format!(
                    "cannot order result by \"{label}\"; field is not present in result"
                )));
            }
            order_by_list.push(format!("\"{label}\" {direction}"));
        }
        for position in 1..=group_by.len() {
            order_by_list.push(position.to_string());
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list.join(", "),
            self.table_name("core")
        );
        join_set.remove("core");
        for namespace in &join_set {
            sql.push_str(&format!(
                " LEFT JOIN {} USING (uuid)",
                self.table_name(namespace)
            ));
        }
        if let Some(where_sql) = where_sql {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !group_by.is_empty() {
            let positions: Vec<String> = (1..=group_by.len()).map(|p| p.to_string()).collect();
            sql.push_str(&format!(" GROUP BY {}", positions.join(", ")));
        }
        if let Some(having_sql) = having_sql {
            sql.push_str(&format!(" HAVING {having_sql}"));
        }
        if !order_by_list.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_by_list.join(", ")));
        }

        Ok((
            BuiltQuery {
                sql,
                params: visitor.params,
            },
            columns,
        ))
    }

    fn group_by_expr(&self, identifier: &SummaryIdentifier) -> Result<(String, DataType)> {
        if identifier.is_tag() {
            return Ok((self.column("tag", "tag"), DataType::Text));
        }
        let data_type = identifier.data_type.ok_or_else(|| {
            Error::Expression(format!(
                "property \"{}\" cannot be part of the group_by field specification",
                identifier.property_name()
            ))
        })?;
        let allowed = group_by_functions(data_type);
        if allowed.is_empty() {
            return Err(Error::Expression(format!(
                "property \"{}\" of type {} cannot be part of the group_by field specification",
                identifier.property_name(),
                data_type
            )));
        }
        let subscript = identifier.subscript.as_deref();
        if !allowed.contains(&subscript) {
            return match subscript {
                Some(subscript) => Err(Error::Expression(format!(
                    "group field specification subscript \"{subscript}\" of \"{}\" is not allowed",
                    identifier.canonical
                ))),
                None => Err(Error::Expression(format!(
                    "property \"{}\" of type {} must specify a subscript to be part of the group_by field specification",
                    identifier.property_name(),
                    data_type
                ))),
            };
        }
        let namespace = identifier.namespace.as_deref().unwrap_or("core");
        let column = self.column(namespace, &identifier.field);
        Ok(match subscript {
            None => (column, data_type),
            Some("length") => (
                self.dialect.cast_long(&self.dialect.text_length(&column)),
                DataType::Long,
            ),
            Some(bin) => (self.dialect.timestamp_bin(&column, bin), DataType::Text),
        })
    }

    fn aggregate_expr(&self, identifier: &SummaryIdentifier) -> Result<(String, DataType)> {
        let allowed = aggregate_functions(identifier.data_type);
        if allowed.is_empty() {
            return Err(Error::Expression(format!(
                "property \"{}\" of type {} cannot be part of the summary field specification",
                identifier.property_name(),
                identifier.data_type.map(|t| t.name()).unwrap_or("unknown")
            )));
        }
        let subscript = identifier.subscript.as_deref().ok_or_else(|| {
            Error::Expression(format!(
                "summary field specification \"{}\" must specify a subscript (one of {})",
                identifier.canonical,
                allowed.join(", ")
            ))
        })?;
        if !allowed.contains(&subscript) {
            return Err(Error::Expression(format!(
                "summary field specification subscript \"{subscript}\" of \"{}\" should be one of {}",
                identifier.canonical,
                allowed.join(", ")
            )));
        }

        let namespace = identifier.namespace.as_deref().unwrap_or("core");
        let column = if identifier.is_validity_duration() {
            self.dialect.timestamp_diff(
                &self.column(namespace, "validity_stop"),
                &self.column(namespace, "validity_start"),
            )
        } else {
            self.column(namespace, &identifier.field)
        };

        let aggregate = format!("{}({column})", subscript.to_uppercase());
        Ok(match (subscript, identifier.data_type) {
            // validity_duration is real-valued whatever the reduction
            (_, None) => (self.dialect.cast_real(&aggregate), DataType::Real),
            ("avg", _) => (self.dialect.cast_real(&aggregate), DataType::Real),
            ("sum", Some(DataType::Real)) => (self.dialect.cast_real(&aggregate), DataType::Real),
            ("sum", Some(_)) => (self.dialect.cast_long(&aggregate), DataType::Long),
            (_, Some(data_type)) => (aggregate, data_type),
        })
    }

    // ------------------------------------------------------------------
    // Cascade candidate queries
    // ------------------------------------------------------------------

    fn core_description(&self) -> Result<Description> {
        Ok(vec![(
            "core".to_string(),
            self.schemas
                .get("core")?
                .fields()
                .iter()
                .map(|field| (field.name.clone(), field.data_type))
                .collect(),
        )])
    }

    fn core_select_list(&self, description: &Description) -> String {
        description[0]
            .1
            .iter()
            .map(|(field, data_type)| {
                self.dialect
                    .select_expr(&self.column("core", field), *data_type)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Active products whose link rows have all disappeared.
    pub fn build_find_without_source(
        &self,
        product_type: &str,
        cutoff: time::PrimitiveDateTime,
        archived_only: bool,
    ) -> Result<(BuiltQuery, Description)> {
        let description = self.core_description()?;
        let core = self.table_name("core");
        let link = self.link_table();
        let params = vec![
            Value::Timestamp(cutoff),
            Value::Text(product_type.to_string()),
        ];
        let mut sql = format!(
            "SELECT {} FROM {core} WHERE {core}.active AND {core}.archive_date <= {} \
             AND NOT EXISTS (SELECT 1 FROM {link} WHERE {link}.uuid = {core}.uuid) \
             AND {core}.product_type = {}",
            self.core_select_list(&description),
            self.bind(1, DataType::Timestamp),
            self.bind(2, DataType::Text),
        );
        if archived_only {
            sql.push_str(&format!(" AND {core}.archive_path IS NOT NULL"));
        }
        Ok((BuiltQuery { sql, params }, description))
    }

    /// Active products all of whose sources are catalogued but stripped.
    pub fn build_find_without_available_source(
        &self,
        product_type: &str,
        cutoff: time::PrimitiveDateTime,
    ) -> Result<(BuiltQuery, Description)> {
        let description = self.core_description()?;
        let core = self.table_name("core");
        let link = self.link_table();
        let params = vec![
            Value::Timestamp(cutoff),
            Value::Text(product_type.to_string()),
        ];
        let sql = format!(
            "SELECT {} FROM {core} WHERE {core}.active AND {core}.archive_date <= {} \
             AND {core}.uuid IN (SELECT uuid FROM {link} EXCEPT \
             SELECT DISTINCT {link}.uuid FROM {link} LEFT JOIN {core} AS source \
             ON ({link}.source_uuid = source.uuid) \
             WHERE source.uuid IS NULL OR source.archive_path IS NOT NULL) \
             AND {core}.product_type = {}",
            self.core_select_list(&description),
            self.bind(1, DataType::Timestamp),
            self.bind(2, DataType::Text),
        );
        Ok((BuiltQuery { sql, params }, description))
    }

    /// Turn decoded rows back into property containers, one per row.
    ///
    /// A non-core namespace contributes a record only when its leading
    /// `uuid` column is non-NULL; NULL fields are simply absent.
    pub fn unpack_rows(
        description: &Description,
        rows: Vec<Vec<Option<Value>>>,
    ) -> Vec<Properties> {
        let mut products = Vec::with_capacity(rows.len());
        for row in rows {
            let mut properties = Properties::new();
            let mut index = 0;
            for (namespace, fields) in description {
                let present = namespace == "core"
                    || row
                        .get(index)
                        .is_some_and(|value| value.is_some());
                for (field, _) in fields {
                    if present {
                        if let Some(Some(value)) = row.get(index) {
                            properties
                                .namespace_mut(namespace)
                                .insert(field.clone(), value.clone());
                        }
                    }
                    index += 1;
                }
            }
            products.push(properties);
        }
        products
    }
}

fn split_direction(item: &str) -> (&'static str, &str) {
    if let Some(name) = item.strip_prefix('-') {
        ("DESC", name)
    } else if let Some(name) = item.strip_prefix('+') {
        ("ASC", name)
    } else {
        ("ASC", item)
    }
}

// ----------------------------------------------------------------------
// WHERE clause generation
// ----------------------------------------------------------------------

struct WhereBuilder<'a> {
    builder: &'a SqlBuilder<'a>,
    params: Vec<Value>,
}

impl<'a> WhereBuilder<'a> {
    fn new(builder: &'a SqlBuilder<'a>) -> Self {
        Self {
            builder,
            params: Vec::new(),
        }
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.builder.dialect
    }

    fn push_param(&mut self, value: Value) -> String {
        let data_type = value.data_type();
        self.params.push(value);
        self.builder.bind(self.params.len(), data_type)
    }

    /// Lower a full (boolean) expression. A bare UUID literal is accepted
    /// as shorthand for `uuid == <literal>`.
    fn build(&mut self, analyzed: &AnalyzedExpr, joins: &mut BTreeSet<String>) -> Result<String> {
        let sql = self.visit(&analyzed.root, joins)?;
        if let TypedExpr::Literal(Value::Uuid(_)) = &analyzed.root {
            return Ok(format!(
                "({} = {sql})",
                self.builder.column("core", "uuid")
            ));
        }
        Ok(sql)
    }

    fn visit(&mut self, expr: &TypedExpr, joins: &mut BTreeSet<String>) -> Result<String> {
        match expr {
            TypedExpr::Literal(value) => Ok(self.push_param(value.clone())),
            TypedExpr::Property {
                namespace, field, ..
            } => {
                joins.insert(namespace.clone());
                Ok(self.builder.column(namespace, field))
            }
            TypedExpr::Namespace(namespace) => Err(Error::Expression(format!(
                "namespace reference \"{namespace}\" is only valid as argument of is_defined"
            ))),
            TypedExpr::Aggregate(identifier) => self.visit_aggregate(identifier),
            TypedExpr::List(values) => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|value| self.push_param(value.clone()))
                    .collect();
                Ok(format!("({})", placeholders.join(",")))
            }
            TypedExpr::Call {
                prototype,
                arguments,
            } => self.visit_call(&prototype.name, &prototype.argument_types, arguments, joins),
        }
    }

    fn visit_aggregate(&mut self, identifier: &SummaryIdentifier) -> Result<String> {
        if identifier.is_count() {
            return Ok("COUNT(*)".to_string());
        }
        let namespace = identifier.namespace.as_deref().unwrap_or("core");
        let column = if identifier.is_validity_duration() {
            self.dialect().timestamp_diff(
                &self.builder.column(namespace, "validity_stop"),
                &self.builder.column(namespace, "validity_start"),
            )
        } else {
            self.builder.column(namespace, &identifier.field)
        };
        match &identifier.subscript {
            Some(subscript) => Ok(format!("{}({column})", subscript.to_uppercase())),
            None => Ok(column),
        }
    }

    /// Render an argument, inserting the UUID-as-boolean bridge where the
    /// prototype expects a boolean but the argument is a UUID.
    fn visit_argument(
        &mut self,
        expected: ExprType,
        argument: &TypedExpr,
        joins: &mut BTreeSet<String>,
    ) -> Result<String> {
        let sql = self.visit(argument, joins)?;
        if expected == ExprType::Boolean && argument.ty() == ExprType::Uuid {
            return Ok(format!(
                "({} = {sql})",
                self.builder.column("core", "uuid")
            ));
        }
        Ok(sql)
    }

    fn visit_call(
        &mut self,
        name: &str,
        argument_types: &[ExprType],
        arguments: &[TypedExpr],
        joins: &mut BTreeSet<String>,
    ) -> Result<String> {
        // sub-query forms take a nested predicate with its own join scope
        if matches!(name, "is_source_of" | "is_derived_from")
            && argument_types.first() == Some(&ExprType::Boolean)
            && arguments[0].ty() == ExprType::Boolean
        {
            return self.visit_link_subquery(name, &arguments[0], joins);
        }

        let rendered: Vec<String> = {
            let mut rendered = Vec::with_capacity(arguments.len());
            for (expected, argument) in argument_types.iter().zip(arguments) {
                rendered.push(self.visit_argument(*expected, argument, joins)?);
            }
            rendered
        };

        let core_uuid = self.builder.column("core", "uuid");
        let sql = match name {
            "not" => format!("NOT ({})", rendered[0]),
            "and" => format!("({}) AND ({})", rendered[0], rendered[1]),
            "or" => format!("({}) OR ({})", rendered[0], rendered[1]),
            "in" => format!("({}) in {}", rendered[0], rendered[1]),
            "not in" => format!("({}) not in {}", rendered[0], rendered[1]),
            "==" => format!("({}) = ({})", rendered[0], rendered[1]),
            "!=" => format!("({}) != ({})", rendered[0], rendered[1]),
            "<" | ">" | "<=" | ">=" => {
                format!("({}) {name} ({})", rendered[0], rendered[1])
            }
            "~=" => self.dialect().like(&rendered[0], &rendered[1]),
            "+" | "-" | "*" | "/" => {
                if rendered.len() == 1 {
                    format!("{name} ({})", rendered[0])
                } else if name == "-"
                    && argument_types == [ExprType::Timestamp, ExprType::Timestamp].as_slice()
                {
                    self.dialect().timestamp_diff(&rendered[0], &rendered[1])
                } else {
                    format!("({}) {name} ({})", rendered[0], rendered[1])
                }
            }
            "covers" if argument_types.len() == 4 => {
                // [start0, stop0] covers [start1, stop1]
                format!(
                    "({r0}) >= ({l0}) AND ({r1}) >= ({l1}) AND ({l1}) >= ({l0}) AND ({r1}) <= ({r0})",
                    l0 = rendered[0],
                    r0 = rendered[1],
                    l1 = rendered[2],
                    r1 = rendered[3],
                )
            }
            "intersects" if argument_types.len() == 4 => {
                format!(
                    "({r0}) >= ({l0}) AND ({r1}) >= ({l1}) AND ({r0}) >= ({l1}) AND ({l0}) <= ({r1})",
                    l0 = rendered[0],
                    r0 = rendered[1],
                    l1 = rendered[2],
                    r1 = rendered[3],
                )
            }
            "covers" => self.dialect().geometry_covers(&rendered[0], &rendered[1]),
            "intersects" => self
                .dialect()
                .geometry_intersects(&rendered[0], &rendered[1]),
            "distance" => self.dialect().geometry_distance(&rendered[0], &rendered[1]),
            "is_defined" => match &arguments[0] {
                TypedExpr::Namespace(namespace) => {
                    let table = self.builder.table_name(namespace);
                    format!("EXISTS (SELECT 1 FROM {table} WHERE {table}.uuid = {core_uuid})")
                }
                _ => format!("({}) IS NOT NULL", rendered[0]),
            },
            "is_source_of" => {
                let link = self.builder.link_table();
                format!(
                    "EXISTS (SELECT 1 FROM {link} WHERE {link}.source_uuid = {core_uuid} AND {link}.uuid = ({}))",
                    rendered[0]
                )
            }
            "is_derived_from" => {
                let link = self.builder.link_table();
                format!(
                    "EXISTS (SELECT 1 FROM {link} WHERE {link}.uuid = {core_uuid} AND {link}.source_uuid = ({}))",
                    rendered[0]
                )
            }
            "has_tag" => {
                let tag = self.builder.tag_table();
                format!(
                    "EXISTS (SELECT 1 FROM {tag} WHERE {tag}.uuid = {core_uuid} AND {tag}.tag = ({}))",
                    rendered[0]
                )
            }
            "now" => self.dialect().now_utc(),
            other => {
                return Err(Error::Backend(format!(
                    "function not supported by backend: \"{other}\""
                )));
            }
        };

        // two-valued NULL semantics for comparisons of a property against a
        // literal: != matches NULL, == and ~= do not
        if matches!(name, "==" | "!=" | "~=") {
            let property_side = match (&arguments[0], &arguments[1]) {
                (TypedExpr::Property { .. }, TypedExpr::Literal(_)) => Some(&rendered[0]),
                (TypedExpr::Literal(_), TypedExpr::Property { .. }) => Some(&rendered[1]),
                _ => None,
            };
            if let Some(column) = property_side {
                return Ok(if name == "!=" {
                    format!("({sql} OR {column} IS NULL)")
                } else {
                    format!("({sql} AND {column} IS NOT NULL)")
                });
            }
        }

        Ok(sql)
    }

    /// `is_source_of(expr)` / `is_derived_from(expr)` sub-queries over the
    /// link table, with the nested predicate's namespaces joined inside.
    fn visit_link_subquery(
        &mut self,
        name: &str,
        predicate: &TypedExpr,
        _outer_joins: &mut BTreeSet<String>,
    ) -> Result<String> {
        let mut inner_joins = BTreeSet::new();
        let where_sql = self.visit(predicate, &mut inner_joins)?;
        inner_joins.remove("core");

        let core = self.builder.table_name("core");
        let link = self.builder.link_table();
        let mut join_sql = String::new();
        for namespace in &inner_joins {
            join_sql.push_str(&format!(
                " INNER JOIN {} USING (uuid)",
                self.builder.table_name(namespace)
            ));
        }

        Ok(if name == "is_source_of" {
            format!(
                "{core}.uuid in (SELECT {link}.source_uuid FROM {core}{join_sql} \
                 INNER JOIN {link} ON {link}.uuid = {core}.uuid WHERE {where_sql})"
            )
        } else {
            format!(
                "{core}.uuid in (SELECT {link}.uuid FROM {core}{join_sql} \
                 INNER JOIN {link} ON {link}.source_uuid = {core}.uuid WHERE {where_sql})"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muninn_core::schema::{FieldDef, NamespaceDef};

    /// A minimal dialect with PostgreSQL-ish syntax for builder tests.
    struct TestDialect;

    impl SqlDialect for TestDialect {
        fn placeholder(&self, index: usize) -> String {
            format!("${index}")
        }
        fn column_type(&self, data_type: DataType) -> &'static str {
            match data_type {
                DataType::Boolean => "BOOLEAN",
                DataType::Integer => "INTEGER",
                DataType::Long => "BIGINT",
                DataType::Real => "DOUBLE PRECISION",
                DataType::Text => "TEXT",
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
            format!("ST_Distance({lhs}, {rhs}, false)")
        }
        fn like(&self, lhs: &str, rhs: &str) -> String {
            format!("({lhs}) LIKE ({rhs})")
        }
        fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String {
            format!("EXTRACT(EPOCH FROM ({lhs}) - ({rhs}))")
        }
        fn timestamp_bin(&self, column: &str, subscript: &str) -> String {
            format!("BIN({column}, {subscript})")
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
            Some(format!("CREATE INDEX {name} ON {table} USING GIST ({column})"))
        }
        fn cast_long(&self, expr: &str) -> String {
            format!("CAST({expr} AS BIGINT)")
        }
        fn cast_real(&self, expr: &str) -> String {
            format!("CAST({expr} AS DOUBLE PRECISION)")
        }
    }

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                NamespaceDef::new(
                    "mission",
                    vec![FieldDef::optional("orbit", DataType::Long)],
                )
                .unwrap(),
            )
            .unwrap();
        registry
    }

    fn builder_sql(where_clause: &str) -> BuiltQuery {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "");
        builder
            .build_count(where_clause, &Parameters::new())
            .unwrap()
    }

    #[test]
    fn null_coercion_on_inequality() {
        let query = builder_sql("remote_url != \"x\"");
        assert!(
            query.sql.contains("OR core.remote_url IS NULL"),
            "{}",
            query.sql
        );
        assert_eq!(query.params.len(), 1);

        let query = builder_sql("remote_url == \"x\"");
        assert!(
            query.sql.contains("AND core.remote_url IS NOT NULL"),
            "{}",
            query.sql
        );
    }

    #[test]
    fn is_defined_lowering() {
        let query = builder_sql("is_defined(remote_url)");
        assert!(query.sql.contains("(core.remote_url) IS NOT NULL"));

        let query = builder_sql("is_defined(mission)");
        assert!(
            query
                .sql
                .contains("EXISTS (SELECT 1 FROM mission WHERE mission.uuid = core.uuid)"),
            "{}",
            query.sql
        );
    }

    #[test]
    fn extension_namespace_joined() {
        let query = builder_sql("mission.orbit == 7");
        assert!(query.sql.contains("LEFT JOIN mission USING (uuid)"));
        assert!(query.sql.contains("mission.orbit"));
    }

    #[test]
    fn timestamp_subtraction_uses_dialect() {
        let query = builder_sql("validity_stop - validity_start > 299");
        assert!(
            query
                .sql
                .contains("EXTRACT(EPOCH FROM (core.validity_stop) - (core.validity_start))"),
            "{}",
            query.sql
        );
    }

    #[test]
    fn membership_parameters() {
        let query = builder_sql("product_type in [\"A\", \"B\"]");
        assert!(query.sql.contains("in ($1,$2)"), "{}", query.sql);
        assert_eq!(query.params.len(), 2);
    }

    #[test]
    fn link_predicates() {
        let query = builder_sql("is_derived_from(01234567-89ab-cdef-0123-456789abcdef)");
        assert!(
            query.sql.contains("link.uuid = core.uuid AND link.source_uuid = ($1)"),
            "{}",
            query.sql
        );

        let query = builder_sql("is_derived_from(product_type == \"RAW\")");
        assert!(
            query
                .sql
                .contains("SELECT link.uuid FROM core INNER JOIN link ON link.source_uuid = core.uuid"),
            "{}",
            query.sql
        );

        let query = builder_sql("has_tag(\"nrt\")");
        assert!(query.sql.contains("tag.tag = ($1)"), "{}", query.sql);
    }

    #[test]
    fn search_description_and_projection() {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "");
        let (query, description) = builder
            .build_search(
                "",
                &["-archive_date".to_string()],
                Some(10),
                &Parameters::new(),
                &[],
                &["uuid".to_string(), "mission.orbit".to_string()],
            )
            .unwrap();
        assert!(query.sql.contains("ORDER BY core.archive_date DESC"));
        assert!(query.sql.contains("LIMIT 10"));
        assert_eq!(description[0].0, "core");
        // non-core namespaces carry the implicit uuid column first
        assert_eq!(description[1].1[0].0, "uuid");
    }

    #[test]
    fn geometry_wrapped_in_select_and_bind() {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "");
        let (query, _) = builder
            .build_search(
                "intersects(footprint, POINT (1 2))",
                &[],
                None,
                &Parameters::new(),
                &[],
                &[],
            )
            .unwrap();
        assert!(query.sql.contains("ST_AsText(core.footprint)"));
        assert!(
            query
                .sql
                .contains("ST_Intersects(core.footprint, ST_GeogFromText($1))"),
            "{}",
            query.sql
        );
        assert!(matches!(query.params[0], Value::Geometry(_)));
    }

    #[test]
    fn summary_query_shape() {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "");
        let (query, columns) = builder
            .build_summary(
                "",
                &Parameters::new(),
                &["core.size.sum".to_string(), "core.validity_duration.avg".to_string()],
                &["core.product_type".to_string(), "core.validity_start.yearmonth".to_string()],
                true,
                Some("count > 1"),
                &["-count".to_string()],
            )
            .unwrap();
        assert!(query.sql.contains("GROUP BY 1, 2, 3"), "{}", query.sql);
        assert!(query.sql.contains("COUNT(*) AS count"));
        assert!(query.sql.contains("HAVING (COUNT(*)) > ($1)"), "{}", query.sql);
        assert!(query.sql.contains("ORDER BY \"count\" DESC, 1, 2, 3"));
        assert!(query.sql.contains("LEFT JOIN tag USING (uuid)"));
        assert!(
            query.sql.contains("CAST(SUM(core.size) AS BIGINT)"),
            "{}",
            query.sql
        );
        let labels: Vec<&str> = columns.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "core.product_type",
                "core.validity_start.yearmonth",
                "tag",
                "count",
                "core.size.sum",
                "core.validity_duration.avg",
            ]
        );
    }

    #[test]
    fn summary_rejects_bad_subscripts() {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "");
        // sum over text is not allowed
        assert!(builder
            .build_summary(
                "",
                &Parameters::new(),
                &["core.product_name.sum".to_string()],
                &[],
                false,
                None,
                &[],
            )
            .is_err());
        // timestamps need a binning subscript in group_by
        assert!(builder
            .build_summary(
                "",
                &Parameters::new(),
                &[],
                &["core.validity_start".to_string()],
                false,
                None,
                &[],
            )
            .is_err());
        // ordering by an absent result column
        assert!(builder
            .build_summary(
                "",
                &Parameters::new(),
                &[],
                &["core.product_type".to_string()],
                false,
                None,
                &["core.size.sum".to_string()],
            )
            .is_err());
    }

    #[test]
    fn ddl_layout() {
        let schemas = schemas();
        let builder = SqlBuilder::new(&schemas, &TestDialect, "pfx_");
        let ddl = builder.build_ddl();
        let all = ddl.join(";\n");
        assert!(all.contains("CREATE TABLE pfx_core"));
        assert!(all.contains("UNIQUE (product_type, product_name)"));
        assert!(all.contains("UNIQUE (archive_path, physical_name)"));
        assert!(all.contains(
            "uuid UUID PRIMARY KEY REFERENCES pfx_core (uuid) ON DELETE CASCADE"
        ));
        assert!(all.contains("CREATE INDEX idx_pfx_core_footprint ON pfx_core USING GIST (footprint)"));
        assert!(all.contains("CREATE TABLE pfx_link"));
        assert!(all.contains("UNIQUE (uuid, tag)"));
        // drop order: dependent tables first, core last
        let drop = builder.build_drop();
        assert_eq!(drop.last().unwrap(), "DROP TABLE IF EXISTS pfx_core");
    }

    #[test]
    fn unpack_skips_absent_namespaces() {
        let description: Description = vec![
            (
                "core".to_string(),
                vec![
                    ("product_name".to_string(), DataType::Text),
                    ("size".to_string(), DataType::Long),
                ],
            ),
            (
                "mission".to_string(),
                vec![
                    ("uuid".to_string(), DataType::Uuid),
                    ("orbit".to_string(), DataType::Long),
                ],
            ),
        ];
        let uuid = Uuid::new_v4();
        let rows = vec![
            vec![
                Some(Value::Text("alpha".to_string())),
                None,
                Some(Value::Uuid(uuid)),
                Some(Value::Long(7)),
            ],
            vec![Some(Value::Text("beta".to_string())), Some(Value::Long(5)), None, None],
        ];
        let products = SqlBuilder::unpack_rows(&description, rows);
        assert!(products[0].is_defined("mission"));
        assert_eq!(products[0].get("mission.orbit"), Some(&Value::Long(7)));
        assert!(products[0].get("size").is_none());
        assert!(!products[1].is_defined("mission"));
        assert_eq!(products[1].get("size"), Some(&Value::Long(5)));
    }
}
