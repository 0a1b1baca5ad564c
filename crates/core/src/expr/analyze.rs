//! Semantic analysis of parsed expressions.
//!
//! Resolves names against the registered namespace schemas, substitutes
//! parameter references, resolves every operator and function against the
//! prototype table, and produces a typed tree ready for lowering by a
//! database backend.

use crate::error::{Error, Result};
use crate::expr::ident::SummaryIdentifier;
use crate::expr::parser::Expr;
use crate::schema::SchemaRegistry;
use crate::value::{DataType, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Type of an expression node.
///
/// Extends the catalogue data types with the two types that only exist
/// inside expressions: bare namespace references and bracketed sequences.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExprType {
    Boolean,
    Integer,
    Long,
    Real,
    Text,
    Timestamp,
    Uuid,
    Geometry,
    Json,
    Namespace,
    Sequence,
}

impl ExprType {
    pub fn name(&self) -> &'static str {
        match self {
            ExprType::Boolean => "boolean",
            ExprType::Integer => "integer",
            ExprType::Long => "long",
            ExprType::Real => "real",
            ExprType::Text => "text",
            ExprType::Timestamp => "timestamp",
            ExprType::Uuid => "uuid",
            ExprType::Geometry => "geometry",
            ExprType::Json => "json",
            ExprType::Namespace => "namespace",
            ExprType::Sequence => "sequence",
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<DataType> for ExprType {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => ExprType::Boolean,
            DataType::Integer => ExprType::Integer,
            DataType::Long => ExprType::Long,
            DataType::Real => ExprType::Real,
            DataType::Text => ExprType::Text,
            DataType::Timestamp => ExprType::Timestamp,
            DataType::Uuid => ExprType::Uuid,
            DataType::Geometry => ExprType::Geometry,
            DataType::Json => ExprType::Json,
        }
    }
}

/// A resolved operator or function signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub argument_types: Vec<ExprType>,
    pub return_type: ExprType,
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments: Vec<&str> = self.argument_types.iter().map(|t| t.name()).collect();
        write!(f, "{}({})", self.name, arguments.join(", "))
    }
}

/// Value bound to a `@parameter` reference.
#[derive(Clone, Debug)]
pub enum ParameterValue {
    Single(Value),
    List(Vec<Value>),
}

impl From<Value> for ParameterValue {
    fn from(value: Value) -> Self {
        ParameterValue::Single(value)
    }
}

/// Caller-supplied parameter bindings.
pub type Parameters = HashMap<String, ParameterValue>;

/// Typed abstract syntax tree.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedExpr {
    Literal(Value),
    /// `namespace.field` property reference.
    Property {
        namespace: String,
        field: String,
        data_type: DataType,
    },
    /// Bare namespace reference (argument of `is_defined`).
    Namespace(String),
    /// Aggregate-result reference; only produced in `having` mode.
    Aggregate(SummaryIdentifier),
    /// Homogeneous list of literal values.
    List(Vec<Value>),
    Call {
        prototype: Prototype,
        arguments: Vec<TypedExpr>,
    },
}

impl TypedExpr {
    pub fn ty(&self) -> ExprType {
        match self {
            TypedExpr::Literal(value) => value.data_type().into(),
            TypedExpr::Property { data_type, .. } => (*data_type).into(),
            TypedExpr::Namespace(_) => ExprType::Namespace,
            TypedExpr::Aggregate(identifier) => identifier
                .data_type
                .map(ExprType::from)
                .unwrap_or(ExprType::Real),
            TypedExpr::List(_) => ExprType::Sequence,
            TypedExpr::Call { prototype, .. } => prototype.return_type,
        }
    }
}

/// Result of semantic analysis: the typed tree plus the parameter names the
/// expression referenced.
#[derive(Clone, Debug)]
pub struct AnalyzedExpr {
    pub root: TypedExpr,
    pub parameters_used: BTreeSet<String>,
}

const NUMERIC: &[ExprType] = &[ExprType::Integer, ExprType::Long, ExprType::Real];

fn numeric_result(a: ExprType, b: ExprType) -> ExprType {
    if a == ExprType::Real || b == ExprType::Real {
        ExprType::Real
    } else if a == ExprType::Long || b == ExprType::Long {
        ExprType::Long
    } else {
        ExprType::Integer
    }
}

/// The table of every operator and function the language supports.
pub struct FunctionTable {
    prototypes: Vec<Prototype>,
}

impl FunctionTable {
    fn add(&mut self, name: &str, argument_types: &[ExprType], return_type: ExprType) {
        self.prototypes.push(Prototype {
            name: name.to_string(),
            argument_types: argument_types.to_vec(),
            return_type,
        });
    }

    pub fn new() -> Self {
        use ExprType::*;
        let mut table = Self {
            prototypes: Vec::new(),
        };

        // logical operators
        table.add("not", &[Boolean], Boolean);
        table.add("and", &[Boolean, Boolean], Boolean);
        table.add("or", &[Boolean, Boolean], Boolean);

        // membership operators
        for element in [Integer, Long, Real, Text] {
            table.add("in", &[element, Sequence], Boolean);
            table.add("not in", &[element, Sequence], Boolean);
        }

        // comparison operators
        for operator in ["==", "!="] {
            for &lhs in NUMERIC {
                for &rhs in NUMERIC {
                    table.add(operator, &[lhs, rhs], Boolean);
                }
            }
            for ty in [Boolean, Text, Timestamp, Uuid] {
                table.add(operator, &[ty, ty], Boolean);
            }
        }
        for operator in ["<", ">", "<=", ">="] {
            for &lhs in NUMERIC {
                for &rhs in NUMERIC {
                    table.add(operator, &[lhs, rhs], Boolean);
                }
            }
            for ty in [Text, Timestamp] {
                table.add(operator, &[ty, ty], Boolean);
            }
        }
        table.add("~=", &[Text, Text], Boolean);

        // arithmetic operators
        for &ty in NUMERIC {
            table.add("+", &[ty], ty);
            table.add("-", &[ty], ty);
        }
        for operator in ["+", "-", "*", "/"] {
            for &lhs in NUMERIC {
                for &rhs in NUMERIC {
                    table.add(operator, &[lhs, rhs], numeric_result(lhs, rhs));
                }
            }
        }
        table.add("-", &[Timestamp, Timestamp], Real);

        // functions
        table.add("covers", &[Geometry, Geometry], Boolean);
        table.add("covers", &[Timestamp, Timestamp, Timestamp, Timestamp], Boolean);
        table.add("intersects", &[Geometry, Geometry], Boolean);
        table.add(
            "intersects",
            &[Timestamp, Timestamp, Timestamp, Timestamp],
            Boolean,
        );
        table.add("distance", &[Geometry, Geometry], Real);
        for ty in [
            Boolean, Integer, Long, Real, Text, Timestamp, Uuid, Geometry, Json, Namespace,
        ] {
            table.add("is_defined", &[ty], Boolean);
        }
        table.add("is_source_of", &[Uuid], Boolean);
        table.add("is_source_of", &[Boolean], Boolean);
        table.add("is_derived_from", &[Uuid], Boolean);
        table.add("is_derived_from", &[Boolean], Boolean);
        table.add("has_tag", &[Text], Boolean);
        table.add("now", &[], Timestamp);

        table
    }

    /// Resolve a call against the table.
    ///
    /// An argument matches its declared type either exactly or through the
    /// UUID-as-boolean coercion (a defined UUID is true in predicates).
    /// Exact matches win over coerced ones.
    pub fn resolve(&self, name: &str, argument_types: &[ExprType]) -> Result<&Prototype> {
        let matches = |coerce: bool| {
            self.prototypes.iter().find(|prototype| {
                prototype.name == name
                    && prototype.argument_types.len() == argument_types.len()
                    && prototype
                        .argument_types
                        .iter()
                        .zip(argument_types)
                        .all(|(expected, actual)| {
                            expected == actual
                                || (coerce
                                    && *actual == ExprType::Uuid
                                    && *expected == ExprType::Boolean)
                        })
            })
        };

        matches(false).or_else(|| matches(true)).ok_or_else(|| {
            let arguments: Vec<&str> = argument_types.iter().map(|t| t.name()).collect();
            Error::Expression(format!(
                "undefined function: \"{name}({})\"",
                arguments.join(", ")
            ))
        })
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Analyzer state for a single expression.
pub struct Analyzer<'a> {
    schemas: &'a SchemaRegistry,
    parameters: &'a Parameters,
    functions: FunctionTable,
    having: bool,
    parameters_used: BTreeSet<String>,
}

impl<'a> Analyzer<'a> {
    pub fn new(schemas: &'a SchemaRegistry, parameters: &'a Parameters) -> Self {
        Self {
            schemas,
            parameters,
            functions: FunctionTable::new(),
            having: false,
            parameters_used: BTreeSet::new(),
        }
    }

    /// Resolve names as aggregate-result references (for HAVING clauses).
    pub fn having(mut self) -> Self {
        self.having = true;
        self
    }

    pub fn analyze(mut self, expression: &Expr) -> Result<AnalyzedExpr> {
        let root = self.visit(expression)?;
        Ok(AnalyzedExpr {
            root,
            parameters_used: self.parameters_used,
        })
    }

    fn visit(&mut self, expression: &Expr) -> Result<TypedExpr> {
        match expression {
            Expr::Literal(value) => Ok(TypedExpr::Literal(value.clone())),
            Expr::Name(name) => self.visit_name(name),
            Expr::List(values) => self.visit_list(values),
            Expr::Parameter(name) => self.visit_parameter(name),
            Expr::Function(name, arguments) => self.visit_call(name, arguments),
        }
    }

    fn visit_name(&mut self, name: &str) -> Result<TypedExpr> {
        if self.having {
            let identifier = SummaryIdentifier::resolve(name, self.schemas)?;
            return Ok(TypedExpr::Aggregate(identifier));
        }

        let (namespace, field) = self.schemas.resolve(name)?;
        let schema = self.schemas.get(&namespace)?;
        match field {
            None => Ok(TypedExpr::Namespace(namespace)),
            Some(field) => {
                let def = schema.field(&field).ok_or_else(|| {
                    if name.contains('.') {
                        Error::Expression(format!("undefined property: \"{name}\""))
                    } else {
                        Error::Expression(format!("undefined name: \"{field}\""))
                    }
                })?;
                Ok(TypedExpr::Property {
                    namespace,
                    field,
                    data_type: def.data_type,
                })
            }
        }
    }

    fn visit_list(&mut self, values: &[Expr]) -> Result<TypedExpr> {
        let mut literals = Vec::with_capacity(values.len());
        for value in values {
            let resolved = match value {
                Expr::Literal(literal) => literal.clone(),
                Expr::Parameter(name) => match self.lookup_parameter(name)? {
                    ParameterValue::Single(literal) => literal,
                    ParameterValue::List(_) => {
                        return Err(Error::Expression(format!(
                            "parameter \"{name}\": nested list in list literal"
                        )));
                    }
                },
                _ => {
                    return Err(Error::Expression(
                        "list contains non-literal".to_string(),
                    ));
                }
            };
            literals.push(resolved);
        }
        check_list_elements(&literals)?;
        Ok(TypedExpr::List(literals))
    }

    fn lookup_parameter(&mut self, name: &str) -> Result<ParameterValue> {
        self.parameters_used.insert(name.to_string());
        self.parameters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Expression(format!("no value for parameter: \"{name}\"")))
    }

    fn visit_parameter(&mut self, name: &str) -> Result<TypedExpr> {
        match self.lookup_parameter(name)? {
            ParameterValue::Single(value) => Ok(TypedExpr::Literal(value)),
            ParameterValue::List(values) => {
                check_list_elements(&values)?;
                Ok(TypedExpr::List(values))
            }
        }
    }

    fn visit_call(&mut self, name: &str, arguments: &[Expr]) -> Result<TypedExpr> {
        let arguments: Vec<TypedExpr> = arguments
            .iter()
            .map(|argument| self.visit(argument))
            .collect::<Result<_>>()?;
        let argument_types: Vec<ExprType> =
            arguments.iter().map(|argument| argument.ty()).collect();
        let prototype = self.functions.resolve(name, &argument_types)?.clone();
        Ok(TypedExpr::Call {
            prototype,
            arguments,
        })
    }
}

/// List elements must be scalars of one type (integer and long may mix).
fn check_list_elements(values: &[Value]) -> Result<()> {
    let mut element_type: Option<ExprType> = None;
    for value in values {
        let ty: ExprType = value.data_type().into();
        if !matches!(
            ty,
            ExprType::Integer | ExprType::Long | ExprType::Real | ExprType::Text
        ) {
            return Err(Error::Expression(format!(
                "list elements of type {ty} are not supported"
            )));
        }
        match element_type {
            None => element_type = Some(ty),
            Some(previous) => {
                let compatible = previous == ty
                    || (matches!(previous, ExprType::Integer | ExprType::Long)
                        && matches!(ty, ExprType::Integer | ExprType::Long));
                if !compatible {
                    return Err(Error::Expression(format!(
                        "list mixes element types {previous} and {ty}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Parse and analyze in one step.
pub fn parse_and_analyze(
    text: &str,
    schemas: &SchemaRegistry,
    parameters: &Parameters,
) -> Result<AnalyzedExpr> {
    let expression = crate::expr::parser::parse(text)?;
    Analyzer::new(schemas, parameters).analyze(&expression)
}

/// Parse and analyze a HAVING expression.
pub fn parse_and_analyze_having(
    text: &str,
    schemas: &SchemaRegistry,
    parameters: &Parameters,
) -> Result<AnalyzedExpr> {
    let expression = crate::expr::parser::parse(text)?;
    Analyzer::new(schemas, parameters).having().analyze(&expression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, NamespaceDef};
    use uuid::Uuid;

    fn schemas() -> SchemaRegistry {
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
        registry
    }

    #[test]
    fn property_resolution() {
        let analyzed =
            parse_and_analyze("size > 100", &schemas(), &Parameters::new()).unwrap();
        match &analyzed.root {
            TypedExpr::Call { prototype, arguments } => {
                assert_eq!(prototype.return_type, ExprType::Boolean);
                assert_eq!(
                    arguments[0],
                    TypedExpr::Property {
                        namespace: "core".into(),
                        field: "size".into(),
                        data_type: DataType::Long,
                    }
                );
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn unknown_identifier_rejected() {
        let error = parse_and_analyze("nosuchfield == 1", &schemas(), &Parameters::new())
            .unwrap_err();
        assert!(error.to_string().contains("undefined name"));

        let error = parse_and_analyze("mission.nosuch == 1", &schemas(), &Parameters::new())
            .unwrap_err();
        assert!(error.to_string().contains("undefined property"));
    }

    #[test]
    fn type_mismatch_rejected() {
        let error = parse_and_analyze(
            "product_name > 5",
            &schemas(),
            &Parameters::new(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("undefined function"));

        // order comparison on boolean is not defined
        assert!(parse_and_analyze("active < true", &schemas(), &Parameters::new()).is_err());
        // equality on geometry is not defined
        assert!(parse_and_analyze(
            "footprint == POINT (0 0)",
            &schemas(),
            &Parameters::new()
        )
        .is_err());
    }

    #[test]
    fn timestamp_subtraction_is_real() {
        let analyzed = parse_and_analyze(
            "validity_stop - validity_start > 299",
            &schemas(),
            &Parameters::new(),
        )
        .unwrap();
        match &analyzed.root {
            TypedExpr::Call { arguments, .. } => {
                assert_eq!(arguments[0].ty(), ExprType::Real);
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn parameter_substitution() {
        let mut parameters = Parameters::new();
        parameters.insert(
            "name".to_string(),
            Value::Text("alpha.dat".to_string()).into(),
        );
        let analyzed = parse_and_analyze(
            "product_name == @name",
            &schemas(),
            &parameters,
        )
        .unwrap();
        assert_eq!(
            analyzed.parameters_used,
            BTreeSet::from(["name".to_string()])
        );

        let error =
            parse_and_analyze("product_name == @other", &schemas(), &parameters).unwrap_err();
        assert!(error.to_string().contains("no value for parameter"));
    }

    #[test]
    fn list_parameter_for_membership() {
        let mut parameters = Parameters::new();
        parameters.insert(
            "types".to_string(),
            ParameterValue::List(vec![
                Value::Text("A".to_string()),
                Value::Text("B".to_string()),
            ]),
        );
        let analyzed =
            parse_and_analyze("product_type in @types", &schemas(), &parameters).unwrap();
        match &analyzed.root {
            TypedExpr::Call { arguments, .. } => {
                assert!(matches!(&arguments[1], TypedExpr::List(values) if values.len() == 2));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn mixed_list_rejected() {
        let error = parse_and_analyze(
            "product_type in [\"A\", 1]",
            &schemas(),
            &Parameters::new(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("mixes element types"));
    }

    #[test]
    fn uuid_coerces_to_boolean() {
        let uuid = Uuid::new_v4();
        let mut parameters = Parameters::new();
        parameters.insert("id".to_string(), Value::Uuid(uuid).into());

        // a UUID literal is acceptable where a boolean predicate is expected
        let analyzed =
            parse_and_analyze("is_source_of(@id)", &schemas(), &parameters).unwrap();
        match &analyzed.root {
            TypedExpr::Call { prototype, .. } => {
                assert_eq!(prototype.argument_types, vec![ExprType::Uuid]);
            }
            other => panic!("unexpected tree: {other:?}"),
        }

        let analyzed = parse_and_analyze(
            "is_derived_from(product_type == \"RAW\")",
            &schemas(),
            &Parameters::new(),
        )
        .unwrap();
        match &analyzed.root {
            TypedExpr::Call { prototype, .. } => {
                assert_eq!(prototype.argument_types, vec![ExprType::Boolean]);
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn namespace_reference_only_in_is_defined() {
        let analyzed =
            parse_and_analyze("is_defined(mission)", &schemas(), &Parameters::new()).unwrap();
        match &analyzed.root {
            TypedExpr::Call { arguments, .. } => {
                assert_eq!(arguments[0], TypedExpr::Namespace("mission".into()));
            }
            other => panic!("unexpected tree: {other:?}"),
        }

        // a bare namespace cannot be compared
        assert!(parse_and_analyze("mission == 1", &schemas(), &Parameters::new()).is_err());
    }

    #[test]
    fn having_mode_resolves_aggregates() {
        let analyzed = parse_and_analyze_having(
            "count > 5",
            &schemas(),
            &Parameters::new(),
        )
        .unwrap();
        match &analyzed.root {
            TypedExpr::Call { arguments, .. } => {
                assert!(matches!(&arguments[0], TypedExpr::Aggregate(id) if id.canonical == "count"));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }
}
