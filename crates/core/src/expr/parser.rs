//! Expression parser.
//!
//! Recursive descent over the token stream. Precedence, low to high:
//! `or`, `and`, `not`, comparison, additive, multiplicative, unary sign,
//! function call / primary. Operators of equal precedence associate to the
//! right. Geometry literals (`POINT (…)` etc.) are parsed directly from the
//! token stream so they can appear anywhere a literal can.

use crate::error::Result;
use crate::expr::lexer::{Token, TokenStream};
use crate::geometry::{Geometry, LineString, LinearRing, Point, Polygon};
use crate::value::Value;
use std::fmt;

/// Untyped abstract syntax tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Property or namespace reference, possibly dotted.
    Name(String),
    /// Bracketed list of expressions (literals after analysis).
    List(Vec<Expr>),
    /// `@name` parameter reference.
    Parameter(String),
    /// Operator application or named function call.
    Function(String, Vec<Expr>),
}

/// Parse an expression and require the input to be fully consumed.
pub fn parse(text: &str) -> Result<Expr> {
    let mut stream = TokenStream::new(text)?;
    let expression = parse_expression(&mut stream)?;
    if !stream.at_end() {
        return Err(stream.error(format!(
            "extra characters after expression: {}",
            stream.token().describe()
        )));
    }
    Ok(expression)
}

fn parse_expression(stream: &mut TokenStream) -> Result<Expr> {
    parse_or(stream)
}

fn parse_or(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_and(stream)?;
    if stream.accept_name("or")? {
        let rhs = parse_or(stream)?;
        return Ok(Expr::Function("or".to_string(), vec![lhs, rhs]));
    }
    Ok(lhs)
}

fn parse_and(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_not(stream)?;
    if stream.accept_name("and")? {
        let rhs = parse_and(stream)?;
        return Ok(Expr::Function("and".to_string(), vec![lhs, rhs]));
    }
    Ok(lhs)
}

fn parse_not(stream: &mut TokenStream) -> Result<Expr> {
    if stream.accept_name("not")? {
        let operand = parse_not(stream)?;
        return Ok(Expr::Function("not".to_string(), vec![operand]));
    }
    parse_comparison(stream)
}

const COMPARISON_OPERATORS: &[&str] = &["<", ">", "==", ">=", "<=", "!=", "~=", "in", "not in"];

fn parse_comparison(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_additive(stream)?;
    for operator in COMPARISON_OPERATORS {
        if stream.accept_operator(operator)? {
            let rhs = parse_comparison(stream)?;
            return Ok(Expr::Function(operator.to_string(), vec![lhs, rhs]));
        }
    }
    Ok(lhs)
}

fn parse_additive(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_multiplicative(stream)?;
    for operator in ["+", "-"] {
        if stream.accept_operator(operator)? {
            let rhs = parse_additive(stream)?;
            return Ok(Expr::Function(operator.to_string(), vec![lhs, rhs]));
        }
    }
    Ok(lhs)
}

fn parse_multiplicative(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_unary(stream)?;
    for operator in ["*", "/"] {
        if stream.accept_operator(operator)? {
            let rhs = parse_multiplicative(stream)?;
            return Ok(Expr::Function(operator.to_string(), vec![lhs, rhs]));
        }
    }
    Ok(lhs)
}

fn parse_unary(stream: &mut TokenStream) -> Result<Expr> {
    for operator in ["+", "-"] {
        if stream.accept_operator(operator)? {
            let operand = parse_unary(stream)?;
            return Ok(Expr::Function(operator.to_string(), vec![operand]));
        }
    }
    parse_atom(stream)
}

const GEOMETRY_TAGS: &[&str] = &[
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
];

fn parse_atom(stream: &mut TokenStream) -> Result<Expr> {
    // sub-expression
    if stream.accept_operator("(")? {
        let inner = parse_expression(stream)?;
        stream.expect_operator(")")?;
        return Ok(inner);
    }

    // parameter reference
    if stream.accept_operator("@")? {
        let name = stream.expect_name()?;
        return Ok(Expr::Parameter(name));
    }

    // list literal
    if stream.is_operator("[") {
        let values = parse_sequence(stream, "[", "]", parse_expression)?;
        return Ok(Expr::List(values));
    }

    // geometry literal, function call, or (dotted) name
    if matches!(stream.token(), Token::Name(_)) {
        let name = stream.expect_name()?;

        if GEOMETRY_TAGS.contains(&name.as_str()) {
            let geometry = parse_geometry(stream, &name)?;
            return Ok(Expr::Literal(Value::Geometry(geometry)));
        }

        if stream.is_operator("(") {
            let arguments = parse_sequence(stream, "(", ")", parse_expression)?;
            return Ok(Expr::Function(name, arguments));
        }

        let mut parts = vec![name];
        while stream.accept_operator(".")? {
            parts.push(stream.expect_name()?);
        }
        return Ok(Expr::Name(parts.join(".")));
    }

    // plain literal
    let position = stream.position();
    match stream.advance()? {
        Token::Text(text) => Ok(Expr::Literal(Value::Text(text))),
        Token::Timestamp(timestamp) => Ok(Expr::Literal(Value::Timestamp(timestamp))),
        Token::Uuid(uuid) => Ok(Expr::Literal(Value::Uuid(uuid))),
        Token::Real(real) => Ok(Expr::Literal(Value::Real(real))),
        Token::Integer(integer) => Ok(Expr::Literal(integer_literal(integer))),
        Token::Boolean(boolean) => Ok(Expr::Literal(Value::Boolean(boolean))),
        Token::End => Err(crate::error::Error::Expression(format!(
            "char {position}: unexpected end of input"
        ))),
        other => Err(crate::error::Error::Expression(format!(
            "char {position}: expected literal, got {}",
            other.describe()
        ))),
    }
}

/// An integer literal in the 32-bit range is typed `integer`, wider ones
/// `long`.
pub fn integer_literal(value: i64) -> Value {
    match i32::try_from(value) {
        Ok(narrow) => Value::Integer(narrow),
        Err(_) => Value::Long(value),
    }
}

fn parse_sequence<T>(
    stream: &mut TokenStream,
    open: &str,
    close: &str,
    mut parse_item: impl FnMut(&mut TokenStream) -> Result<T>,
) -> Result<Vec<T>> {
    stream.expect_operator(open)?;
    if stream.accept_operator(close)? {
        return Ok(Vec::new());
    }
    let mut items = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        items.push(parse_item(stream)?);
    }
    stream.expect_operator(close)?;
    Ok(items)
}

// Geometry literal parsing from the token stream.

fn parse_geometry(stream: &mut TokenStream, tag: &str) -> Result<Geometry> {
    match tag {
        "POINT" => {
            stream.expect_operator("(")?;
            let point = parse_point_raw(stream)?;
            stream.expect_operator(")")?;
            Ok(Geometry::Point(point))
        }
        "LINESTRING" => Ok(Geometry::LineString(parse_line_string(stream)?)),
        "POLYGON" => Ok(Geometry::Polygon(parse_polygon(stream)?)),
        "MULTIPOINT" => Ok(Geometry::MultiPoint(parse_geometry_sequence(
            stream,
            |stream| {
                stream.expect_operator("(")?;
                let point = parse_point_raw(stream)?;
                stream.expect_operator(")")?;
                Ok(point)
            },
        )?)),
        "MULTILINESTRING" => Ok(Geometry::MultiLineString(parse_geometry_sequence(
            stream,
            parse_line_string,
        )?)),
        "MULTIPOLYGON" => Ok(Geometry::MultiPolygon(parse_geometry_sequence(
            stream,
            parse_polygon,
        )?)),
        _ => unreachable!("caller checks the geometry tag"),
    }
}

/// `EMPTY` or a parenthesized comma-separated sequence.
fn parse_geometry_sequence<T>(
    stream: &mut TokenStream,
    mut parse_item: impl FnMut(&mut TokenStream) -> Result<T>,
) -> Result<Vec<T>> {
    if stream.accept_name("EMPTY")? {
        return Ok(Vec::new());
    }
    stream.expect_operator("(")?;
    let mut items = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        items.push(parse_item(stream)?);
    }
    stream.expect_operator(")")?;
    Ok(items)
}

fn parse_signed_coordinate(stream: &mut TokenStream) -> Result<f64> {
    let negative = if stream.accept_operator("-")? {
        true
    } else {
        stream.accept_operator("+")?;
        false
    };
    let position = stream.position();
    let magnitude = match stream.advance()? {
        Token::Integer(value) => value as f64,
        Token::Real(value) => value,
        other => {
            return Err(crate::error::Error::Expression(format!(
                "char {position}: expected coordinate, got {}",
                other.describe()
            )));
        }
    };
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_point_raw(stream: &mut TokenStream) -> Result<Point> {
    let x = parse_signed_coordinate(stream)?;
    let y = parse_signed_coordinate(stream)?;
    Ok(Point::new(x, y))
}

fn parse_line_string(stream: &mut TokenStream) -> Result<LineString> {
    Ok(LineString(parse_geometry_sequence(stream, parse_point_raw)?))
}

fn parse_linear_ring(stream: &mut TokenStream) -> Result<LinearRing> {
    let position = stream.position();
    let points = parse_geometry_sequence(stream, parse_point_raw)?;
    if points.is_empty() {
        return Ok(LinearRing::default());
    }
    if points.len() < 4 {
        return Err(crate::error::Error::Expression(format!(
            "char {position}: linear ring should be empty or should contain >= 4 points"
        )));
    }
    if points.first() != points.last() {
        return Err(crate::error::Error::Expression(format!(
            "char {position}: linear ring should be closed"
        )));
    }
    Ok(LinearRing(points[..points.len() - 1].to_vec()))
}

fn parse_polygon(stream: &mut TokenStream) -> Result<Polygon> {
    Ok(Polygon(parse_geometry_sequence(stream, parse_linear_ring)?))
}

// Formatting back to expression text.

const NAMED_OPERATORS: &[&str] = &["and", "or", "not", "in", "not in"];

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Name(name) => f.write_str(name),
            Expr::Parameter(name) => write!(f, "@{name}"),
            Expr::List(values) => {
                write!(f, "[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
            Expr::Function(name, arguments) => {
                let is_operator = COMPARISON_OPERATORS.contains(&name.as_str())
                    || NAMED_OPERATORS.contains(&name.as_str())
                    || ["+", "-", "*", "/"].contains(&name.as_str());
                match (is_operator, arguments.as_slice()) {
                    (true, [operand]) => {
                        if name == "not" {
                            write!(f, "not ({operand})")
                        } else {
                            write!(f, "{name}({operand})")
                        }
                    }
                    (true, [lhs, rhs]) => write!(f, "({lhs}) {name} ({rhs})"),
                    _ => {
                        write!(f, "{name}(")?;
                        for (index, argument) in arguments.iter().enumerate() {
                            if index > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{argument}")?;
                        }
                        write!(f, ")")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        let expression = parse("not a and b or c").unwrap();
        // ((not a) and b) or c
        assert_eq!(
            expression,
            Expr::Function(
                "or".into(),
                vec![
                    Expr::Function(
                        "and".into(),
                        vec![
                            Expr::Function("not".into(), vec![Expr::Name("a".into())]),
                            Expr::Name("b".into()),
                        ]
                    ),
                    Expr::Name("c".into()),
                ]
            )
        );
    }

    #[test]
    fn multiplicative_binds_tighter_than_additive() {
        let expression = parse("size + 2 * 3 == 11").unwrap();
        assert_eq!(
            expression,
            Expr::Function(
                "==".into(),
                vec![
                    Expr::Function(
                        "+".into(),
                        vec![
                            Expr::Name("size".into()),
                            Expr::Function(
                                "*".into(),
                                vec![
                                    Expr::Literal(Value::Integer(2)),
                                    Expr::Literal(Value::Integer(3)),
                                ]
                            ),
                        ]
                    ),
                    Expr::Literal(Value::Integer(11)),
                ]
            )
        );
    }

    #[test]
    fn dotted_names_and_calls() {
        assert_eq!(
            parse("mission.orbit == 7").unwrap(),
            Expr::Function(
                "==".into(),
                vec![
                    Expr::Name("mission.orbit".into()),
                    Expr::Literal(Value::Integer(7)),
                ]
            )
        );
        assert_eq!(
            parse("is_defined(remote_url)").unwrap(),
            Expr::Function("is_defined".into(), vec![Expr::Name("remote_url".into())])
        );
        assert_eq!(parse("now()").unwrap(), Expr::Function("now".into(), vec![]));
    }

    #[test]
    fn membership_list() {
        let expression = parse("product_type in [\"A\", \"B\"]").unwrap();
        assert_eq!(
            expression,
            Expr::Function(
                "in".into(),
                vec![
                    Expr::Name("product_type".into()),
                    Expr::List(vec![
                        Expr::Literal(Value::Text("A".into())),
                        Expr::Literal(Value::Text("B".into())),
                    ]),
                ]
            )
        );
    }

    #[test]
    fn geometry_literal_in_expression() {
        let expression =
            parse("intersects(footprint, POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0)))").unwrap();
        match expression {
            Expr::Function(name, arguments) => {
                assert_eq!(name, "intersects");
                assert!(matches!(
                    arguments[1],
                    Expr::Literal(Value::Geometry(Geometry::Polygon(_)))
                ));
            }
            other => panic!("unexpected AST: {other:?}"),
        }
    }

    #[test]
    fn unary_sign() {
        assert_eq!(
            parse("-size < -10").unwrap(),
            Expr::Function(
                "<".into(),
                vec![
                    Expr::Function("-".into(), vec![Expr::Name("size".into())]),
                    Expr::Function("-".into(), vec![Expr::Literal(Value::Integer(10))]),
                ]
            )
        );
    }

    #[test]
    fn wide_integer_literal_is_long() {
        assert_eq!(
            parse("4000000000").unwrap(),
            Expr::Literal(Value::Long(4000000000))
        );
        assert_eq!(parse("7").unwrap(), Expr::Literal(Value::Integer(7)));
    }

    #[test]
    fn trailing_tokens_rejected() {
        assert!(parse("size == 1 size").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn format_parse_roundtrip() {
        for text in [
            "(size) >= (42)",
            "((a) and (b)) or (not (c))",
            "(validity_stop) - (validity_start) > (299)",
            "has_tag(\"nrt\")",
            "(product_type) in [\"A\", \"B\"]",
        ] {
            let first = parse(text).unwrap();
            let second = parse(&first.to_string()).unwrap();
            assert_eq!(first, second, "round-trip failed for {text}");
        }
    }
}
