//! JSON to property conversion for the command line.
//!
//! Update payloads come in as a JSON object mapping namespace to a field
//! object; `null` for a whole namespace marks it for removal. Values are
//! coerced against the archive's schema so timestamps, UUIDs and geometry
//! can be written as strings.

use anyhow::{anyhow, bail, Context};
use muninn_core::{DataType, Geometry, Properties, SchemaRegistry, Value};

pub fn properties_from_json(
    json: &serde_json::Value,
    schemas: &SchemaRegistry,
) -> anyhow::Result<Properties> {
    let object = json
        .as_object()
        .ok_or_else(|| anyhow!("expected a JSON object of namespaces"))?;

    let mut properties = Properties::new();
    for (namespace, fields) in object {
        if fields.is_null() {
            properties.remove_namespace(namespace);
            continue;
        }
        let schema = schemas
            .lookup(namespace)
            .ok_or_else(|| anyhow!("undefined namespace: \"{namespace}\""))?;
        let fields = fields
            .as_object()
            .ok_or_else(|| anyhow!("namespace \"{namespace}\" is not a JSON object"))?;
        for (field, value) in fields {
            let def = schema
                .field(field)
                .ok_or_else(|| anyhow!("undefined property: \"{namespace}.{field}\""))?;
            let value = coerce(value, def.data_type)
                .with_context(|| format!("property \"{namespace}.{field}\""))?;
            properties
                .namespace_mut(namespace)
                .insert(field.clone(), value);
        }
    }
    Ok(properties)
}

fn coerce(value: &serde_json::Value, data_type: DataType) -> anyhow::Result<Value> {
    let result = match (data_type, value) {
        (DataType::Boolean, serde_json::Value::Bool(v)) => Value::Boolean(*v),
        (DataType::Integer, serde_json::Value::Number(n)) => Value::Integer(
            n.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| anyhow!("not a 32-bit integer: {n}"))?,
        ),
        (DataType::Long, serde_json::Value::Number(n)) => {
            Value::Long(n.as_i64().ok_or_else(|| anyhow!("not an integer: {n}"))?)
        }
        (DataType::Real, serde_json::Value::Number(n)) => {
            Value::Real(n.as_f64().ok_or_else(|| anyhow!("not a number: {n}"))?)
        }
        (DataType::Text, serde_json::Value::String(s)) => Value::Text(s.clone()),
        (DataType::Timestamp, serde_json::Value::String(s)) => {
            Value::Timestamp(muninn_core::parse_timestamp(s).map_err(|e| anyhow!("{e}"))?)
        }
        (DataType::Uuid, serde_json::Value::String(s)) => {
            Value::Uuid(s.parse().map_err(|e| anyhow!("invalid uuid: {e}"))?)
        }
        (DataType::Geometry, serde_json::Value::String(s)) => {
            Value::Geometry(Geometry::from_wkt(s).map_err(|e| anyhow!("{e}"))?)
        }
        (DataType::Json, value) => Value::Json(value.clone()),
        (expected, value) => bail!("cannot read {value} as {expected}"),
    };
    Ok(result)
}

/// A `name=value` command line parameter; the value is parsed as a JSON
/// scalar, with a fallback to plain text.
pub fn parse_parameter(
    text: &str,
) -> anyhow::Result<(String, muninn_core::expr::ParameterValue)> {
    use muninn_core::expr::ParameterValue;

    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("parameter must be name=value: \"{text}\""))?;
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Bool(v)) => Value::Boolean(v),
        Ok(serde_json::Value::Number(n)) if n.is_i64() => {
            let v = n.as_i64().unwrap_or_default();
            match i32::try_from(v) {
                Ok(narrow) => Value::Integer(narrow),
                Err(_) => Value::Long(v),
            }
        }
        Ok(serde_json::Value::Number(n)) => Value::Real(n.as_f64().unwrap_or_default()),
        Ok(serde_json::Value::String(s)) => text_parameter(&s),
        _ => text_parameter(raw),
    };
    Ok((name.to_string(), ParameterValue::Single(value)))
}

/// Strings that look like timestamps or UUIDs bind as such.
fn text_parameter(raw: &str) -> Value {
    if let Ok(uuid) = raw.parse::<uuid::Uuid>() {
        return Value::Uuid(uuid);
    }
    if let Ok(timestamp) = muninn_core::parse_timestamp(raw) {
        return Value::Timestamp(timestamp);
    }
    Value::Text(raw.to_string())
}
