//! Summary field identifiers.
//!
//! Aggregates, group-by keys, HAVING references and summary order-by keys
//! all name a property with an optional subscript: `<namespace>.<field>`,
//! `<namespace>.<field>.<subscript>`, the pseudo-properties `count` and
//! `tag`, and the synthesized `core.validity_duration`. Unlike search
//! expressions, summary names must spell out the namespace; a two-segment
//! name whose first segment is not a registered namespace is taken as
//! `core.<field>.<subscript>`.

use crate::error::{Error, Result};
use crate::schema::SchemaRegistry;
use crate::value::DataType;

/// A resolved summary identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryIdentifier {
    /// The identifier as written, used as the result column label.
    pub canonical: String,
    /// Owning namespace; `None` for the row-count pseudo-property.
    pub namespace: Option<String>,
    /// Field name, or `count` / `tag`.
    pub field: String,
    /// Aggregate function or binning subscript, if any.
    pub subscript: Option<String>,
    /// Property type; `None` only for the synthesized `validity_duration`.
    pub data_type: Option<DataType>,
}

impl SummaryIdentifier {
    pub fn resolve(canonical: &str, schemas: &SchemaRegistry) -> Result<Self> {
        if canonical == "tag" {
            return Ok(Self {
                canonical: canonical.to_string(),
                namespace: Some("tag".to_string()),
                field: "tag".to_string(),
                subscript: None,
                data_type: Some(DataType::Text),
            });
        }
        if canonical == "count" {
            return Ok(Self {
                canonical: canonical.to_string(),
                namespace: None,
                field: "count".to_string(),
                subscript: None,
                data_type: Some(DataType::Long),
            });
        }

        let segments: Vec<&str> = canonical.split('.').collect();
        let (namespace, field, subscript) = match segments.as_slice() {
            [field] => ("core".to_string(), field.to_string(), None),
            [first, second] => {
                if schemas.contains(first) {
                    (first.to_string(), second.to_string(), None)
                } else {
                    (
                        "core".to_string(),
                        first.to_string(),
                        Some(second.to_string()),
                    )
                }
            }
            [namespace, field, subscript] => (
                namespace.to_string(),
                field.to_string(),
                Some(subscript.to_string()),
            ),
            _ => {
                return Err(Error::Expression(format!(
                    "cannot resolve identifier: \"{canonical}\""
                )));
            }
        };

        let schema = schemas.get(&namespace)?;

        let data_type = if namespace == "core" && field == "validity_duration" {
            None
        } else {
            let def = schema.field(&field).ok_or_else(|| {
                Error::Expression(format!(
                    "no property \"{field}\" defined within namespace \"{namespace}\""
                ))
            })?;
            Some(def.data_type)
        };

        Ok(Self {
            canonical: canonical.to_string(),
            namespace: Some(namespace),
            field,
            subscript,
            data_type,
        })
    }

    /// `namespace.field` without the subscript.
    pub fn property_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}.{}", self.field),
            None => self.field.clone(),
        }
    }

    /// The fully-resolved label: `namespace.field[.subscript]`, or the
    /// pseudo-property name itself.
    pub fn resolved(&self) -> String {
        if self.field == "count" || self.canonical == "tag" {
            return self.canonical.clone();
        }
        match &self.subscript {
            Some(subscript) => format!("{}.{subscript}", self.property_name()),
            None => self.property_name(),
        }
    }

    pub fn is_count(&self) -> bool {
        self.namespace.is_none() && self.field == "count"
    }

    pub fn is_tag(&self) -> bool {
        self.canonical == "tag"
    }

    pub fn is_validity_duration(&self) -> bool {
        self.namespace.as_deref() == Some("core") && self.field == "validity_duration"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemas() -> SchemaRegistry {
        use crate::schema::{FieldDef, NamespaceDef};
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

    #[test]
    fn pseudo_properties() {
        let count = SummaryIdentifier::resolve("count", &schemas()).unwrap();
        assert!(count.is_count());
        assert_eq!(count.data_type, Some(DataType::Long));

        let tag = SummaryIdentifier::resolve("tag", &schemas()).unwrap();
        assert!(tag.is_tag());
        assert_eq!(tag.data_type, Some(DataType::Text));
    }

    #[test]
    fn subscript_resolution() {
        // two segments where the first is a namespace
        let plain = SummaryIdentifier::resolve("mission.orbit", &schemas()).unwrap();
        assert_eq!(plain.namespace.as_deref(), Some("mission"));
        assert_eq!(plain.subscript, None);

        // two segments where the first is a core field
        let aggregated = SummaryIdentifier::resolve("size.max", &schemas()).unwrap();
        assert_eq!(aggregated.namespace.as_deref(), Some("core"));
        assert_eq!(aggregated.field, "size");
        assert_eq!(aggregated.subscript.as_deref(), Some("max"));

        // three segments
        let binned =
            SummaryIdentifier::resolve("core.validity_start.yearmonth", &schemas()).unwrap();
        assert_eq!(binned.subscript.as_deref(), Some("yearmonth"));
        assert_eq!(binned.resolved(), "core.validity_start.yearmonth");
    }

    #[test]
    fn validity_duration_is_typeless() {
        let duration =
            SummaryIdentifier::resolve("core.validity_duration.sum", &schemas()).unwrap();
        assert!(duration.is_validity_duration());
        assert_eq!(duration.data_type, None);
    }

    #[test]
    fn unknown_property_rejected() {
        assert!(SummaryIdentifier::resolve("mission.nosuch", &schemas()).is_err());
        assert!(SummaryIdentifier::resolve("a.b.c.d", &schemas()).is_err());
    }
}
