//! Namespace schema model.
//!
//! A namespace is a named, ordered set of typed fields attached to a product.
//! The `core` namespace is fixed at design time; extension namespaces are
//! registered at archive-open time. Every non-core namespace implicitly
//! carries a `uuid` primary key referencing the core table, which extensions
//! must not redeclare.

use crate::error::{Error, Result};
use crate::value::DataType;
use std::collections::BTreeMap;

/// A single field in a namespace definition.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub optional: bool,
    pub indexed: bool,
}

impl FieldDef {
    pub fn required(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            optional: false,
            indexed: false,
        }
    }

    pub fn optional(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            optional: true,
            indexed: false,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// An ordered namespace definition.
#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceDef {
    name: String,
    fields: Vec<FieldDef>,
}

/// Lowercase identifier starting with a letter.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl NamespaceDef {
    /// Create a namespace definition, validating names and uniqueness.
    pub fn new(name: &str, fields: Vec<FieldDef>) -> Result<Self> {
        if !is_valid_identifier(name) {
            return Err(Error::Schema(format!("invalid namespace name \"{name}\"")));
        }
        let mut seen = BTreeMap::new();
        for field in &fields {
            if !is_valid_identifier(&field.name) {
                return Err(Error::Schema(format!(
                    "invalid field name \"{}\" in namespace \"{name}\"",
                    field.name
                )));
            }
            if name != "core" && field.name == "uuid" {
                return Err(Error::Schema(format!(
                    "namespace \"{name}\" must not redeclare the implicit \"uuid\" field"
                )));
            }
            if seen.insert(field.name.clone(), ()).is_some() {
                return Err(Error::Schema(format!(
                    "duplicate field \"{}\" in namespace \"{name}\"",
                    field.name
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in definition order, excluding the implicit `uuid` key.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// The fixed design-time core namespace.
pub fn core_namespace() -> NamespaceDef {
    NamespaceDef::new(
        "core",
        vec![
            FieldDef::required("uuid", DataType::Uuid),
            FieldDef::required("active", DataType::Boolean).indexed(),
            FieldDef::optional("hash", DataType::Text).indexed(),
            FieldDef::optional("size", DataType::Long).indexed(),
            FieldDef::required("metadata_date", DataType::Timestamp).indexed(),
            FieldDef::optional("archive_date", DataType::Timestamp).indexed(),
            FieldDef::optional("archive_path", DataType::Text),
            FieldDef::required("product_type", DataType::Text).indexed(),
            FieldDef::required("product_name", DataType::Text).indexed(),
            FieldDef::required("physical_name", DataType::Text).indexed(),
            FieldDef::optional("validity_start", DataType::Timestamp).indexed(),
            FieldDef::optional("validity_stop", DataType::Timestamp).indexed(),
            FieldDef::optional("creation_date", DataType::Timestamp).indexed(),
            FieldDef::optional("footprint", DataType::Geometry),
            FieldDef::optional("remote_url", DataType::Text),
        ],
    )
    .expect("core namespace definition is valid")
}

/// Registry of namespace schemas known to an archive.
///
/// Registration order is preserved; the core namespace is always present.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    namespaces: Vec<NamespaceDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            namespaces: vec![core_namespace()],
        }
    }

    /// Register an extension namespace. Redefinition is an error.
    pub fn register(&mut self, namespace: NamespaceDef) -> Result<()> {
        if self.lookup(namespace.name()).is_some() {
            return Err(Error::Schema(format!(
                "redefinition of namespace: \"{}\"",
                namespace.name()
            )));
        }
        self.namespaces.push(namespace);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&NamespaceDef> {
        self.namespaces.iter().find(|ns| ns.name() == name)
    }

    pub fn get(&self, name: &str) -> Result<&NamespaceDef> {
        self.lookup(name).ok_or_else(|| {
            Error::Schema(format!(
                "undefined namespace: \"{name}\"; defined namespaces: {}",
                self.names().join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Namespaces in registration order, core first.
    pub fn iter(&self) -> impl Iterator<Item = &NamespaceDef> {
        self.namespaces.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.namespaces.iter().map(|ns| ns.name().to_string()).collect()
    }

    /// Resolve a possibly-implicit `namespace.field` reference.
    ///
    /// A single-segment name is a core field unless it names a registered
    /// namespace, in which case it is a bare namespace reference
    /// (`field` is `None`).
    pub fn resolve(&self, name: &str) -> Result<(String, Option<String>)> {
        let segments: Vec<&str> = name.split('.').collect();
        match segments.as_slice() {
            [single] => {
                if self.contains(single) {
                    Ok((single.to_string(), None))
                } else {
                    Ok(("core".to_string(), Some(single.to_string())))
                }
            }
            [namespace, field] => Ok((namespace.to_string(), Some(field.to_string()))),
            _ => Err(Error::Expression(format!(
                "invalid property name: \"{name}\""
            ))),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_namespace_shape() {
        let core = core_namespace();
        assert_eq!(core.fields().len(), 15);
        assert!(core.field("uuid").is_some());
        assert!(core.field("footprint").unwrap().optional);
        assert!(core.field("product_type").unwrap().indexed);
        assert!(!core.field("archive_path").unwrap().indexed);
    }

    #[test]
    fn namespace_name_validation() {
        assert!(NamespaceDef::new("Mission", vec![]).is_err());
        assert!(NamespaceDef::new("1mission", vec![]).is_err());
        assert!(NamespaceDef::new("mission_2", vec![]).is_ok());
    }

    #[test]
    fn uuid_redeclaration_rejected() {
        let result = NamespaceDef::new(
            "mission",
            vec![FieldDef::required("uuid", DataType::Uuid)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn registry_rejects_redefinition() {
        let mut registry = SchemaRegistry::new();
        let ns = NamespaceDef::new(
            "mission",
            vec![FieldDef::optional("orbit", DataType::Long)],
        )
        .unwrap();
        registry.register(ns.clone()).unwrap();
        assert!(registry.register(ns).is_err());
        assert!(registry
            .register(core_namespace())
            .is_err());
    }

    #[test]
    fn resolve_implicit_core() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                NamespaceDef::new("mission", vec![FieldDef::optional("orbit", DataType::Long)])
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(
            registry.resolve("product_name").unwrap(),
            ("core".to_string(), Some("product_name".to_string()))
        );
        assert_eq!(
            registry.resolve("mission").unwrap(),
            ("mission".to_string(), None)
        );
        assert_eq!(
            registry.resolve("mission.orbit").unwrap(),
            ("mission".to_string(), Some("orbit".to_string()))
        );
        assert!(registry.resolve("a.b.c").is_err());
    }
}
