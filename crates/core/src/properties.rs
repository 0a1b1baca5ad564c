//! Nested namespaced property container.
//!
//! A product is carried in memory as a mapping from namespace name to a
//! per-namespace mapping from field name to typed value. Setting a whole
//! namespace to the null sentinel (`None`) marks it for removal on update.

use crate::error::{Error, Result};
use crate::schema::SchemaRegistry;
use crate::value::Value;
use std::collections::BTreeMap;
use time::PrimitiveDateTime;
use uuid::Uuid;

/// Field name to value mapping for one namespace.
pub type PropertyMap = BTreeMap<String, Value>;

/// Namespaced property bag for a single product.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    namespaces: BTreeMap<String, Option<PropertyMap>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a namespace is present (and not marked for removal).
    pub fn is_defined(&self, namespace: &str) -> bool {
        matches!(self.namespaces.get(namespace), Some(Some(_)))
    }

    pub fn namespace(&self, namespace: &str) -> Option<&PropertyMap> {
        self.namespaces.get(namespace).and_then(|ns| ns.as_ref())
    }

    pub fn namespace_mut(&mut self, namespace: &str) -> &mut PropertyMap {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Some(PropertyMap::new()))
            .get_or_insert_with(PropertyMap::new)
    }

    pub fn set_namespace(&mut self, namespace: &str, map: PropertyMap) {
        self.namespaces.insert(namespace.to_string(), Some(map));
    }

    /// Mark a namespace for removal (the null sentinel).
    pub fn remove_namespace(&mut self, namespace: &str) {
        self.namespaces.insert(namespace.to_string(), None);
    }

    /// Iterate namespaces, including ones marked for removal.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&PropertyMap>)> {
        self.namespaces
            .iter()
            .map(|(name, map)| (name.as_str(), map.as_ref()))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Get a field by `namespace.field` path (`core` implied for a bare name).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (namespace, field) = split_path(path);
        self.namespace(namespace)?.get(field)
    }

    /// Set a field by `namespace.field` path (`core` implied for a bare name).
    pub fn set(&mut self, path: &str, value: Value) {
        let (namespace, field) = split_path(path);
        self.namespace_mut(namespace).insert(field.to_string(), value);
    }

    /// Remove a field; returns the previous value if any.
    pub fn unset(&mut self, path: &str) -> Option<Value> {
        let (namespace, field) = split_path(path);
        match self.namespaces.get_mut(namespace) {
            Some(Some(map)) => map.remove(field),
            _ => None,
        }
    }

    /// Deep merge: namespaces and fields of `other` override `self`; a
    /// removal sentinel in `other` carries over.
    pub fn merge(&mut self, other: &Properties) {
        for (name, map) in &other.namespaces {
            match map {
                None => {
                    self.namespaces.insert(name.clone(), None);
                }
                Some(fields) => {
                    let target = self.namespace_mut(name);
                    for (field, value) in fields {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Namespaces and fields of `self` that differ from (or are absent in)
    /// `base`.
    pub fn diff(&self, base: &Properties) -> Properties {
        let mut result = Properties::new();
        for (name, map) in &self.namespaces {
            match map {
                None => {
                    if base.namespaces.get(name).is_some_and(|m| m.is_some()) {
                        result.remove_namespace(name);
                    }
                }
                Some(fields) => {
                    let base_fields = base.namespace(name);
                    for (field, value) in fields {
                        if base_fields.and_then(|m| m.get(field)) != Some(value) {
                            result
                                .namespace_mut(name)
                                .insert(field.clone(), value.clone());
                        }
                    }
                }
            }
        }
        result
    }

    /// Keep only the listed namespaces (plus removal sentinels for them).
    pub fn project_namespaces(&self, namespaces: &[&str]) -> Properties {
        let mut result = Properties::new();
        for (name, map) in &self.namespaces {
            if namespaces.contains(&name.as_str()) {
                result.namespaces.insert(name.clone(), map.clone());
            }
        }
        result
    }

    /// Keep only the listed dotted fields (`core` implied for bare names).
    pub fn project_fields(&self, fields: &[&str]) -> Properties {
        let mut result = Properties::new();
        for path in fields {
            let (namespace, field) = split_path(path);
            if let Some(value) = self.namespace(namespace).and_then(|m| m.get(field)) {
                result
                    .namespace_mut(namespace)
                    .insert(field.to_string(), value.clone());
            }
        }
        result
    }

    /// Validate against the schema registry.
    ///
    /// With `partial` set, missing mandatory fields are tolerated (used for
    /// update payloads); unknown namespaces, unknown fields and type
    /// mismatches are always errors.
    pub fn validate(&self, schemas: &SchemaRegistry, partial: bool) -> Result<()> {
        for (name, map) in &self.namespaces {
            let schema = schemas.get(name)?;
            let Some(map) = map else {
                continue;
            };
            for (field, value) in map {
                // the implicit key may ride along in namespace records
                if name != "core" && field == "uuid" {
                    if value.as_uuid().is_none() {
                        return Err(Error::Schema(format!(
                            "{name}.uuid: invalid value of type {}",
                            value.data_type()
                        )));
                    }
                    continue;
                }
                let def = schema.field(field).ok_or_else(|| {
                    Error::Schema(format!("undefined property: \"{name}.{field}\""))
                })?;
                if !def.data_type.accepts(value.data_type()) {
                    return Err(Error::Schema(format!(
                        "{name}.{field}: expected {} value, got {}",
                        def.data_type,
                        value.data_type()
                    )));
                }
            }
            if !partial {
                for def in schema.fields() {
                    if !def.optional && !map.contains_key(&def.name) {
                        return Err(Error::Schema(format!(
                            "{name}.{}: no value for mandatory property",
                            def.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // Typed accessors for frequently used core fields.

    pub fn core_uuid(&self) -> Result<Uuid> {
        self.get("uuid")
            .and_then(|value| value.as_uuid())
            .ok_or_else(|| Error::Schema("core.uuid is not set".to_string()))
    }

    pub fn core_text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|value| value.as_text())
    }

    pub fn core_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(|value| value.as_boolean())
    }

    pub fn core_long(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(|value| value.as_long())
    }

    pub fn core_timestamp(&self, field: &str) -> Option<PrimitiveDateTime> {
        self.get(field).and_then(|value| value.as_timestamp())
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((namespace, field)) => (namespace, field),
        None => ("core", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, NamespaceDef};
    use crate::value::DataType;

    fn registry_with_mission() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                NamespaceDef::new(
                    "mission",
                    vec![
                        FieldDef::required("name", DataType::Text),
                        FieldDef::optional("orbit", DataType::Long),
                    ],
                )
                .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn dotted_path_defaults_to_core() {
        let mut props = Properties::new();
        props.set("product_name", Value::Text("alpha.dat".into()));
        props.set("mission.orbit", Value::Long(7));

        assert_eq!(
            props.get("core.product_name").and_then(|v| v.as_text()),
            Some("alpha.dat")
        );
        assert_eq!(props.get("mission.orbit").and_then(|v| v.as_long()), Some(7));
        assert_eq!(props.core_long("size"), None);
    }

    #[test]
    fn merge_applies_removal_sentinel() {
        let mut props = Properties::new();
        props.set("mission.orbit", Value::Long(7));

        let mut update = Properties::new();
        update.remove_namespace("mission");
        props.merge(&update);

        assert!(!props.is_defined("mission"));
        assert!(props.namespaces.contains_key("mission"));
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let mut base = Properties::new();
        base.set("product_name", Value::Text("alpha".into()));
        base.set("size", Value::Long(5));

        let mut updated = base.clone();
        updated.set("size", Value::Long(6));
        updated.set("mission.orbit", Value::Long(7));

        let diff = updated.diff(&base);
        assert!(diff.get("product_name").is_none());
        assert_eq!(diff.get("size"), Some(&Value::Long(6)));
        assert_eq!(diff.get("mission.orbit"), Some(&Value::Long(7)));
    }

    #[test]
    fn validate_checks_types_and_mandatory_fields() {
        let registry = registry_with_mission();

        let mut props = Properties::new();
        props.set("mission.orbit", Value::Long(7));
        // partial: missing mandatory mission.name tolerated
        props.validate(&registry, true).unwrap();
        assert!(props.validate(&registry, false).is_err());

        props.set("mission.name", Value::Text("sentinel".into()));
        props.validate(&registry, false).unwrap();

        props.set("mission.orbit", Value::Text("seven".into()));
        assert!(props.validate(&registry, true).is_err());

        props.set("mission.orbit", Value::Integer(7)); // widens to long
        assert!(props.validate(&registry, true).is_ok());
    }

    #[test]
    fn unknown_namespace_rejected() {
        let registry = SchemaRegistry::new();
        let mut props = Properties::new();
        props.set("unknown.field", Value::Long(1));
        assert!(props.validate(&registry, true).is_err());
    }

    #[test]
    fn projection() {
        let mut props = Properties::new();
        props.set("product_name", Value::Text("alpha".into()));
        props.set("size", Value::Long(5));
        props.set("mission.orbit", Value::Long(7));

        let core_only = props.project_namespaces(&["core"]);
        assert!(core_only.is_defined("core"));
        assert!(!core_only.is_defined("mission"));

        let fields = props.project_fields(&["size", "mission.orbit"]);
        assert!(fields.get("product_name").is_none());
        assert_eq!(fields.get("size"), Some(&Value::Long(5)));
        assert_eq!(fields.get("mission.orbit"), Some(&Value::Long(7)));
    }
}
