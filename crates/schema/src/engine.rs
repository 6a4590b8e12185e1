//! Spec processing against a kind schema: coercion, validation, secret extraction.

use std::collections::BTreeMap;

use base64::Engine as _;
use lmesh_core::{Map, Object, Value, KIND_SECRET, LABEL_OWNER, SECRET_API_VERSION};
use tracing::debug;

use crate::{Property, PropertyType, Schema};

/// Validation failures, reported with the offending property path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown property {path:?}; valid properties are: {}", .valid.join(", "))]
    UnknownProperty { path: String, valid: Vec<String> },
    #[error("property {path:?} is an object and must be given as a nested structure, not a string")]
    ObjectFromString { path: String },
    #[error("property {path:?} must be of type {expected}, got {found}")]
    TypeMismatch { path: String, expected: &'static str, found: &'static str },
    #[error("missing required property {path:?}")]
    MissingRequired { path: String },
    #[error("property {path:?} value {value:?} is not one of: {}", .allowed.join(", "))]
    NotInEnum { path: String, value: String, allowed: Vec<String> },
    #[error("secret property {path:?} must be a string or a secret reference, got {found}")]
    InvalidSecretValue { path: String, found: &'static str },
    #[error("secret key {key:?} is produced by more than one property")]
    SecretKeyConflict { key: String },
}

fn join(base: &str, key: &str) -> String {
    if base.is_empty() { key.to_string() } else { format!("{}.{}", base, key) }
}

/// Coerce raw user input against `schema`, then validate the result.
pub fn process(schema: &Schema, raw: Map) -> Result<Map, SchemaError> {
    let out = coerce_map(&schema.root, raw, "")?;
    validate(schema, &out)?;
    debug!(kind = %schema.kind, keys = out.len(), "spec processed");
    Ok(out)
}

fn coerce_map(node: &Property, raw: Map, base: &str) -> Result<Map, SchemaError> {
    if node.is_free_form() { return Ok(raw); }
    let mut out = Map::new();
    for (k, v) in raw {
        let path = join(base, &k);
        let prop = node
            .properties
            .get(&k)
            .ok_or_else(|| SchemaError::UnknownProperty { path: path.clone(), valid: node.property_names() })?;
        let v = coerce_value(prop, v, &path)?;
        out.insert(k, v);
    }
    Ok(out)
}

fn coerce_value(prop: &Property, v: Value, path: &str) -> Result<Value, SchemaError> {
    if prop.is_free_form() { return Ok(v); }
    match (prop.ty, v) {
        // Plaintext secret pending extraction
        (_, Value::String(s)) if prop.secret => Ok(Value::String(s)),
        (PropertyType::Array, Value::String(s)) => {
            let parts: Vec<Value> = s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(Value::from).collect();
            coerce_items(prop, parts, path)
        }
        (PropertyType::Array, Value::List(l)) => coerce_items(prop, l, path),
        (PropertyType::Object, Value::String(_)) => Err(SchemaError::ObjectFromString { path: path.to_string() }),
        (PropertyType::Object, Value::Map(m)) => Ok(Value::Map(coerce_map(prop, m, path)?)),
        (PropertyType::Integer, Value::String(s)) => Ok(s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::String(s))),
        (PropertyType::Number, Value::String(s)) => Ok(s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::String(s))),
        (PropertyType::Boolean, Value::String(s)) => Ok(s.trim().parse::<bool>().map(Value::Bool).unwrap_or(Value::String(s))),
        (_, v) => Ok(v),
    }
}

fn coerce_items(prop: &Property, items: Vec<Value>, path: &str) -> Result<Value, SchemaError> {
    let Some(item_schema) = prop.items.as_deref() else { return Ok(Value::List(items)); };
    items
        .into_iter()
        .enumerate()
        .map(|(i, v)| coerce_value(item_schema, v, &format!("{}[{}]", path, i)))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

/// Check a spec against `schema`: known keys, required keys, types and enums.
pub fn validate(schema: &Schema, spec: &Map) -> Result<(), SchemaError> {
    check_map(&schema.root, spec, "")
}

fn check_map(node: &Property, m: &Map, base: &str) -> Result<(), SchemaError> {
    if node.is_free_form() { return Ok(()); }
    for req in node.required.iter() {
        if m.get(req).map(Value::is_null).unwrap_or(true) {
            return Err(SchemaError::MissingRequired { path: join(base, req) });
        }
    }
    for (k, v) in m.iter() {
        let path = join(base, k);
        let prop = node
            .properties
            .get(k)
            .ok_or_else(|| SchemaError::UnknownProperty { path: path.clone(), valid: node.property_names() })?;
        check_value(prop, v, &path)?;
    }
    Ok(())
}

fn check_value(prop: &Property, v: &Value, path: &str) -> Result<(), SchemaError> {
    if prop.is_free_form() || v.is_null() { return Ok(()); }
    if prop.secret {
        return match v {
            Value::String(_) => Ok(()),
            Value::Map(m) => check_map(prop, m, path),
            other => Err(SchemaError::InvalidSecretValue { path: path.to_string(), found: other.type_name() }),
        };
    }
    let mismatch = || SchemaError::TypeMismatch { path: path.to_string(), expected: prop.ty.as_str(), found: v.type_name() };
    match (prop.ty, v) {
        (PropertyType::String, Value::String(s)) => {
            if !prop.enum_values.is_empty() && !prop.enum_values.iter().any(|a| a == s) {
                return Err(SchemaError::NotInEnum { path: path.to_string(), value: s.clone(), allowed: prop.enum_values.clone() });
            }
            Ok(())
        }
        (PropertyType::Integer, Value::Int(_)) => Ok(()),
        (PropertyType::Number, Value::Int(_) | Value::Float(_)) => Ok(()),
        (PropertyType::Boolean, Value::Bool(_)) => Ok(()),
        (PropertyType::Object, Value::Map(m)) => check_map(prop, m, path),
        (PropertyType::Array, Value::List(l)) => match prop.items.as_deref() {
            Some(items) => l.iter().enumerate().try_for_each(|(i, item)| check_value(items, item, &format!("{}[{}]", path, i))),
            None => Ok(()),
        },
        _ => Err(mismatch()),
    }
}

/// Name of the Secret holding the detached values of `owner`.
pub fn secret_name(owner: &str) -> String {
    format!("{}-secret", owner).to_lowercase()
}

/// In-place reference written where a secret value used to be.
pub fn secret_reference(owner: &str, key: &str) -> Value {
    lmesh_core::map! { "valueFromSecret" => lmesh_core::map! { "name" => secret_name(owner), "key" => key } }
}

/// Move every plaintext secret value out of `spec`.
///
/// Returns the detached payload keyed by property name (base64 encoded) and
/// rewrites each leaf to a `valueFromSecret` reference. Keys unknown to the
/// schema are ignored here; `validate` is responsible for rejecting them.
pub fn extract_secrets(owner: &str, schema: &Schema, spec: &mut Map) -> Result<BTreeMap<String, String>, SchemaError> {
    let mut out = BTreeMap::new();
    extract_map(owner, &schema.root, spec, "", &mut out)?;
    if !out.is_empty() { debug!(owner = %owner, keys = out.len(), "secrets extracted"); }
    Ok(out)
}

fn extract_map(owner: &str, node: &Property, m: &mut Map, base: &str, out: &mut BTreeMap<String, String>) -> Result<(), SchemaError> {
    for (k, v) in m.iter_mut() {
        let Some(prop) = node.properties.get(k) else { continue };
        let path = join(base, k);
        if prop.secret {
            if let Some(plain) = plaintext(v, &path)? {
                if out.contains_key(k) { return Err(SchemaError::SecretKeyConflict { key: k.clone() }); }
                out.insert(k.clone(), base64::engine::general_purpose::STANDARD.encode(plain.as_bytes()));
                *v = secret_reference(owner, k);
            }
            continue;
        }
        match v {
            Value::Map(inner) => extract_map(owner, prop, inner, &path, out)?,
            Value::List(list) => {
                if let Some(items) = prop.items.as_deref() {
                    for (i, item) in list.iter_mut().enumerate() {
                        if let Value::Map(inner) = item { extract_map(owner, items, inner, &format!("{}[{}]", path, i), out)?; }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Plaintext held at a secret leaf; `None` when it already is a reference.
fn plaintext(v: &Value, path: &str) -> Result<Option<String>, SchemaError> {
    let invalid = |found: &'static str| SchemaError::InvalidSecretValue { path: path.to_string(), found };
    match v {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Map(m) if m.contains_key("valueFromSecret") => Ok(None),
        Value::Map(m) => match m.get("value") {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(invalid(other.type_name())),
            None => Err(invalid("object")),
        },
        other => Err(invalid(other.type_name())),
    }
}

/// Detached Secret object for `owner` holding already-encoded `data`.
pub fn secret_object(owner: &str, data: BTreeMap<String, String>) -> Object {
    let mut o = Object::new(SECRET_API_VERSION, KIND_SECRET, secret_name(owner)).with_label(LABEL_OWNER, owner.to_lowercase());
    o.data = data;
    o.type_ = Some("Opaque".to_string());
    o
}
