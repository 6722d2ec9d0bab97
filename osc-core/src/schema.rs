//! Schema - Declare the attributes each resource kind accepts
//!
//! Schemas let the reconcile loop reject incomplete configuration before any API
//! call is made, and tell it which attributes can only be set at creation time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::resource::Value;

/// Attribute type
#[derive(Debug, Clone)]
pub enum AttributeType {
    String,
    Int,
    Bool,
    /// Enum (list of allowed values)
    Enum(Vec<String>),
    /// Custom type (with validation function)
    Custom {
        name: String,
        validate: fn(&Value) -> Result<(), String>,
    },
    List(Box<AttributeType>),
    Map(Box<AttributeType>),
}

impl AttributeType {
    /// Check if a value conforms to this type
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        match (self, value) {
            (AttributeType::String, Value::String(_)) => Ok(()),
            (AttributeType::Int, Value::Int(_)) => Ok(()),
            (AttributeType::Bool, Value::Bool(_)) => Ok(()),

            (AttributeType::Enum(variants), Value::String(s)) => {
                if variants.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(SchemaError::InvalidEnumVariant {
                        value: s.clone(),
                        expected: variants.clone(),
                    })
                }
            }

            (AttributeType::Custom { validate, .. }, v) => {
                validate(v).map_err(|message| SchemaError::ValidationFailed { message })
            }

            (AttributeType::List(inner), Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.validate(item).map_err(|e| SchemaError::ListItemError {
                        index: i,
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Map(inner), Value::Map(map)) => {
                for (k, v) in map {
                    inner.validate(v).map_err(|e| SchemaError::MapValueError {
                        key: k.clone(),
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            _ => Err(SchemaError::TypeMismatch {
                expected: self.type_name(),
                got: value.type_name().to_string(),
            }),
        }
    }

    fn type_name(&self) -> String {
        match self {
            AttributeType::String => "String".to_string(),
            AttributeType::Int => "Int".to_string(),
            AttributeType::Bool => "Bool".to_string(),
            AttributeType::Enum(variants) => format!("Enum({})", variants.join(" | ")),
            AttributeType::Custom { name, .. } => name.clone(),
            AttributeType::List(inner) => format!("List<{}>", inner.type_name()),
            AttributeType::Map(inner) => format!("Map<{}>", inner.type_name()),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Schema violation
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid enum variant '{value}', expected one of: {}", expected.join(", "))]
    InvalidEnumVariant {
        value: String,
        expected: Vec<String>,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Required attribute '{name}' is missing")]
    MissingRequired { name: String },

    #[error("Attribute '{name}' can only be set at creation; changing it requires replacement")]
    ForceNew { name: String },

    #[error("List item at index {index}: {inner}")]
    ListItemError { index: usize, inner: Box<SchemaError> },

    #[error("Map value for key '{key}': {inner}")]
    MapValueError { key: String, inner: Box<SchemaError> },
}

/// Attribute schema
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub attr_type: AttributeType,
    pub required: bool,
    /// Creation-only: changing it forces a new resource
    pub force_new: bool,
    /// List whose item order carries no meaning
    pub unordered: bool,
    /// Dropping it from the configuration clears it in the cloud
    pub removable: bool,
    /// Configured siblings that make the cloud fill this attribute in
    pub implied_by: Vec<String>,
    /// Canonical form used for comparison (e.g. upper-cased protocols)
    pub normalize: Option<fn(&Value) -> Value>,
    pub description: Option<String>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            force_new: false,
            unordered: false,
            removable: false,
            implied_by: Vec::new(),
            normalize: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    pub fn removable(mut self) -> Self {
        self.removable = true;
        self
    }

    /// Not cleared while any of `siblings` is configured (e.g. the private IP of
    /// an association made through an instance)
    pub fn implied_by(mut self, siblings: &[&str]) -> Self {
        self.implied_by = siblings.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_normalizer(mut self, normalize: fn(&Value) -> Value) -> Self {
        self.normalize = Some(normalize);
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Whether two values mean the same thing for this attribute
    pub fn equivalent(&self, a: &Value, b: &Value) -> bool {
        let (a, b) = match self.normalize {
            Some(normalize) => (normalize(a), normalize(b)),
            None => (a.clone(), b.clone()),
        };
        match (&a, &b) {
            (Value::List(left), Value::List(right)) if self.unordered => {
                same_items(left, right)
            }
            _ => a == b,
        }
    }
}

/// Multiset equality; `Value` has no ordering to sort by
fn same_items(left: &[Value], right: &[Value]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut remaining: Vec<&Value> = right.iter().collect();
    left.iter().all(|item| {
        match remaining.iter().position(|candidate| *candidate == item) {
            Some(index) => {
                remaining.swap_remove(index);
                true
            }
            None => false,
        }
    })
}

/// Resource schema
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub kind: String,
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl ResourceSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.insert(schema.name.clone(), schema);
        self
    }

    /// Validate resource attributes
    pub fn validate(&self, attributes: &HashMap<String, Value>) -> Result<(), Vec<SchemaError>> {
        let mut errors = Vec::new();

        for (name, schema) in &self.attributes {
            if schema.required && !attributes.contains_key(name) {
                errors.push(SchemaError::MissingRequired { name: name.clone() });
            }
        }

        // Unknown attributes are allowed (computed attributes round-trip through state)
        for (name, value) in attributes {
            if let Some(schema) = self.attributes.get(name)
                && let Err(e) = schema.attr_type.validate(value)
            {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Compare one attribute; attributes without a schema compare strictly
    pub fn equivalent(&self, name: &str, a: &Value, b: &Value) -> bool {
        match self.attributes.get(name) {
            Some(schema) => schema.equivalent(a, b),
            None => a == b,
        }
    }

    /// Whether `name`, absent from `desired`, must be cleared in the cloud
    pub fn clears(&self, name: &str, desired: &HashMap<String, Value>) -> bool {
        self.attributes.get(name).is_some_and(|schema| {
            schema.removable
                && !desired.contains_key(name)
                && !schema
                    .implied_by
                    .iter()
                    .any(|sibling| desired.contains_key(sibling))
        })
    }

    /// Changed attributes that may only be set at creation
    pub fn creation_only<'a>(&self, changed: &'a [String]) -> Vec<&'a str> {
        changed
            .iter()
            .filter(|name| {
                self.attributes
                    .get(name.as_str())
                    .is_some_and(|schema| schema.force_new)
            })
            .map(String::as_str)
            .collect()
    }
}

/// Helper functions for common types
pub mod types {
    use super::*;

    /// Positive integer type
    pub fn positive_int() -> AttributeType {
        AttributeType::Custom {
            name: "PositiveInt".to_string(),
            validate: |value| match value {
                Value::Int(n) if *n > 0 => Ok(()),
                Value::Int(_) => Err("Value must be positive".to_string()),
                _ => Err("Expected integer".to_string()),
            },
        }
    }

    /// TCP/UDP port (0-65535, -1 meaning all ports)
    pub fn port() -> AttributeType {
        AttributeType::Custom {
            name: "Port".to_string(),
            validate: |value| match value {
                Value::Int(n) if (-1..=65535).contains(n) => Ok(()),
                Value::Int(n) => Err(format!("Port {} out of range", n)),
                _ => Err("Expected integer".to_string()),
            },
        }
    }

    /// CIDR block type (e.g., "10.0.0.0/16")
    pub fn cidr() -> AttributeType {
        AttributeType::Custom {
            name: "Cidr".to_string(),
            validate: |value| {
                if let Value::String(s) = value {
                    validate_cidr(s)
                } else {
                    Err("Expected string".to_string())
                }
            },
        }
    }

    pub fn string_list() -> AttributeType {
        AttributeType::List(Box::new(AttributeType::String))
    }

    pub fn string_map() -> AttributeType {
        AttributeType::Map(Box::new(AttributeType::String))
    }
}

/// Validate CIDR block format (e.g., "10.0.0.0/16")
pub fn validate_cidr(cidr: &str) -> Result<(), String> {
    let Some((ip, prefix)) = cidr.split_once('/') else {
        return Err(format!("Invalid CIDR format '{}': expected IP/prefix", cidr));
    };

    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return Err(format!("Invalid IP address '{}': expected 4 octets", ip));
    }
    if let Some(bad) = octets.iter().find(|o| o.parse::<u8>().is_err()) {
        return Err(format!(
            "Invalid octet '{}' in IP address: must be 0-255",
            bad
        ));
    }

    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        Ok(p) => Err(format!("Invalid prefix length '{}': must be 0-32", p)),
        Err(_) => Err(format!(
            "Invalid prefix length '{}': must be a number",
            prefix
        )),
    }
}
