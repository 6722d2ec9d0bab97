//! Operation timeouts
//!
//! Every resource kind declares default create/update/delete timeouts. A resource
//! may override them through a `timeouts` map attribute:
//!
//! ```text
//! timeouts = { create = "10m", delete = "1h30m" }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::provider::{ProviderError, ProviderResult};
use crate::resource::Value;

/// Attribute holding per-resource overrides
pub const TIMEOUTS_ATTRIBUTE: &str = "timeouts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(10 * 60))
    }
}

impl Timeouts {
    pub const fn new(create: Duration, update: Duration, delete: Duration) -> Self {
        Self {
            create,
            update,
            delete,
        }
    }

    pub const fn uniform(timeout: Duration) -> Self {
        Self::new(timeout, timeout, timeout)
    }

    /// Apply overrides from a resource's `timeouts` attribute, if present
    pub fn with_overrides(mut self, attributes: &HashMap<String, Value>) -> ProviderResult<Self> {
        let Some(value) = attributes.get(TIMEOUTS_ATTRIBUTE) else {
            return Ok(self);
        };
        let Some(overrides) = value.as_map() else {
            return Err(ProviderError::validation(format!(
                "'{}' must be a map, got {}",
                TIMEOUTS_ATTRIBUTE,
                value.type_name()
            )));
        };

        for (key, raw) in overrides {
            let text = raw.as_str().ok_or_else(|| {
                ProviderError::validation(format!("timeout '{}' must be a string", key))
            })?;
            let duration = parse_duration(text).map_err(ProviderError::validation)?;
            match key.as_str() {
                "create" => self.create = duration,
                "update" => self.update = duration,
                "delete" => self.delete = duration,
                other => {
                    return Err(ProviderError::validation(format!(
                        "unknown timeout '{}', expected create, update or delete",
                        other
                    )));
                }
            }
        }

        Ok(self)
    }
}

/// Parse durations such as "30s", "10m", "1h30m"
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let re = Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").map_err(|e| e.to_string())?;
    let invalid = || format!("invalid duration '{}', expected e.g. \"30s\", \"10m\" or \"1h\"", text);

    let captures = re.captures(text.trim()).ok_or_else(invalid)?;
    if captures.iter().skip(1).all(|group| group.is_none()) {
        return Err(invalid());
    }

    let mut seconds: u64 = 0;
    for (index, unit) in [(1, 3600), (2, 60), (3, 1)] {
        if let Some(group) = captures.get(index) {
            let amount: u64 = group.as_str().parse().map_err(|_| invalid())?;
            seconds = amount
                .checked_mul(unit)
                .and_then(|s| seconds.checked_add(s))
                .ok_or_else(invalid)?;
        }
    }

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ErrorClass;

    #[test]
    fn parse_simple_units() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5m1h").is_err());
    }

    #[test]
    fn overrides_replace_only_named_operations() {
        let defaults = Timeouts::new(
            Duration::from_secs(600),
            Duration::from_secs(600),
            Duration::from_secs(1200),
        );
        let mut overrides = HashMap::new();
        overrides.insert("create".to_string(), Value::String("20m".to_string()));
        let mut attributes = HashMap::new();
        attributes.insert(TIMEOUTS_ATTRIBUTE.to_string(), Value::Map(overrides));

        let timeouts = defaults.with_overrides(&attributes).unwrap();

        assert_eq!(timeouts.create, Duration::from_secs(1200));
        assert_eq!(timeouts.update, Duration::from_secs(600));
        assert_eq!(timeouts.delete, Duration::from_secs(1200));
    }

    #[test]
    fn unknown_override_is_a_validation_error() {
        let mut overrides = HashMap::new();
        overrides.insert("read".to_string(), Value::String("1m".to_string()));
        let mut attributes = HashMap::new();
        attributes.insert(TIMEOUTS_ATTRIBUTE.to_string(), Value::Map(overrides));

        let err = Timeouts::default().with_overrides(&attributes).unwrap_err();
        assert_eq!(err.class, ErrorClass::Validation);
    }

    #[test]
    fn missing_attribute_keeps_defaults() {
        let timeouts = Timeouts::default().with_overrides(&HashMap::new()).unwrap();
        assert_eq!(timeouts, Timeouts::default());
    }
}
