use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header property names with special meaning to consumers and producers
pub mod names {
    pub const CUSTOMER_IDENTIFIER: &str = "CustomerIdentifier";
    pub const MESSAGE_ID: &str = "MESSAGE_ID";
    pub const SERVICE_TYPE: &str = "SERVICE_TYPE";
    pub const RETRY_COUNT: &str = "RETRY_COUNT";
    pub const EVENT_CHANNEL_NAME: &str = "EVENT_CHANNEL_NAME";
    pub const INTERFACE_VERSION: &str = "InterfaceVersion";
    pub const SUPPLIER: &str = "Supplier";
    pub const TRANSACTION: &str = "Transaction";
}

/// Typed, ordered set of message header properties
///
/// Keys and values are strings; iteration is in key order so rendered
/// headers and stored records are deterministic.
///
/// # Example
///
/// ```
/// use provbus::types::MessageProperties;
///
/// let props = MessageProperties::new()
///     .with("CustomerIdentifier", "100")
///     .with("Supplier", "NEUSTAR");
///
/// assert_eq!(props.get("Supplier"), Some("NEUSTAR"));
/// assert_eq!(props.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageProperties(BTreeMap<String, String>);

impl MessageProperties {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a property (builder pattern)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a property, returning the previous value if one was set
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Get a property, treating an empty value as absent
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Convert to a JSON object for JSONB storage
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// Build from a JSON object; non-string scalar values are stringified
    pub fn from_json(value: &serde_json::Value) -> crate::error::Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            crate::error::Error::Validation("message properties must be a JSON object".to_string())
        })?;

        let mut props = Self::new();
        for (name, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            props.insert(name.clone(), text);
        }
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_properties_are_key_ordered() {
        let props = MessageProperties::new().with("b", "2").with("a", "1");
        let keys: Vec<&str> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_get_non_empty() {
        let props = MessageProperties::new().with("empty", "").with("full", "x");
        assert_eq!(props.get("empty"), Some(""));
        assert_eq!(props.get_non_empty("empty"), None);
        assert_eq!(props.get_non_empty("full"), Some("x"));
    }

    #[test]
    fn test_json_conversion() {
        let props = MessageProperties::new().with("CustomerIdentifier", "100");
        assert_eq!(props.to_json(), json!({ "CustomerIdentifier": "100" }));

        let parsed =
            MessageProperties::from_json(&json!({ "RETRY_COUNT": 3, "gone": null, "s": "v" }))
                .unwrap();
        assert_eq!(parsed.get("RETRY_COUNT"), Some("3"));
        assert_eq!(parsed.get("s"), Some("v"));
        assert!(!parsed.contains("gone"));
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(MessageProperties::from_json(&json!(["a"])).is_err());
    }
}
