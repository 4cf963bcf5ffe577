//! User identity, evaluation contexts, and device/application metadata.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::PropertyMap;

/// `{type ∈ {user, device, app, session, organization, custom}, key, name?, properties, private_attributes}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    User,
    Device,
    App,
    Session,
    Organization,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(rename = "type")]
    pub context_type: ContextType,
    pub key: String,
    pub name: Option<String>,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub private_attributes: HashSet<String>,
}

impl EvaluationContext {
    pub fn new(context_type: ContextType, key: impl Into<String>) -> Self {
        Self {
            context_type,
            key: key.into(),
            name: None,
            properties: PropertyMap::new(),
            private_attributes: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceContext {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub device_model: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub app_id: Option<String>,
    pub app_version: Option<String>,
    pub build_number: Option<String>,
}

/// Identity and attributes for one user. Immutable; every mutating method
/// returns a new instance rather than mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CFUser {
    pub customer_id: Option<String>,
    pub anonymous: bool,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub contexts: Vec<EvaluationContext>,
    pub device_context: Option<DeviceContext>,
    pub application_info: Option<ApplicationInfo>,
    #[serde(default)]
    pub private_attribute_names: HashSet<String>,
    #[serde(default)]
    pub session_attribute_names: HashSet<String>,
}

impl CFUser {
    pub fn anonymous() -> Self {
        Self {
            customer_id: None,
            anonymous: true,
            properties: PropertyMap::new(),
            contexts: Vec::new(),
            device_context: None,
            application_info: None,
            private_attribute_names: HashSet::new(),
            session_attribute_names: HashSet::new(),
        }
    }

    pub fn identified(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            anonymous: false,
            ..Self::anonymous()
        }
    }

    /// Returns a new `CFUser` with `key` set to `value` in `properties`.
    pub fn with_property(&self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut next = self.clone();
        next.properties.insert(key.into(), value);
        next
    }

    /// Returns a new `CFUser` with `context` appended.
    pub fn with_context(&self, context: EvaluationContext) -> Self {
        let mut next = self.clone();
        next.contexts.push(context);
        next
    }

    /// Serializes to the `user_map` shape expected by the user-configs and
    /// flush endpoints.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_property_does_not_mutate_original() {
        let user = CFUser::anonymous();
        let updated = user.with_property("plan", serde_json::json!("pro"));

        assert!(user.properties.is_empty());
        assert_eq!(updated.properties.get("plan"), Some(&serde_json::json!("pro")));
    }

    #[test]
    fn identified_user_is_not_anonymous() {
        let user = CFUser::identified("cust_1");
        assert!(!user.anonymous);
        assert_eq!(user.customer_id.as_deref(), Some("cust_1"));
    }
}
