//! Service and template definitions carried through backup and restore

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A deployed service as seen by the backup orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    /// Parent service; `None` for top-level applications (tenants)
    #[serde(default)]
    pub parent_service_id: Option<String>,
    #[serde(default)]
    pub pool_id: String,
    /// Container image the service runs
    #[serde(default)]
    pub image_id: Option<String>,
    /// Remaining definition fields, kept opaque
    #[serde(default)]
    pub definition: serde_json::Value,
}

impl ServiceDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_service_id: None,
            pool_id: "default".to_string(),
            image_id: None,
            definition: serde_json::Value::Null,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_service_id = Some(parent.into());
        self
    }

    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    /// Top-level services own a tenant volume
    pub fn is_tenant(&self) -> bool {
        self.parent_service_id.is_none()
    }
}

/// A service template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub definition: serde_json::Value,
}

impl ServiceTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            definition: serde_json::Value::Null,
        }
    }
}

/// Tenant IDs among a set of services, sorted
pub fn tenant_ids(services: &[ServiceDefinition]) -> Vec<String> {
    services
        .iter()
        .filter(|s| s.is_tenant())
        .map(|s| s.id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Distinct images referenced by a set of services, sorted
pub fn referenced_images(services: &[ServiceDefinition]) -> Vec<String> {
    services
        .iter()
        .filter_map(|s| s.image_id.clone())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenants_and_images() {
        let services = vec![
            ServiceDefinition::new("app1", "Zenoss").with_image("repo/app:1"),
            ServiceDefinition::new("svc-a", "mysql")
                .with_parent("app1")
                .with_image("repo/mysql:5"),
            ServiceDefinition::new("svc-b", "redis")
                .with_parent("app1")
                .with_image("repo/app:1"),
            ServiceDefinition::new("app2", "Other"),
        ];

        assert_eq!(tenant_ids(&services), vec!["app1", "app2"]);
        assert_eq!(
            referenced_images(&services),
            vec!["repo/app:1", "repo/mysql:5"]
        );
    }

    #[test]
    fn test_definition_defaults_on_deserialize() {
        let svc: ServiceDefinition =
            serde_json::from_str(r#"{"id":"app1","name":"Zenoss"}"#).unwrap();
        assert!(svc.is_tenant());
        assert!(svc.image_id.is_none());
        assert!(svc.definition.is_null());
    }
}
