//! VM templates and cost estimate
//!
//! A template caps what a request may ask for. Requested resources above the
//! template maximum are clamped rather than rejected.

use crate::error::ControllerError;
use kubevirt_client::{GuestCredentials, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Cents per vCPU per hour
pub const CPU_COST_PER_CORE: u32 = 10;
/// Cents per GiB of memory per hour
pub const RAM_COST_PER_GIB: u32 = 5;

/// Hourly cost in cents of a VM with the given resources
pub fn hourly_cost_cents(cpu_cores: u32, memory_gib: u32) -> u32 {
    cpu_cores
        .saturating_mul(CPU_COST_PER_CORE)
        .saturating_add(memory_gib.saturating_mul(RAM_COST_PER_GIB))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: u32,
    pub name: String,
    /// Restrict the template to one namespace
    #[serde(default)]
    pub namespace: Option<String>,
    pub max_cpu: u32,
    /// GiB
    pub max_ram: u32,
    /// GiB
    pub max_space: u32,
    /// Root disk image URL
    pub image: String,
}

/// What a caller asks for, before template limits are applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub name: String,
    pub template_id: Option<u32>,
    pub image: Option<String>,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    pub password: Option<String>,
}

/// Templates by id
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<u32, VmTemplate>,
}

impl TemplateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = VmTemplate>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id, t)).collect(),
        }
    }

    /// Load a JSON array of templates
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfig(format!("cannot read templates {}: {e}", path.display()))
        })?;
        let templates: Vec<VmTemplate> = serde_json::from_str(&raw).map_err(|e| {
            ControllerError::InvalidConfig(format!("cannot parse templates {}: {e}", path.display()))
        })?;
        info!(count = templates.len(), path = %path.display(), "Loaded VM templates");
        Ok(Self::from_templates(templates))
    }

    pub fn get(&self, id: u32) -> Option<&VmTemplate> {
        self.templates.get(&id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Turn a request into a desired spec for `namespace`
    ///
    /// With a template the image comes from the template and every resource
    /// is clamped to its maximum. Without one the request must name an image.
    pub fn resolve(&self, request: &ResourceRequest, namespace: &str) -> Result<ResourceSpec, ControllerError> {
        let (image, cpu_cores, memory_gib, disk_gib) = match request.template_id {
            Some(id) => {
                let template = self
                    .get(id)
                    .ok_or_else(|| ControllerError::NotFound(format!("VM template {id}")))?;
                if let Some(scope) = template.namespace.as_deref().filter(|scope| *scope != namespace) {
                    return Err(ControllerError::InvalidSpec(format!(
                        "template {id} is only available in namespace '{scope}'"
                    )));
                }
                (
                    template.image.clone(),
                    request.cpu_cores.min(template.max_cpu),
                    request.memory_gib.min(template.max_ram),
                    request.disk_gib.min(template.max_space),
                )
            }
            None => {
                let image = request
                    .image
                    .clone()
                    .filter(|image| !image.trim().is_empty())
                    .ok_or_else(|| {
                        ControllerError::InvalidSpec("either template_id or image is required".to_string())
                    })?;
                (image, request.cpu_cores, request.memory_gib, request.disk_gib)
            }
        };

        Ok(ResourceSpec {
            name: request.name.clone(),
            namespace: namespace.to_string(),
            image,
            cpu_cores,
            memory_gib,
            disk_gib,
            credentials: request
                .password
                .clone()
                .map(|password| GuestCredentials { password }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::from_templates([VmTemplate {
            id: 1,
            name: "ubuntu-small".to_string(),
            namespace: None,
            max_cpu: 2,
            max_ram: 4,
            max_space: 20,
            image: "https://images.example.com/ubuntu.img".to_string(),
        }])
    }

    fn request() -> ResourceRequest {
        ResourceRequest {
            name: "web-1".to_string(),
            template_id: Some(1),
            cpu_cores: 8,
            memory_gib: 2,
            disk_gib: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_resources_clamped_to_template() {
        let spec = catalog().resolve(&request(), "vms").unwrap();
        assert_eq!(spec.cpu_cores, 2);
        assert_eq!(spec.memory_gib, 2);
        assert_eq!(spec.disk_gib, 20);
        assert_eq!(spec.image, "https://images.example.com/ubuntu.img");
        assert_eq!(spec.namespace, "vms");
    }

    #[test]
    fn test_unknown_template() {
        let mut req = request();
        req.template_id = Some(9);
        assert!(matches!(catalog().resolve(&req, "vms"), Err(ControllerError::NotFound(_))));
    }

    #[test]
    fn test_no_template_requires_image() {
        let mut req = request();
        req.template_id = None;
        assert!(matches!(
            catalog().resolve(&req, "vms"),
            Err(ControllerError::InvalidSpec(_))
        ));

        req.image = Some("https://images.example.com/debian.img".to_string());
        let spec = catalog().resolve(&req, "vms").unwrap();
        assert_eq!(spec.cpu_cores, 8);
    }

    #[test]
    fn test_password_becomes_credentials() {
        let mut req = request();
        req.password = Some("hunter2".to_string());
        let spec = catalog().resolve(&req, "vms").unwrap();
        assert_eq!(spec.credentials.unwrap().password, "hunter2");
    }

    #[test]
    fn test_hourly_cost() {
        assert_eq!(hourly_cost_cents(2, 4), 40);
        assert_eq!(hourly_cost_cents(0, 0), 0);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("templates-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"id": 3, "name": "debian", "max_cpu": 4, "max_ram": 8, "max_space": 40, "image": "https://images.example.com/debian.img"}]"#,
        )
        .unwrap();
        let catalog = TemplateCatalog::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(3).unwrap().max_ram, 8);
    }
}
