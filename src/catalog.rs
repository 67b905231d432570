//! Static service registry.
//!
//! Descriptors are process-wide, built once at startup and never mutated
//! afterwards — there is no runtime registration of new services.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    Core,
    Addon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVarConfig {
    pub key: String,
    pub label: String,
    pub default_value: String,
    pub required: bool,
    pub read_only: bool,
    pub description: Option<String>,
    pub warning: Option<String>,
}

impl EnvVarConfig {
    fn new(key: &str, label: &str, default_value: &str, required: bool) -> Self {
        Self {
            key: key.to_owned(),
            label: label.to_owned(),
            default_value: default_value.to_owned(),
            required,
            read_only: false,
            description: None,
            warning: None,
        }
    }
}

/// Immutable catalog entry describing one cooperating service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub category: ServiceCategory,
    pub image: String,
    pub port: Option<u16>,
    pub host_service_url_override: Option<String>,
    pub health_url: Option<String>,
    /// Ordered `KEY=VALUE` template; order matters for env-merge invariants.
    pub env_template: Vec<(String, String)>,
    /// Ordered `host:container[:opts]` bind mounts.
    pub volumes: Vec<String>,
    pub env_config: Vec<EnvVarConfig>,
    pub dependencies: HashSet<String>,
}

impl ServiceDescriptor {
    pub fn is_required(&self, required: &[String]) -> bool {
        required.iter().any(|r| r == &self.name)
    }
}

/// The media-scraper service name, referenced by `MountDetector` and the
/// `/services/noona-raven/detect` endpoint.
pub const RAVEN_SERVICE: &str = "noona-raven";

/// The four wizard steps, in display order.
pub const WIZARD_STEPS: [&str; 4] = ["foundation", "portal", "raven", "verification"];

pub struct Catalog {
    services: HashMap<String, ServiceDescriptor>,
    required: Vec<String>,
    wizard_steps: HashMap<&'static str, Vec<String>>,
}

impl Catalog {
    /// Builds the fixed catalog. There is no runtime mutation after this.
    pub fn load() -> Self {
        let mut services = HashMap::new();

        let mut insert = |d: ServiceDescriptor| {
            services.insert(d.name.clone(), d);
        };

        insert(ServiceDescriptor {
            name: "noona-mongo".to_owned(),
            category: ServiceCategory::Core,
            image: "mongo:7".to_owned(),
            port: Some(27017),
            host_service_url_override: None,
            health_url: None,
            env_template: vec![("MONGO_INITDB_DATABASE".to_owned(), "noona".to_owned())],
            volumes: vec!["noona_mongo_data:/data/db".to_owned()],
            env_config: vec![],
            dependencies: HashSet::new(),
        });

        insert(ServiceDescriptor {
            name: "noona-redis".to_owned(),
            category: ServiceCategory::Core,
            image: "redis:7-alpine".to_owned(),
            port: Some(6379),
            host_service_url_override: None,
            health_url: None,
            env_template: vec![],
            volumes: vec!["noona_redis_data:/data".to_owned()],
            env_config: vec![],
            dependencies: HashSet::new(),
        });

        insert(ServiceDescriptor {
            name: "noona-vault".to_owned(),
            category: ServiceCategory::Core,
            image: "noona/vault:latest".to_owned(),
            port: Some(3120),
            host_service_url_override: None,
            health_url: None,
            env_template: vec![
                ("MONGO_URL".to_owned(), "mongodb://noona-mongo:27017".to_owned()),
                ("REDIS_URL".to_owned(), "redis://noona-redis:6379".to_owned()),
            ],
            volumes: vec![],
            env_config: vec![EnvVarConfig::new(
                "VAULT_TOKEN",
                "Vault bearer token",
                "",
                true,
            )],
            dependencies: HashSet::from(["noona-mongo".to_owned(), "noona-redis".to_owned()]),
        });

        insert(ServiceDescriptor {
            name: "noona-bus".to_owned(),
            category: ServiceCategory::Core,
            image: "rabbitmq:3-management-alpine".to_owned(),
            port: Some(5672),
            host_service_url_override: None,
            health_url: None,
            env_template: vec![],
            volumes: vec!["noona_bus_data:/var/lib/rabbitmq".to_owned()],
            env_config: vec![],
            dependencies: HashSet::new(),
        });

        insert(ServiceDescriptor {
            name: "noona-portal".to_owned(),
            category: ServiceCategory::Addon,
            image: "noona/portal:latest".to_owned(),
            port: Some(3000),
            host_service_url_override: None,
            health_url: Some("http://noona-portal:3000/health".to_owned()),
            env_template: vec![("VAULT_URL".to_owned(), "http://noona-vault:3120".to_owned())],
            volumes: vec![],
            env_config: vec![],
            dependencies: HashSet::from(["noona-vault".to_owned()]),
        });

        insert(ServiceDescriptor {
            name: RAVEN_SERVICE.to_owned(),
            category: ServiceCategory::Addon,
            image: "lscr.io/linuxserver/kavita:latest".to_owned(),
            port: Some(5000),
            host_service_url_override: None,
            health_url: Some("http://noona-raven:5000/api/health".to_owned()),
            env_template: vec![],
            volumes: vec![],
            env_config: vec![],
            dependencies: HashSet::from(["noona-vault".to_owned()]),
        });

        insert(ServiceDescriptor {
            name: "noona-oracle".to_owned(),
            category: ServiceCategory::Addon,
            image: "noona/oracle:latest".to_owned(),
            port: Some(3130),
            host_service_url_override: None,
            health_url: Some("http://noona-oracle:3130/health".to_owned()),
            env_template: vec![],
            volumes: vec![],
            env_config: vec![],
            dependencies: HashSet::from(["noona-vault".to_owned()]),
        });

        insert(ServiceDescriptor {
            name: "noona-sentinel".to_owned(),
            category: ServiceCategory::Addon,
            image: "noona/sentinel:latest".to_owned(),
            port: None,
            host_service_url_override: None,
            health_url: None,
            env_template: vec![("VAULT_URL".to_owned(), "http://noona-vault:3120".to_owned())],
            volumes: vec![],
            env_config: vec![EnvVarConfig::new(
                "DISCORD_TOKEN",
                "Discord bot token",
                "",
                true,
            )],
            dependencies: HashSet::from(["noona-vault".to_owned()]),
        });

        let required = vec![
            "noona-mongo".to_owned(),
            "noona-redis".to_owned(),
            "noona-vault".to_owned(),
        ];

        let wizard_steps = HashMap::from([
            (
                "foundation",
                vec![
                    "noona-mongo".to_owned(),
                    "noona-redis".to_owned(),
                    "noona-bus".to_owned(),
                    "noona-vault".to_owned(),
                ],
            ),
            ("portal", vec!["noona-portal".to_owned()]),
            ("raven", vec![RAVEN_SERVICE.to_owned()]),
            (
                "verification",
                vec!["noona-oracle".to_owned(), "noona-sentinel".to_owned()],
            ),
        ]);

        Self {
            services,
            required,
            wizard_steps,
        }
    }

    /// Test-only constructor letting planner tests build small catalogs
    /// without touching the fixed production service table.
    #[cfg(test)]
    pub fn from_parts(
        descriptors: Vec<ServiceDescriptor>,
        required: Vec<String>,
        wizard_steps: HashMap<&'static str, Vec<String>>,
    ) -> Self {
        let services = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        Self {
            services,
            required,
            wizard_steps,
        }
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Vec<&ServiceDescriptor> {
        let mut all: Vec<&ServiceDescriptor> = self.services.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn wizard_step_services(&self, step: &str) -> &[String] {
        self.wizard_steps
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique_and_deps_resolve() {
        let catalog = Catalog::load();
        let names: HashSet<&str> = catalog.list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names.len(), catalog.list().len());

        for descriptor in catalog.list() {
            for dep in &descriptor.dependencies {
                assert!(
                    catalog.contains(dep),
                    "{} depends on unregistered service {}",
                    descriptor.name,
                    dep
                );
            }
        }
    }

    #[test]
    fn list_is_sorted_by_name() {
        let catalog = Catalog::load();
        let names: Vec<&str> = catalog.list().iter().map(|d| d.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn required_services_are_registered() {
        let catalog = Catalog::load();
        for name in catalog.required() {
            assert!(catalog.contains(name));
        }
    }
}
