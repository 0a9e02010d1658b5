//! Static service registry
//!
//! The catalog of everything the control plane manages: the six application
//! services plus their stateful backing stores. Created once at startup;
//! immutable afterwards.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Relational database backing store name
pub const RELATIONAL_DB: &str = "relational-db";
/// Key-value cache backing store name
pub const CACHE: &str = "cache";
/// Vector store backing store name
pub const VECTOR_DB: &str = "vector-db";

/// A managed service: stable name, listening port, runtime dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Stable identifier
    pub name: String,
    /// TCP port (unique across the registry)
    pub port: u16,
    /// Runtime dependencies, ordered; drawn from backing stores and other services
    pub dependencies: Vec<String>,
    /// Application service or backing store
    pub kind: ServiceKind,
}

/// Service classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Built from source and deployed by the platform
    Application,
    /// Stateful store the platform manages but does not build
    Backing,
}

/// Static catalog of services
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<Service>,
}

impl ServiceRegistry {
    /// Build the platform registry
    pub fn new() -> Self {
        let svc = |name: &str, port: u16, deps: &[&str]| Service {
            name: name.into(),
            port,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            kind: ServiceKind::Application,
        };
        let store = |name: &str, port: u16| Service {
            name: name.into(),
            port,
            dependencies: Vec::new(),
            kind: ServiceKind::Backing,
        };

        Self {
            services: vec![
                svc("gateway", 3000, &[CACHE, "personas", "workflows", "projects", "context", "tokens"]),
                svc("personas", 3001, &[RELATIONAL_DB, CACHE]),
                svc("workflows", 3002, &[RELATIONAL_DB, CACHE, "personas", "context"]),
                svc("projects", 3003, &[RELATIONAL_DB, CACHE, "workflows", "context"]),
                svc("context", 3004, &[RELATIONAL_DB, CACHE, VECTOR_DB]),
                svc("tokens", 3005, &[RELATIONAL_DB, CACHE]),
                store(RELATIONAL_DB, 5432),
                store(CACHE, 6379),
                store(VECTOR_DB, 6333),
            ],
        }
    }

    /// All registered services
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Application services only (the buildable, deployable set)
    pub fn application_services(&self) -> Vec<&Service> {
        self.services.iter().filter(|s| s.kind == ServiceKind::Application).collect()
    }

    /// Backing stores only
    pub fn backing_stores(&self) -> Vec<&Service> {
        self.services.iter().filter(|s| s.kind == ServiceKind::Backing).collect()
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Whether the registry knows this name
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Listening port of a service
    pub fn port(&self, name: &str) -> CoreResult<u16> {
        self.get(name)
            .map(|s| s.port)
            .ok_or_else(|| CoreError::UnknownService(name.into()))
    }

    /// Runtime dependencies of a service
    pub fn dependencies(&self, name: &str) -> CoreResult<&[String]> {
        self.get(name)
            .map(|s| s.dependencies.as_slice())
            .ok_or_else(|| CoreError::UnknownService(name.into()))
    }

    /// Dependency closure of a set of services, dependencies before dependents.
    ///
    /// The returned order is deterministic: a post-order walk that visits each
    /// service's dependencies (in declaration order) before the service itself.
    pub fn resolve(&self, names: &[&str]) -> CoreResult<Vec<String>> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            self.visit(name, &mut seen, &mut ordered)?;
        }
        Ok(ordered)
    }

    fn visit(&self, name: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) -> CoreResult<()> {
        if seen.contains(name) {
            return Ok(());
        }
        let service = self
            .get(name)
            .ok_or_else(|| CoreError::UnknownService(name.into()))?;
        seen.insert(name.to_string());
        for dep in &service.dependencies {
            self.visit(dep, seen, out)?;
        }
        out.push(name.to_string());
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog() {
        let registry = ServiceRegistry::new();
        assert_eq!(registry.services().len(), 9);
        assert_eq!(registry.port("gateway").unwrap(), 3000);
        assert_eq!(registry.port("personas").unwrap(), 3001);
        assert_eq!(registry.port("workflows").unwrap(), 3002);
        assert_eq!(registry.port("projects").unwrap(), 3003);
        assert_eq!(registry.port("context").unwrap(), 3004);
        assert_eq!(registry.port("tokens").unwrap(), 3005);
        assert_eq!(registry.port(RELATIONAL_DB).unwrap(), 5432);
        assert_eq!(registry.port(CACHE).unwrap(), 6379);
        assert_eq!(registry.port(VECTOR_DB).unwrap(), 6333);
    }

    #[test]
    fn test_ports_unique() {
        let registry = ServiceRegistry::new();
        let mut ports: Vec<u16> = registry.services().iter().map(|s| s.port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), registry.services().len());
    }

    #[test]
    fn test_resolve_orders_dependencies_first() {
        let registry = ServiceRegistry::new();
        let order = registry.resolve(&["gateway"]).unwrap();

        let index = |name: &str| order.iter().position(|n| n == name).unwrap();
        for dep in registry.dependencies("gateway").unwrap() {
            assert!(index(dep) < index("gateway"), "{dep} must precede gateway");
        }
        // transitive: workflows pulls in personas and context
        assert!(index("personas") < index("workflows"));
        assert!(index("context") < index("workflows"));
        assert_eq!(order.last().unwrap(), "gateway");
    }

    #[test]
    fn test_resolve_unknown_service() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.resolve(&["nonexistent"]),
            Err(CoreError::UnknownService(_))
        ));
    }

    #[test]
    fn test_resolve_no_duplicates() {
        let registry = ServiceRegistry::new();
        let order = registry.resolve(&["gateway", "projects", "workflows"]).unwrap();
        let mut unique = order.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), order.len());
    }
}
