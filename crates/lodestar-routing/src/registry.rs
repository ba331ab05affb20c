//! Registry of the routing policies installed in a process

use std::{collections::HashMap, sync::Arc};

use lodestar_types::{Error, Result, ServiceKey};
use parking_lot::RwLock;

use crate::{endpoint::Endpoint, policy::RoutingPolicy, request::RouteRequest};

/// One policy per service, shared by the lifecycle manager and the call path
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<ServiceKey, Arc<RoutingPolicy>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a policy
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyExists` if a policy is already installed for the key
    pub fn add(&self, key: ServiceKey, policy: Arc<RoutingPolicy>) -> Result<()> {
        let mut policies = self.policies.write();
        if policies.contains_key(&key) {
            return Err(Error::PolicyExists(key.to_string()));
        }
        policies.insert(key, policy);
        Ok(())
    }

    pub fn get(&self, key: &ServiceKey) -> Option<Arc<RoutingPolicy>> {
        self.policies.read().get(key).cloned()
    }

    pub fn remove(&self, key: &ServiceKey) -> Option<Arc<RoutingPolicy>> {
        self.policies.write().remove(key)
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.policies.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    pub fn keys(&self) -> Vec<ServiceKey> {
        self.policies.read().keys().cloned().collect()
    }

    /// Select an endpoint of `key` for a call
    ///
    /// # Errors
    ///
    /// Returns `Error::ServiceNotFound` if no policy is installed for the key,
    /// otherwise whatever [`RoutingPolicy::select`] returns.
    pub fn select(&self, key: &ServiceKey, request: &RouteRequest) -> Result<Arc<Endpoint>> {
        let policy = self.get(key).ok_or_else(|| Error::ServiceNotFound(key.to_string()))?;
        policy.select(request)
    }
}

#[cfg(test)]
mod tests {
    use lodestar_types::Instance;

    use super::*;
    use crate::config::PolicyConfig;

    fn policy(key: &ServiceKey) -> Arc<RoutingPolicy> {
        Arc::new(RoutingPolicy::new(key.clone(), PolicyConfig::default()))
    }

    #[test]
    fn test_add_get_remove() {
        let registry = PolicyRegistry::new();
        let key = ServiceKey::new("Test", "echo");
        let installed = policy(&key);

        registry.add(key.clone(), Arc::clone(&installed)).unwrap();
        assert!(registry.contains(&key));
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &installed));

        let err = registry.add(key.clone(), policy(&key)).unwrap_err();
        assert!(matches!(err, Error::PolicyExists(_)));

        let removed = registry.remove(&key).unwrap();
        assert!(Arc::ptr_eq(&removed, &installed));
        assert!(registry.is_empty());
        assert!(registry.remove(&key).is_none());
    }

    #[test]
    fn test_select_through_registry() {
        let registry = PolicyRegistry::new();
        let key = ServiceKey::new("Test", "echo");
        let installed = policy(&key);
        installed.update_instances(vec![Instance::new("10.0.0.1", 8080)]);
        registry.add(key.clone(), installed).unwrap();

        let endpoint = registry.select(&key, &RouteRequest::new()).unwrap();
        assert_eq!(endpoint.address(), "10.0.0.1:8080");

        let missing = ServiceKey::new("Test", "missing");
        assert!(matches!(registry.select(&missing, &RouteRequest::new()), Err(Error::ServiceNotFound(_))));
    }
}
