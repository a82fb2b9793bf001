use crate::client::ClientInvoker;
use crate::config::ClientConfig;
use crate::error::InvokeError;
use crate::locator::Locator;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide cache of client invokers keyed by structural locator
/// equality: every caller asking for the same endpoint shares one invoker
/// and therefore one connection pool and one lease pinger.
pub struct InvokerRegistry {
    inner: Mutex<HashMap<Locator, Arc<ClientInvoker>>>,
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Get or create the invoker for `locator`. Creation happens under the
    /// map lock, so two racing callers can never end up with two invokers
    /// for one endpoint.
    pub fn client_invoker(
        &self, locator: &Locator, config: &ClientConfig,
    ) -> Result<Arc<ClientInvoker>, InvokeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.get(locator) {
            return Ok(existing.clone());
        }
        let invoker = ClientInvoker::new(locator.clone(), config.clone())?;
        debug!("registry created invoker for {}", locator);
        inner.insert(locator.clone(), invoker.clone());
        Ok(invoker)
    }

    /// Drop the cached invoker; the caller is responsible for disconnecting
    /// it. Subsequent lookups create a fresh one.
    pub fn remove(&self, locator: &Locator) -> Option<Arc<ClientInvoker>> {
        self.inner.lock().unwrap().remove(locator)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_same_locator_shares_invoker() {
        let registry = InvokerRegistry::new();
        let config = ClientConfig::default();
        let a = Locator::from_str("tcp://127.0.0.1:7800/?lease-period=1000").unwrap();
        let b = Locator::from_str("tcp://127.0.0.1:7800/?lease-period=1000").unwrap();

        let first = registry.client_invoker(&a, &config).unwrap();
        let second = registry.client_invoker(&b, &config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_params_distinct_invokers() {
        let registry = InvokerRegistry::new();
        let config = ClientConfig::default();
        let a = Locator::from_str("tcp://127.0.0.1:7800").unwrap();
        let b = Locator::from_str("tcp://127.0.0.1:7800/?lease-period=1000").unwrap();

        let first = registry.client_invoker(&a, &config).unwrap();
        let second = registry.client_invoker(&b, &config).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_get_or_create_is_atomic() {
        let registry = Arc::new(InvokerRegistry::new());
        let locator = Locator::from_str("tcp://127.0.0.1:7800").unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let locator = locator.clone();
            joins.push(std::thread::spawn(move || {
                registry.client_invoker(&locator, &ClientConfig::default()).unwrap()
            }));
        }
        let invokers: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        for pair in invokers.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_forgets() {
        let registry = InvokerRegistry::new();
        let locator = Locator::from_str("tcp://127.0.0.1:7800").unwrap();
        let first = registry.client_invoker(&locator, &ClientConfig::default()).unwrap();
        assert!(registry.remove(&locator).is_some());
        assert!(registry.remove(&locator).is_none());

        let second = registry.client_invoker(&locator, &ClientConfig::default()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
