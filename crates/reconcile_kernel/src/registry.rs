//! Descriptor registry
//!
//! Keeps registered descriptors ordered so that every descriptor comes after
//! the descriptors listed in its `dump_dependencies`. Lookups by key use the
//! first descriptor whose selector matches; registration rejects descriptors
//! whose key spaces overlap on any sample key.

use crate::error::RegistryError;
use reconcile_api::Descriptor;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Registered descriptors
#[derive(Default)]
pub(crate) struct Registry {
    /// In dump-dependency order
    ordered: Vec<Arc<dyn Descriptor>>,
    by_name: HashMap<String, Arc<dyn Descriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor.
    ///
    /// `known_keys` are keys already present in the graph; they are checked
    /// together with the sample keys of both descriptors.
    pub fn register<'a, I>(
        &mut self,
        descriptor: Arc<dyn Descriptor>,
        known_keys: I,
    ) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let name = descriptor.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateDescriptor(name));
        }

        let mut samples: Vec<String> = known_keys.into_iter().map(str::to_string).collect();
        samples.extend(sample_keys(descriptor.as_ref()));
        for existing in &self.ordered {
            let existing_samples = sample_keys(existing.as_ref());
            for key in samples.iter().chain(existing_samples.iter()) {
                if existing.key_selector(key) && descriptor.key_selector(key) {
                    return Err(RegistryError::OverlappingKeySpace {
                        key: key.clone(),
                        existing: existing.name().to_string(),
                        new: name,
                    });
                }
            }
        }

        let mut candidates = self.ordered.clone();
        candidates.push(descriptor.clone());
        let ordered = dump_order(candidates)?;

        self.by_name.insert(name.clone(), descriptor);
        self.ordered = ordered;
        log::debug!("Registered descriptor {}", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Descriptor>> {
        self.by_name.get(name)
    }

    /// Descriptor owning the key
    pub fn for_key(&self, key: &str) -> Option<&Arc<dyn Descriptor>> {
        self.ordered.iter().find(|d| d.key_selector(key))
    }

    /// Descriptor declaring the given NB key prefix
    pub fn for_nb_key_prefix(&self, prefix: &str) -> Option<&Arc<dyn Descriptor>> {
        self.ordered.iter().find(|d| d.nb_key_prefix() == Some(prefix))
    }

    /// All descriptors in dump-dependency order
    pub fn ordered(&self) -> &[Arc<dyn Descriptor>] {
        &self.ordered
    }

    pub fn nb_key_prefixes(&self) -> Vec<String> {
        self.ordered
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_string))
            .collect()
    }
}

fn sample_keys(descriptor: &dyn Descriptor) -> Vec<String> {
    let mut keys = descriptor.sample_keys();
    if let Some(prefix) = descriptor.nb_key_prefix() {
        keys.push(prefix.to_string());
    }
    keys
}

/// Order descriptors so that dump dependencies come first.
///
/// Dependencies on unregistered descriptors are ignored. Ties keep
/// registration order.
fn dump_order(
    descriptors: Vec<Arc<dyn Descriptor>>,
) -> Result<Vec<Arc<dyn Descriptor>>, RegistryError> {
    let index: BTreeMap<String, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name().to_string(), i))
        .collect();

    let mut ordered = Vec::with_capacity(descriptors.len());
    let mut done: HashSet<usize> = HashSet::new();
    let mut visiting: HashSet<usize> = HashSet::new();

    fn visit(
        idx: usize,
        descriptors: &[Arc<dyn Descriptor>],
        index: &BTreeMap<String, usize>,
        done: &mut HashSet<usize>,
        visiting: &mut HashSet<usize>,
        ordered: &mut Vec<Arc<dyn Descriptor>>,
    ) -> Result<(), RegistryError> {
        if done.contains(&idx) {
            return Ok(());
        }
        if !visiting.insert(idx) {
            return Err(RegistryError::DumpDependencyCycle(
                descriptors[idx].name().to_string(),
            ));
        }
        for dep in descriptors[idx].dump_dependencies() {
            if let Some(&dep_idx) = index.get(&dep) {
                visit(dep_idx, descriptors, index, done, visiting, ordered)?;
            }
        }
        visiting.remove(&idx);
        done.insert(idx);
        ordered.push(descriptors[idx].clone());
        Ok(())
    }

    for idx in 0..descriptors.len() {
        visit(idx, &descriptors, &index, &mut done, &mut visiting, &mut ordered)?;
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefixed {
        name: &'static str,
        prefix: &'static str,
        dump_deps: Vec<String>,
    }

    impl Prefixed {
        fn new(name: &'static str, prefix: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                prefix,
                dump_deps: Vec::new(),
            })
        }

        fn after(name: &'static str, prefix: &'static str, deps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                prefix,
                dump_deps: deps.iter().map(|d| d.to_string()).collect(),
            })
        }
    }

    impl Descriptor for Prefixed {
        fn name(&self) -> &str {
            self.name
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with(self.prefix)
        }

        fn nb_key_prefix(&self) -> Option<&str> {
            Some(self.prefix)
        }

        fn dump_dependencies(&self) -> Vec<String> {
            self.dump_deps.clone()
        }
    }

    fn names(registry: &Registry) -> Vec<&str> {
        registry.ordered().iter().map(|d| d.name()).collect()
    }

    #[test]
    fn test_lookup() {
        let mut registry = Registry::new();
        registry.register(Prefixed::new("iface", "iface/"), []).unwrap();
        registry.register(Prefixed::new("route", "route/"), []).unwrap();

        assert_eq!(registry.for_key("route/1").unwrap().name(), "route");
        assert!(registry.for_key("acl/1").is_none());
        assert_eq!(registry.for_nb_key_prefix("iface/").unwrap().name(), "iface");
        assert_eq!(registry.nb_key_prefixes(), vec!["iface/", "route/"]);
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let mut registry = Registry::new();
        registry.register(Prefixed::new("iface", "iface/"), []).unwrap();
        assert_eq!(
            registry.register(Prefixed::new("iface", "other/"), []),
            Err(RegistryError::DuplicateDescriptor("iface".into()))
        );
        assert!(matches!(
            registry.register(Prefixed::new("vlan", "iface/vlan/"), []),
            Err(RegistryError::OverlappingKeySpace { .. })
        ));
        assert!(matches!(
            registry.register(Prefixed::new("loose", "i"), ["iface/eth0"]),
            Err(RegistryError::OverlappingKeySpace { .. })
        ));
        assert_eq!(names(&registry), vec!["iface"]);
    }

    #[test]
    fn test_dump_order() {
        let mut registry = Registry::new();
        registry
            .register(Prefixed::after("route", "route/", &["iface", "vrf"]), [])
            .unwrap();
        registry.register(Prefixed::new("acl", "acl/"), []).unwrap();
        registry
            .register(Prefixed::after("iface", "iface/", &["vrf"]), [])
            .unwrap();
        registry.register(Prefixed::new("vrf", "vrf/"), []).unwrap();
        assert_eq!(names(&registry), vec!["vrf", "iface", "route", "acl"]);
    }

    #[test]
    fn test_dump_cycle_rejected() {
        let mut registry = Registry::new();
        registry
            .register(Prefixed::after("a", "a/", &["b"]), [])
            .unwrap();
        let err = registry
            .register(Prefixed::after("b", "b/", &["a"]), [])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DumpDependencyCycle(_)));
        assert_eq!(names(&registry), vec!["a"]);
        assert!(registry.get("b").is_none());
    }
}
