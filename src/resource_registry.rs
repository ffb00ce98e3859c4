//! Bidirectional resource name <-> dense index mapping, populated once at
//! startup from the `metrics/*` sections of the config file.
//!
//! Grounded on the stream/resource registries in `logjam-importer.c`
//! (`resource_to_int`/`int_to_resource`, the per-family index arrays, and
//! `other_time_resources`), generalized into an owned Rust struct that is
//! built once and then shared by `Arc` reference across every worker.

use std::collections::HashMap;

/// Hard cap carried over from `MAX_RESOURCE_COUNT` in the original source.
pub const MAX_RESOURCE_COUNT: usize = 100;

/// Small dense integer index into a resource's slot in `Increments::metrics`.
pub type ResourceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFamily {
    Time,
    Call,
    Memory,
    Heap,
    Frontend,
    Dom,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    names: Vec<String>,
    by_name: HashMap<String, ResourceId>,
    families: HashMap<ResourceFamily, Vec<ResourceId>>,
    /// `other_time_resources`: every time-family resource except
    /// `total_time`, `gc_time`, `other_time`.
    other_time_resources: Vec<ResourceId>,
    allocated_objects_index: Option<ResourceId>,
    allocated_bytes_index: Option<ResourceId>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("resource registry cardinality cap ({MAX_RESOURCE_COUNT}) exceeded")]
    CapacityExceeded,
    #[error("duplicate resource name: {0}")]
    Duplicate(String),
}

impl ResourceRegistry {
    pub fn builder() -> ResourceRegistryBuilder {
        ResourceRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<ResourceId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ResourceId) -> &str {
        &self.names[id]
    }

    /// Derived `<resource>_sq` name, used for sum-of-squares accumulation.
    pub fn sq_name_of(&self, id: ResourceId) -> String {
        format!("{}_sq", self.names[id])
    }

    pub fn family(&self, family: ResourceFamily) -> &[ResourceId] {
        self.families
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn other_time_resources(&self) -> &[ResourceId] {
        &self.other_time_resources
    }

    pub fn allocated_objects_index(&self) -> Option<ResourceId> {
        self.allocated_objects_index
    }

    pub fn allocated_bytes_index(&self) -> Option<ResourceId> {
        self.allocated_bytes_index
    }

    pub fn is_time_resource(&self, id: ResourceId) -> bool {
        self.family(ResourceFamily::Time).contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = ResourceId> {
        0..self.names.len()
    }
}

#[derive(Default, Debug)]
pub struct ResourceRegistryBuilder {
    names: Vec<String>,
    by_name: HashMap<String, ResourceId>,
    families: HashMap<ResourceFamily, Vec<ResourceId>>,
}

impl ResourceRegistryBuilder {
    /// Registers every resource name in `names` under `family`, in order.
    pub fn add_family(
        mut self,
        family: ResourceFamily,
        names: &[String],
    ) -> Result<Self, RegistryError> {
        for name in names {
            let id = self.push(name)?;
            self.families.entry(family).or_default().push(id);
        }
        Ok(self)
    }

    fn push(&mut self, name: &str) -> Result<ResourceId, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        if self.names.len() >= MAX_RESOURCE_COUNT {
            return Err(RegistryError::CapacityExceeded);
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn build(self) -> ResourceRegistry {
        let other_time_resources = self
            .families
            .get(&ResourceFamily::Time)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&id| {
                let name = &self.names[id];
                name != "total_time" && name != "gc_time" && name != "other_time"
            })
            .collect();

        let allocated_objects_index = self.by_name.get("allocated_objects").copied();
        let allocated_bytes_index = self.by_name.get("allocated_bytes").copied();

        ResourceRegistry {
            names: self.names,
            by_name: self.by_name,
            families: self.families,
            other_time_resources,
            allocated_objects_index,
            allocated_bytes_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResourceRegistry {
        ResourceRegistry::builder()
            .add_family(
                ResourceFamily::Time,
                &[
                    "total_time".into(),
                    "gc_time".into(),
                    "db_time".into(),
                    "view_time".into(),
                ],
            )
            .unwrap()
            .add_family(ResourceFamily::Call, &["db_calls".into()])
            .unwrap()
            .add_family(
                ResourceFamily::Memory,
                &["allocated_objects".into(), "allocated_bytes".into()],
            )
            .unwrap()
            .build()
    }

    #[test]
    fn indexes_resources_densely() {
        let reg = sample();
        assert_eq!(reg.len(), 7);
        assert_eq!(reg.index_of("total_time"), Some(0));
        assert_eq!(reg.name_of(0), "total_time");
        assert_eq!(reg.sq_name_of(0), "total_time_sq");
    }

    #[test]
    fn other_time_excludes_total_gc_other() {
        let reg = sample();
        let other: Vec<_> = reg
            .other_time_resources()
            .iter()
            .map(|&id| reg.name_of(id))
            .collect();
        assert_eq!(other, vec!["db_time", "view_time"]);
    }

    #[test]
    fn caches_allocated_indices() {
        let reg = sample();
        assert!(reg.allocated_objects_index().is_some());
        assert!(reg.allocated_bytes_index().is_some());
    }

    #[test]
    fn rejects_duplicates() {
        let err = ResourceRegistry::builder()
            .add_family(ResourceFamily::Time, &["total_time".into()])
            .unwrap()
            .add_family(ResourceFamily::Call, &["total_time".into()])
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn enforces_cardinality_cap() {
        let names: Vec<String> = (0..MAX_RESOURCE_COUNT + 1)
            .map(|i| format!("r{i}"))
            .collect();
        let err = ResourceRegistry::builder()
            .add_family(ResourceFamily::Time, &names)
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapacityExceeded));
    }
}
