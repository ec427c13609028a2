//! Immutable per-node configuration snapshots.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::ResourceAny;
use crate::resource::{NamedResource, ResourceType};

/// The resources of one type within a snapshot, under a single version.
///
/// Cloning is cheap: the resource list is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    version: String,
    items: Arc<[NamedResource]>,
}

impl Resources {
    /// Create a versioned resource list. The order of `items` is preserved
    /// in every response built from it.
    pub fn new<I>(version: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = NamedResource>,
    {
        Self {
            version: version.into(),
            items: items.into_iter().collect(),
        }
    }

    /// The version token. Only meaningful for equality comparison.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The resources, in producer order.
    pub fn items(&self) -> &[NamedResource] {
        &self.items
    }

    /// Returns true if there are no resources of this type.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns the resources a subscription asks for.
    ///
    /// An empty `names` list is a wildcard subscription and selects every
    /// resource. Names not present in the snapshot are skipped.
    pub fn select(&self, names: &[String]) -> Vec<ResourceAny> {
        if names.is_empty() {
            return self.items.iter().map(|r| r.resource.clone()).collect();
        }
        self.items
            .iter()
            .filter(|r| names.iter().any(|n| *n == r.name))
            .map(|r| r.resource.clone())
            .collect()
    }

    /// Names of every resource.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|r| r.name.as_str())
    }
}

/// The full configuration state held for one node.
///
/// A snapshot holds, for each [`ResourceType`], an optional [`Resources`]
/// entry. A type without an entry has no version yet, so requests for it
/// wait; a type with an empty entry means "no resources of this type".
///
/// # Example
///
/// ```
/// use xds_server::{NamedResource, ResourceAny, ResourceType, Snapshot};
///
/// let cluster = ResourceAny::new(ResourceType::Cluster.type_url(), b"cluster".as_slice());
/// let snapshot = Snapshot::builder()
///     .resources(ResourceType::Cluster, "v1", [NamedResource::new("c1", cluster)])
///     .resources(ResourceType::Listener, "v1", [])
///     .build();
///
/// assert_eq!(snapshot.version(ResourceType::Cluster), Some("v1"));
/// assert_eq!(snapshot.version(ResourceType::Route), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    resources: [Option<Resources>; 4],
}

impl Snapshot {
    /// Start building a snapshot.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// The resources of type `ty`, if the snapshot defines that type.
    pub fn get(&self, ty: ResourceType) -> Option<&Resources> {
        self.resources[ty.index()].as_ref()
    }

    /// The version of type `ty`, if the snapshot defines that type.
    pub fn version(&self, ty: ResourceType) -> Option<&str> {
        self.get(ty).map(Resources::version)
    }

    /// Check that every defined type has a version and that every resource is
    /// encoded as its type and named uniquely.
    pub fn validate(&self) -> Result<()> {
        for ty in ResourceType::ALL {
            let Some(resources) = self.get(ty) else {
                continue;
            };

            if resources.version().is_empty() {
                return Err(Error::InvalidSnapshot(format!("{ty} resources have no version")));
            }

            let mut seen = HashSet::with_capacity(resources.len());
            for item in resources.items() {
                if item.name.is_empty() {
                    return Err(Error::InvalidSnapshot(format!("unnamed {ty} resource")));
                }
                if item.resource.type_url != ty.type_url() {
                    return Err(Error::InvalidSnapshot(format!(
                        "{ty} resource {:?} is encoded as {:?}",
                        item.name, item.resource.type_url
                    )));
                }
                if !seen.insert(item.name.as_str()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "duplicate {ty} resource {:?}",
                        item.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    resources: [Option<Resources>; 4],
}

impl SnapshotBuilder {
    /// Define the resources of type `ty` under `version`.
    ///
    /// Calling this twice for the same type replaces the earlier entry.
    pub fn resources<I>(mut self, ty: ResourceType, version: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = NamedResource>,
    {
        self.resources[ty.index()] = Some(Resources::new(version, items));
        self
    }

    /// Build the snapshot.
    pub fn build(self) -> Snapshot {
        Snapshot {
            resources: self.resources,
        }
    }
}
