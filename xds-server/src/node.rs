//! Mapping from proxy identity to the key its snapshot is stored under.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::message::Node;

/// The key a node's snapshot is stored under.
///
/// Cheap to clone; compared by value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// The key shared by every proxy that does not identify itself.
    pub const UNKNOWN: &'static str = "unknown";

    /// Create a key from a string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The sentinel key for unidentified proxies.
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    /// Returns true if this is the sentinel key.
    pub fn is_unknown(&self) -> bool {
        &*self.0 == Self::UNKNOWN
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Maps the node metadata of a request to a [`NodeKey`].
///
/// Implementations must be total: a node that cannot be identified maps to
/// [`NodeKey::unknown`] rather than an error.
pub trait NodeHash: Send + Sync + 'static {
    /// Compute the key for `node`.
    fn hash(&self, node: Option<&Node>) -> NodeKey;
}

/// Uses the node ID as the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdHash;

impl NodeHash for IdHash {
    fn hash(&self, node: Option<&Node>) -> NodeKey {
        match node.and_then(|n| n.id.as_deref()) {
            Some(id) if !id.is_empty() => NodeKey::new(id),
            _ => NodeKey::unknown(),
        }
    }
}

impl<F> NodeHash for F
where
    F: Fn(Option<&Node>) -> NodeKey + Send + Sync + 'static,
{
    fn hash(&self, node: Option<&Node>) -> NodeKey {
        self(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hash() {
        let node = Node::new("envoy", "1.30").with_id("proxy-1");
        assert_eq!(IdHash.hash(Some(&node)).as_str(), "proxy-1");
    }

    #[test]
    fn test_id_hash_falls_back_to_unknown() {
        assert!(IdHash.hash(None).is_unknown());

        let anonymous = Node::new("envoy", "1.30");
        assert!(IdHash.hash(Some(&anonymous)).is_unknown());

        let empty = Node::new("envoy", "1.30").with_id("");
        assert!(IdHash.hash(Some(&empty)).is_unknown());
    }

    #[test]
    fn test_closure_hash() {
        let by_cluster = |node: Option<&Node>| {
            node.and_then(|n| n.cluster.clone())
                .map(NodeKey::from)
                .unwrap_or_else(NodeKey::unknown)
        };
        let node = Node::new("envoy", "1.30").with_cluster("edge");
        assert_eq!(by_cluster.hash(Some(&node)).as_str(), "edge");
    }
}
