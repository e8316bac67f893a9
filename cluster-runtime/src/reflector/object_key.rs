use kube::{Resource, ResourceExt};
use std::fmt::{self, Display};

/// A namespaced (if relevant) reference to a Kubernetes object
///
/// Unlike the object itself this is cheap to clone and hash, which is what the work queue
/// and the store are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The namespace of the object
    ///
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectKey {
    /// A key for a cluster-scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Places the key in `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// The key of `obj`
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
