use dashmap::DashMap;
use farcall_bundle::Artifact;
use std::sync::Arc;

/// Built artifacts keyed by content hash
///
/// Artifacts are immutable, so concurrent submissions share one `Arc`.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    entries: DashMap<String, Arc<Artifact>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an artifact with the same id is cached; either way
    /// return the cached instance
    pub fn insert(&self, artifact: Artifact) -> Arc<Artifact> {
        self.entries
            .entry(artifact.id().to_string())
            .or_insert_with(|| Arc::new(artifact))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Artifact>> {
        self.entries.get(id).map(|a| a.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Artifact>> {
        self.entries.remove(id).map(|(_, a)| a)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farcall_bundle::{BundleBuilder, DependencyAnalyzer, WorkUnit};

    fn artifact(value: i64) -> Artifact {
        let unit = WorkUnit::new("jobs", "def f(x):\n    return x + 1\n", "f").arg(value);
        let graph = DependencyAnalyzer::default().analyze(&unit).unwrap();
        BundleBuilder::default().build(&graph).unwrap()
    }

    #[test]
    fn test_same_content_shares_instance() {
        let cache = ArtifactCache::new();
        let first = cache.insert(artifact(1));
        let second = cache.insert(artifact(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.insert(artifact(2));
        assert_eq!(cache.len(), 2);

        assert!(cache.get(first.id()).is_some());
        cache.remove(first.id());
        assert!(cache.get(first.id()).is_none());
    }
}
