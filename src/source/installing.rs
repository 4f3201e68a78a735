//! Writable overlay listing packages that are currently being installed or upgraded.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use super::{Manifest, MutableRepositorySource, RepositorySource, SearchMatch, SearchRequest};
use crate::error::SourceError;

/// Identifier reported by the installing overlay.
pub const INSTALLING_SOURCE_ID: &str = "*Installing";

#[derive(Debug)]
struct Entry {
    manifest: Manifest,
    // Same manifest may be admitted once per source id.
    refs: usize,
}

/// Pseudo source mirroring in-flight install and upgrade operations.
#[derive(Debug, Default)]
pub struct InstallingSource {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl InstallingSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct package versions listed.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns whether a version is listed under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Listed keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl RepositorySource for InstallingSource {
    fn identifier(&self) -> &str {
        INSTALLING_SOURCE_ID
    }

    fn search(&self, request: &SearchRequest) -> Vec<SearchMatch> {
        let entries = self.entries.read();

        let mut results: Vec<SearchMatch> = Vec::new();
        for entry in entries.values().filter(|e| request.matches(&e.manifest)) {
            let manifest = &entry.manifest;
            match results
                .iter_mut()
                .find(|r| r.package_id.eq_ignore_ascii_case(&manifest.id))
            {
                Some(existing) => existing.versions.push(manifest.version.clone()),
                None => {
                    if request.maximum_results > 0 && results.len() == request.maximum_results {
                        continue;
                    }
                    results.push(SearchMatch {
                        package_id: manifest.id.clone(),
                        name: manifest.name.clone(),
                        versions: vec![manifest.version.clone()],
                    });
                }
            }
        }

        for result in &mut results {
            result.versions.sort();
        }
        results
    }
}

impl MutableRepositorySource for InstallingSource {
    fn add_package_version(&self, manifest: &Manifest, key: &str) -> Result<(), SourceError> {
        manifest.validate()?;

        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            manifest: manifest.clone(),
            refs: 0,
        });
        entry.refs += 1;

        debug!(key = %key, refs = entry.refs, "Added package version to installing source");
        Ok(())
    }

    fn remove_package_version(&self, _manifest: &Manifest, key: &str) -> Result<(), SourceError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return Err(SourceError::NotFound(key.to_string()));
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }

        debug!(key = %key, "Removed package version from installing source");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn add(source: &InstallingSource, id: &str, version: &str) {
        let m = Manifest::new(id, version);
        source.add_package_version(&m, &m.version_key()).unwrap();
    }

    fn remove(source: &InstallingSource, id: &str, version: &str) -> Result<(), SourceError> {
        let m = Manifest::new(id, version);
        source.remove_package_version(&m, &m.version_key())
    }

    #[test]
    fn test_add_and_search() {
        let source = InstallingSource::new();
        add(&source, "Contoso.App", "1.0");
        add(&source, "Contoso.App", "2.0");
        add(&source, "Fabrikam.Tool", "3.1");

        let results = source.search(&SearchRequest::by_id("contoso.app"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].versions, vec!["1.0", "2.0"]);

        assert_eq!(source.search(&SearchRequest::default()).len(), 2);
        assert_eq!(source.identifier(), INSTALLING_SOURCE_ID);
    }

    #[test]
    fn test_remove_hides_package() {
        let source = InstallingSource::new();
        add(&source, "Contoso.App", "1.0");
        remove(&source, "Contoso.App", "1.0").unwrap();

        assert!(source.is_empty());
        assert!(source.search(&SearchRequest::by_id("Contoso.App")).is_empty());
    }

    #[test]
    fn test_remove_missing_is_error() {
        let source = InstallingSource::new();
        let err = remove(&source, "Contoso.App", "1.0").unwrap_err();
        assert_eq!(err, SourceError::NotFound("Contoso.App.1.0".to_string()));
    }

    #[test]
    fn test_shared_key_is_reference_counted() {
        let source = InstallingSource::new();
        add(&source, "Contoso.App", "1.0");
        add(&source, "Contoso.App", "1.0");

        remove(&source, "Contoso.App", "1.0").unwrap();
        assert!(source.contains_key("Contoso.App.1.0"));

        remove(&source, "Contoso.App", "1.0").unwrap();
        assert!(!source.contains_key("Contoso.App.1.0"));
    }

    #[test]
    fn test_invalid_manifest_rejected() {
        let source = InstallingSource::new();
        let m = Manifest::new("Contoso.App", "");
        assert!(source.add_package_version(&m, "Contoso.App.").is_err());
        assert!(source.is_empty());
    }

    #[test]
    fn test_maximum_results() {
        let source = InstallingSource::new();
        add(&source, "A", "1");
        add(&source, "B", "1");
        add(&source, "C", "1");

        let results = source.search(&SearchRequest::default().with_maximum_results(2));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_concurrent_mutation_and_search() {
        let source = Arc::new(InstallingSource::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let source = Arc::clone(&source);
                thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("Pkg{}.{}", t, i);
                        add(&source, &id, "1.0");
                        let _ = source.search(&SearchRequest::default());
                        remove(&source, &id, "1.0").unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(source.is_empty());
    }
}
