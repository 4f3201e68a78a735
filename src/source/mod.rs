//! Package source contract shared by the installing overlay and real repositories.
//!
//! The orchestrator only depends on [`RepositorySource`] and
//! [`MutableRepositorySource`]; it never sees a concrete repository.

pub mod installing;

use serde::{Deserialize, Serialize};

use crate::error::SourceError;

pub use installing::{InstallingSource, INSTALLING_SOURCE_ID};

/// Package manifest carried by an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Package identifier, e.g. `Contoso.App`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Package version.
    pub version: String,
    #[serde(default)]
    pub moniker: Option<String>,
}

impl Manifest {
    /// Creates a manifest whose name defaults to the id.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            moniker: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the moniker.
    pub fn with_moniker(mut self, moniker: impl Into<String>) -> Self {
        self.moniker = Some(moniker.into());
        self
    }

    /// Key under which this version is stored in a writable source: `{id}.{version}`.
    pub fn version_key(&self) -> String {
        format!("{}.{}", self.id, self.version)
    }

    /// Checks the fields a writable source needs.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.id.trim().is_empty() {
            return Err(SourceError::InvalidManifest("id is empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(SourceError::InvalidManifest(format!(
                "version is empty for '{}'",
                self.id
            )));
        }
        Ok(())
    }
}

/// Manifest field a filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageMatchField {
    Id,
    Name,
    Moniker,
}

/// How a filter value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    CaseInsensitive,
    StartsWith,
    Substring,
}

/// One field comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMatchFilter {
    pub field: PackageMatchField,
    pub match_type: MatchType,
    pub value: String,
}

impl PackageMatchFilter {
    pub fn new(field: PackageMatchField, match_type: MatchType, value: impl Into<String>) -> Self {
        Self {
            field,
            match_type,
            value: value.into(),
        }
    }

    /// Returns whether the manifest satisfies this filter.
    pub fn matches(&self, manifest: &Manifest) -> bool {
        let candidate = match self.field {
            PackageMatchField::Id => Some(manifest.id.as_str()),
            PackageMatchField::Name => Some(manifest.name.as_str()),
            PackageMatchField::Moniker => manifest.moniker.as_deref(),
        };
        let Some(candidate) = candidate else {
            return false;
        };

        match self.match_type {
            MatchType::Exact => candidate == self.value,
            MatchType::CaseInsensitive => candidate.to_lowercase() == self.value.to_lowercase(),
            MatchType::StartsWith => candidate
                .to_lowercase()
                .starts_with(&self.value.to_lowercase()),
            MatchType::Substring => candidate
                .to_lowercase()
                .contains(&self.value.to_lowercase()),
        }
    }
}

/// Search request against a package source.
///
/// An empty request returns every package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Primary query.
    #[serde(default)]
    pub query: Option<PackageMatchFilter>,
    /// Additional filters; every one must match.
    #[serde(default)]
    pub filters: Vec<PackageMatchFilter>,
    /// Result cap; zero means unlimited.
    #[serde(default)]
    pub maximum_results: usize,
}

impl SearchRequest {
    /// Request for every package whose id equals `id`, ignoring case.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            query: Some(PackageMatchFilter::new(
                PackageMatchField::Id,
                MatchType::CaseInsensitive,
                id,
            )),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: PackageMatchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_maximum_results(mut self, maximum: usize) -> Self {
        self.maximum_results = maximum;
        self
    }

    /// Returns whether the manifest satisfies the query and every filter.
    pub fn matches(&self, manifest: &Manifest) -> bool {
        self.query.as_ref().map_or(true, |q| q.matches(manifest))
            && self.filters.iter().all(|f| f.matches(manifest))
    }
}

/// One package returned by a search, with all matching versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub package_id: String,
    pub name: String,
    pub versions: Vec<String>,
}

/// Read side of a package source.
///
/// Implementations must tolerate concurrent calls from many threads.
pub trait RepositorySource: Send + Sync {
    /// Stable identifier of the source.
    fn identifier(&self) -> &str;

    /// Returns packages matching the request.
    fn search(&self, request: &SearchRequest) -> Vec<SearchMatch>;
}

/// Write side of a package source.
///
/// Mutations may interleave with searches from other threads.
pub trait MutableRepositorySource: RepositorySource {
    /// Adds one package version under `key`.
    fn add_package_version(&self, manifest: &Manifest, key: &str) -> Result<(), SourceError>;

    /// Removes the package version stored under `key`.
    fn remove_package_version(&self, manifest: &Manifest, key: &str) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::new("Contoso.App", "1.2.0")
            .with_name("Contoso App")
            .with_moniker("contoso")
    }

    #[test]
    fn test_version_key() {
        assert_eq!(manifest().version_key(), "Contoso.App.1.2.0");
    }

    #[test]
    fn test_manifest_validate() {
        assert!(manifest().validate().is_ok());
        assert!(Manifest::new("", "1.0").validate().is_err());
        assert!(Manifest::new("A", " ").validate().is_err());
    }

    #[test]
    fn test_filter_match_types() {
        let m = manifest();
        let f = |t, v: &str| PackageMatchFilter::new(PackageMatchField::Id, t, v);

        assert!(f(MatchType::Exact, "Contoso.App").matches(&m));
        assert!(!f(MatchType::Exact, "contoso.app").matches(&m));
        assert!(f(MatchType::CaseInsensitive, "contoso.app").matches(&m));
        assert!(f(MatchType::StartsWith, "CONTOSO").matches(&m));
        assert!(f(MatchType::Substring, "so.ap").matches(&m));
        assert!(!f(MatchType::Substring, "fabrikam").matches(&m));
    }

    #[test]
    fn test_filter_missing_moniker() {
        let m = Manifest::new("Fabrikam.Tool", "2.0");
        let filter = PackageMatchFilter::new(PackageMatchField::Moniker, MatchType::Exact, "tool");
        assert!(!filter.matches(&m));
    }

    #[test]
    fn test_request_filters_all_must_match() {
        let m = manifest();
        let request = SearchRequest::by_id("contoso.app").with_filter(PackageMatchFilter::new(
            PackageMatchField::Name,
            MatchType::Substring,
            "app",
        ));
        assert!(request.matches(&m));

        let request = request.with_filter(PackageMatchFilter::new(
            PackageMatchField::Moniker,
            MatchType::Exact,
            "other",
        ));
        assert!(!request.matches(&m));
        assert!(SearchRequest::default().matches(&m));
    }
}
