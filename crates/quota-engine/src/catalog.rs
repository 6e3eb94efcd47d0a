//! Feature and Package Catalog
//!
//! Reference data for resolution. A catalog is validated once at load time
//! and then immutable; requests read a snapshot, and administrative reloads
//! swap the whole snapshot atomically. Nothing here mutates mid-request.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use quota_common::{EngineError, EngineResult};

use crate::model::{Feature, Package};

/// On-disk catalog document (JSON)
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogDocument {
    /// Feature definitions
    pub features: Vec<Feature>,
    /// Package definitions
    pub packages: Vec<Package>,
}

/// Immutable, validated catalog contents
pub struct CatalogSnapshot {
    features: HashMap<String, Feature>,
    packages: HashMap<String, Package>,
}

impl CatalogSnapshot {
    /// Validate and build a snapshot
    ///
    /// Rejects duplicate codes, references to unknown features (parents or
    /// package grants), and cyclic pool links. Configuration defects are
    /// fatal here so they can never surface at request time.
    pub fn build(features: Vec<Feature>, packages: Vec<Package>) -> EngineResult<Self> {
        let mut feature_map = HashMap::with_capacity(features.len());
        for feature in features {
            if feature_map.contains_key(&feature.code) {
                return Err(EngineError::DuplicateFeature(feature.code));
            }
            feature_map.insert(feature.code.clone(), feature);
        }

        for feature in feature_map.values() {
            if let Some(parent) = &feature.parent_code {
                if !feature_map.contains_key(parent) {
                    return Err(EngineError::UnknownParent {
                        feature: feature.code.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        // Cycle check: walk every parent chain with a visited set.
        for feature in feature_map.values() {
            let mut seen = HashSet::new();
            seen.insert(feature.code.as_str());
            let mut current = feature;
            while let Some(parent) = &current.parent_code {
                if !seen.insert(parent.as_str()) {
                    return Err(EngineError::CyclicPool(feature.code.clone()));
                }
                current = &feature_map[parent.as_str()];
            }
        }

        let mut package_map = HashMap::with_capacity(packages.len());
        for package in packages {
            if package_map.contains_key(&package.code) {
                return Err(EngineError::DuplicatePackage(package.code));
            }
            for grant in &package.grants {
                if !feature_map.contains_key(&grant.feature_code) {
                    return Err(EngineError::UnknownFeatureInPackage {
                        package: package.code.clone(),
                        feature: grant.feature_code.clone(),
                    });
                }
            }
            package_map.insert(package.code.clone(), package);
        }

        Ok(Self {
            features: feature_map,
            packages: package_map,
        })
    }

    /// Look up a feature by code
    pub fn feature(&self, code: &str) -> Option<&Feature> {
        self.features.get(code)
    }

    /// Look up a package by code
    pub fn package(&self, code: &str) -> Option<&Package> {
        self.packages.get(code)
    }

    /// Ordered pool ancestors of a feature, nearest first
    ///
    /// Cycles were rejected at build time, so the walk terminates.
    pub fn parent_chain(&self, code: &str) -> Vec<&Feature> {
        let mut chain = Vec::new();
        let mut current = self.features.get(code);
        while let Some(feature) = current {
            match &feature.parent_code {
                Some(parent) => {
                    let parent = &self.features[parent.as_str()];
                    chain.push(parent);
                    current = Some(parent);
                }
                None => break,
            }
        }
        chain
    }

    /// Number of features in the snapshot
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }
}

/// Process-wide catalog handle
///
/// Holds the current snapshot behind an atomic swap: readers pin a snapshot
/// for the duration of one resolution cycle, reloads replace it wholesale.
pub struct FeatureCatalog {
    inner: ArcSwap<CatalogSnapshot>,
}

impl FeatureCatalog {
    /// Build and install the initial snapshot
    pub fn new(features: Vec<Feature>, packages: Vec<Package>) -> EngineResult<Self> {
        let snapshot = CatalogSnapshot::build(features, packages)?;
        Ok(Self {
            inner: ArcSwap::from_pointee(snapshot),
        })
    }

    /// Load, validate and install a catalog from a JSON data file
    ///
    /// A missing or malformed file is a boot-time defect, never a
    /// per-request condition.
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let document: CatalogDocument = serde_json::from_str(&raw)?;
        tracing::info!(
            features = document.features.len(),
            packages = document.packages.len(),
            "catalog loaded from file"
        );
        Self::new(document.features, document.packages)
    }

    /// Validate a new snapshot and swap it in
    ///
    /// On validation failure the current snapshot stays in place.
    pub fn reload(&self, features: Vec<Feature>, packages: Vec<Package>) -> EngineResult<()> {
        let snapshot = CatalogSnapshot::build(features, packages)?;
        self.inner.store(Arc::new(snapshot));
        Ok(())
    }

    /// Pin the current snapshot
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.inner.load_full()
    }

    /// Convenience single-feature lookup
    pub fn lookup(&self, code: &str) -> Option<Feature> {
        self.snapshot().feature(code).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResetPolicy;

    #[test]
    fn test_lookup_and_parent_chain() {
        let catalog = FeatureCatalog::new(
            vec![
                Feature::limited("api.calls", ResetPolicy::Monthly),
                Feature::limited("api.calls.search", ResetPolicy::Monthly)
                    .pooled_under("api.calls"),
            ],
            vec![Package::base("starter").with_grant("api.calls", Some(100))],
        )
        .unwrap();

        let snap = catalog.snapshot();
        assert!(snap.feature("api.calls").is_some());
        assert!(snap.feature("nope").is_none());

        let chain = snap.parent_chain("api.calls.search");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].code, "api.calls");
        assert!(snap.parent_chain("api.calls").is_empty());
    }

    #[test]
    fn test_cyclic_pool_rejected() {
        let result = CatalogSnapshot::build(
            vec![
                Feature::limited("a", ResetPolicy::None).pooled_under("b"),
                Feature::limited("b", ResetPolicy::None).pooled_under("a"),
            ],
            vec![],
        );
        assert!(matches!(result, Err(EngineError::CyclicPool(_))));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let result = CatalogSnapshot::build(
            vec![Feature::limited("a", ResetPolicy::None).pooled_under("ghost")],
            vec![],
        );
        assert!(matches!(result, Err(EngineError::UnknownParent { .. })));
    }

    #[test]
    fn test_package_with_unknown_feature_rejected() {
        let result = CatalogSnapshot::build(
            vec![Feature::boolean("real")],
            vec![Package::base("plan").with_grant("ghost", None)],
        );
        assert!(matches!(
            result,
            Err(EngineError::UnknownFeatureInPackage { .. })
        ));
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let result = CatalogSnapshot::build(
            vec![Feature::boolean("dup"), Feature::boolean("dup")],
            vec![],
        );
        assert!(matches!(result, Err(EngineError::DuplicateFeature(_))));
    }

    #[test]
    fn test_missing_catalog_file_is_an_io_error() {
        let result = FeatureCatalog::from_json_file("/nonexistent/catalog.json");
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_catalog_document_parses() {
        let raw = r#"{
            "features": [{
                "code": "bio.pages",
                "name": "Bio pages",
                "kind": "limit",
                "reset_policy": "monthly",
                "parent_code": null,
                "is_active": true
            }],
            "packages": []
        }"#;
        let document: CatalogDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(document.features[0].code, "bio.pages");
        assert_eq!(document.features[0].kind, crate::model::FeatureKind::Limit);
    }

    #[test]
    fn test_reload_keeps_old_snapshot_on_failure() {
        let catalog = FeatureCatalog::new(vec![Feature::boolean("keep")], vec![]).unwrap();

        let result = catalog.reload(
            vec![Feature::boolean("x").pooled_under("ghost")],
            vec![],
        );
        assert!(result.is_err());
        assert!(catalog.lookup("keep").is_some());
    }
}
