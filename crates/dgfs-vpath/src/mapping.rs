//! User-supplied path mapping configuration.

use dgfs_error::{DgfsError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

/// What kind of remote resource a mapping points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingResourceType {
    File,
    #[default]
    Dir,
}

impl<'de> Deserialize<'de> for MappingResourceType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "" | "dir" => Ok(Self::Dir),
            "file" => Ok(Self::File),
            other => Err(serde::de::Error::custom(format!(
                "invalid resource type: {other}"
            ))),
        }
    }
}

/// One mapping between a remote path and a virtual mount-side path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VPathMapping {
    /// Absolute path on the remote store.
    pub remote_path: String,
    /// Absolute virtual path the remote entry appears under.
    pub mapping_path: String,
    #[serde(default)]
    pub resource_type: MappingResourceType,
    #[serde(default)]
    pub read_only: bool,
    /// Create the remote collection at build time when missing. Only
    /// meaningful for directory mappings.
    #[serde(default)]
    pub create_dir: bool,
    /// Skip the mapping silently when the remote entry does not exist.
    #[serde(default)]
    pub ignore_not_exist: bool,
}

impl VPathMapping {
    pub fn validate(&self) -> Result<()> {
        if !self.remote_path.starts_with('/') {
            return Err(DgfsError::InvalidMapping(format!(
                "remote path {} is not absolute",
                self.remote_path
            )));
        }
        if !self.mapping_path.starts_with('/') {
            return Err(DgfsError::InvalidMapping(format!(
                "mapping path {} is not absolute",
                self.mapping_path
            )));
        }
        Ok(())
    }
}

/// Validate a full mapping list: each entry well-formed, mapping paths
/// unique, list non-empty.
pub fn validate_mappings(mappings: &[VPathMapping]) -> Result<()> {
    if mappings.is_empty() {
        return Err(DgfsError::InvalidMapping(
            "no virtual path mapping is given".to_owned(),
        ));
    }

    let mut seen = HashSet::new();
    for mapping in mappings {
        mapping.validate()?;
        if !seen.insert(mapping.mapping_path.as_str()) {
            return Err(DgfsError::InvalidMapping(format!(
                "mapping path {} is used by another mapping",
                mapping.mapping_path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(remote: &str, vpath: &str) -> VPathMapping {
        VPathMapping {
            remote_path: remote.to_owned(),
            mapping_path: vpath.to_owned(),
            resource_type: MappingResourceType::Dir,
            read_only: false,
            create_dir: false,
            ignore_not_exist: false,
        }
    }

    #[test]
    fn valid_list_passes() {
        let mappings = vec![mapping("/zone/a", "/a"), mapping("/zone/b", "/b")];
        validate_mappings(&mappings).unwrap();
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(mapping("zone/a", "/a").validate().is_err());
        assert!(mapping("/zone/a", "a").validate().is_err());
    }

    #[test]
    fn duplicate_mapping_paths_are_rejected() {
        let mappings = vec![mapping("/zone/a", "/same"), mapping("/zone/b", "/same")];
        assert!(matches!(
            validate_mappings(&mappings),
            Err(DgfsError::InvalidMapping(_))
        ));
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(validate_mappings(&[]).is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let parsed: Vec<VPathMapping> = serde_json::from_str(
            r#"[
                {"remote_path": "/zone/data", "mapping_path": "/data"},
                {"remote_path": "/zone/f.txt", "mapping_path": "/files/f.txt",
                 "resource_type": "file", "read_only": true}
            ]"#,
        )
        .unwrap();

        assert_eq!(parsed[0].resource_type, MappingResourceType::Dir);
        assert!(!parsed[0].read_only);
        assert_eq!(parsed[1].resource_type, MappingResourceType::File);
        assert!(parsed[1].read_only);
    }

    #[test]
    fn empty_resource_type_means_dir() {
        let parsed: VPathMapping = serde_json::from_str(
            r#"{"remote_path": "/z", "mapping_path": "/v", "resource_type": ""}"#,
        )
        .unwrap();
        assert_eq!(parsed.resource_type, MappingResourceType::Dir);
    }
}
