//! Assembly identities, manifests and the dependency table.
//!
//! An assembly is a file on disk. Its strong identity and its declared references live in a sidecar
//! manifest (`<assembly path>.manifest.json`) so they can be read without activating the assembly.
//!
//! ## Full names
//!
//! The canonical identity string is `Name, Version=1.2.3, Culture=neutral, PublicKeyToken=null`. It is the
//! key of the [`DependencyTable`] handed to every isolated context. Name and token comparisons are ASCII
//! case-insensitive, so table keys are normalized through [`AssemblyIdentity::key`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Culture of an assembly that carries no localized resources.
pub const NEUTRAL_CULTURE: &str = "neutral";

/// Version given to assemblies without a manifest.
pub const DEFAULT_VERSION: &str = "0.0.0";

/// Suffix appended to an assembly path to find its manifest.
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Errors raised while reading or parsing identities.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("assembly name is empty")]
    EmptyName,

    #[error("invalid version '{0}' (expected 1-4 dot-separated numbers)")]
    InvalidVersion(String),

    #[error("malformed identity component '{0}'")]
    MalformedComponent(String),

    #[error("unknown identity attribute '{0}'")]
    UnknownAttribute(String),

    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_culture() -> String {
    NEUTRAL_CULTURE.to_string()
}

/// Strong identity of an assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyIdentity {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_culture")]
    pub culture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_token: Option<String>,
}

impl AssemblyIdentity {
    /// Create a validated identity with neutral culture and no public key token.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, IdentityError> {
        let identity = Self {
            name: name.into(),
            version: version.into(),
            culture: default_culture(),
            public_key_token: None,
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = culture.into();
        self
    }

    pub fn with_public_key_token(mut self, token: impl Into<String>) -> Self {
        self.public_key_token = Some(token.into());
        self
    }

    /// Check the name and version shape.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.name.trim().is_empty() {
            return Err(IdentityError::EmptyName);
        }
        let parts: Vec<&str> = self.version.split('.').collect();
        let numeric = parts.iter().all(|p| !p.is_empty() && p.parse::<u32>().is_ok());
        if parts.is_empty() || parts.len() > 4 || !numeric {
            return Err(IdentityError::InvalidVersion(self.version.clone()));
        }
        Ok(())
    }

    /// The canonical full identity string.
    pub fn full_name(&self) -> String {
        self.to_string()
    }

    /// Normalized full name used as a lookup key.
    pub fn key(&self) -> String {
        self.full_name().to_ascii_lowercase()
    }

    /// Whether this identity has the given short name.
    pub fn has_short_name(&self, short_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(short_name)
    }
}

impl PartialEq for AssemblyIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for AssemblyIdentity {}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, Version={}, Culture={}, PublicKeyToken={}",
            self.name,
            self.version,
            self.culture,
            self.public_key_token.as_deref().unwrap_or("null")
        )
    }
}

impl FromStr for AssemblyIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = s.split(',').map(str::trim);
        let name = components.next().unwrap_or_default();
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }

        let mut identity = Self {
            name: name.to_string(),
            version: default_version(),
            culture: default_culture(),
            public_key_token: None,
        };

        for component in components {
            let Some((key, value)) = component.split_once('=') else {
                return Err(IdentityError::MalformedComponent(component.to_string()));
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "version" => identity.version = value.to_string(),
                "culture" => identity.culture = value.to_string(),
                "publickeytoken" => {
                    identity.public_key_token = (!value.eq_ignore_ascii_case("null")).then(|| value.to_string());
                }
                other => return Err(IdentityError::UnknownAttribute(other.to_string())),
            }
        }

        identity.validate()?;
        Ok(identity)
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// Identity, declared references and exported contract types of one assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyManifest {
    #[serde(flatten)]
    pub identity: AssemblyIdentity,
    #[serde(default)]
    pub references: Vec<AssemblyIdentity>,
    #[serde(default)]
    pub exports: Vec<String>,
}

impl AssemblyManifest {
    /// Path of the manifest that describes `assembly`.
    pub fn manifest_path(assembly: &Path) -> PathBuf {
        let mut file_name = assembly.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        file_name.push(MANIFEST_SUFFIX);
        assembly.with_file_name(file_name)
    }

    /// Manifest for an assembly that ships without one: identity from the file stem, nothing declared.
    pub fn implicit(assembly: &Path) -> Result<Self, IdentityError> {
        let name = assembly
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or(IdentityError::EmptyName)?;
        Ok(Self {
            identity: AssemblyIdentity::new(name, DEFAULT_VERSION)?,
            references: Vec::new(),
            exports: Vec::new(),
        })
    }

    /// Read the manifest of an existing assembly without touching the assembly's contents.
    pub fn read_for(assembly: &Path) -> Result<Self, IdentityError> {
        if !assembly.is_file() {
            return Err(IdentityError::Io {
                path: assembly.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "assembly file not found"),
            });
        }

        let manifest_path = Self::manifest_path(assembly);
        if !manifest_path.is_file() {
            return Self::implicit(assembly);
        }

        let text = fs::read_to_string(&manifest_path).map_err(|source| IdentityError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Self = serde_json::from_str(&text).map_err(|source| IdentityError::Manifest {
            path: manifest_path,
            source,
        })?;
        manifest.identity.validate()?;
        for reference in &manifest.references {
            reference.validate()?;
        }
        Ok(manifest)
    }

    /// First declared reference with the given short name.
    pub fn find_reference(&self, short_name: &str) -> Option<&AssemblyIdentity> {
        self.references.iter().find(|r| r.has_short_name(short_name))
    }

    pub fn exports_type(&self, type_name: &str) -> bool {
        self.exports.iter().any(|t| t == type_name)
    }
}

// ============================================================================
// Dependency table
// ============================================================================

/// An identity together with the file it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyDescriptor {
    pub identity: AssemblyIdentity,
    pub location: PathBuf,
}

/// Immutable map from full identity string to descriptor.
///
/// Built once by the host from the assemblies it already has and handed to each isolated context at creation
/// time. Cloning shares the underlying map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<AssemblyDescriptor>", into = "Vec<AssemblyDescriptor>")]
pub struct DependencyTable {
    entries: Arc<HashMap<String, AssemblyDescriptor>>,
}

impl DependencyTable {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = AssemblyDescriptor>) -> Self {
        let entries = descriptors.into_iter().map(|d| (d.identity.key(), d)).collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Look up a full identity string.
    pub fn get(&self, full_name: &str) -> Option<&AssemblyDescriptor> {
        self.entries.get(&full_name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<AssemblyDescriptor>> for DependencyTable {
    fn from(descriptors: Vec<AssemblyDescriptor>) -> Self {
        Self::from_descriptors(descriptors)
    }
}

impl From<DependencyTable> for Vec<AssemblyDescriptor> {
    fn from(table: DependencyTable) -> Self {
        let mut descriptors: Vec<AssemblyDescriptor> = table.entries.values().cloned().collect();
        descriptors.sort_by_key(|d| d.identity.key());
        descriptors
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_full_name_format() {
        let identity = AssemblyIdentity::new("Persimmon", "1.2.0").unwrap();
        assert_eq!(
            identity.full_name(),
            "Persimmon, Version=1.2.0, Culture=neutral, PublicKeyToken=null"
        );

        let signed = identity.with_public_key_token("ab12cd34");
        assert!(signed.full_name().ends_with("PublicKeyToken=ab12cd34"));
    }

    #[test]
    fn test_parse_full_name() {
        let identity: AssemblyIdentity = "A, Version=1.0, Culture=en-US, PublicKeyToken=FFEE".parse().unwrap();
        assert_eq!(identity.name, "A");
        assert_eq!(identity.version, "1.0");
        assert_eq!(identity.culture, "en-US");
        assert_eq!(identity.public_key_token.as_deref(), Some("FFEE"));
    }

    #[test]
    fn test_parse_bare_name_uses_defaults() {
        let identity: AssemblyIdentity = "Tests".parse().unwrap();
        assert_eq!(identity.version, DEFAULT_VERSION);
        assert_eq!(identity.culture, NEUTRAL_CULTURE);
        assert!(identity.public_key_token.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!("".parse::<AssemblyIdentity>(), Err(IdentityError::EmptyName)));
        assert!(matches!(
            "A, Version=one".parse::<AssemblyIdentity>(),
            Err(IdentityError::InvalidVersion(_))
        ));
        assert!(matches!(
            "A, Flavor=sweet".parse::<AssemblyIdentity>(),
            Err(IdentityError::UnknownAttribute(_))
        ));
        assert!(matches!(
            "A, Version".parse::<AssemblyIdentity>(),
            Err(IdentityError::MalformedComponent(_))
        ));
    }

    #[test]
    fn test_identity_equality_ignores_case() {
        let a: AssemblyIdentity = "persimmon, Version=1.0.0".parse().unwrap();
        let b: AssemblyIdentity = "Persimmon, Version=1.0.0".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, "Persimmon, Version=2.0.0".parse::<AssemblyIdentity>().unwrap());
    }

    #[test]
    fn test_manifest_path_appends_suffix() {
        let path = AssemblyManifest::manifest_path(Path::new("/tmp/bin/A.dll"));
        assert_eq!(path, PathBuf::from("/tmp/bin/A.dll.manifest.json"));
    }

    #[test]
    fn test_read_manifest_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("A.dll");
        fs::write(&assembly, b"").unwrap();
        fs::write(
            AssemblyManifest::manifest_path(&assembly),
            r#"{"name": "A", "version": "1.0.0", "references": [{"name": "Persimmon", "version": "1.1.0"}]}"#,
        )
        .unwrap();

        let manifest = AssemblyManifest::read_for(&assembly).unwrap();
        assert_eq!(manifest.identity.name, "A");
        let framework = manifest.find_reference("persimmon").unwrap();
        assert_eq!(framework.version, "1.1.0");
        assert!(manifest.exports.is_empty());
    }

    #[test]
    fn test_read_without_manifest_is_implicit() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("Plain.dll");
        fs::write(&assembly, b"").unwrap();

        let manifest = AssemblyManifest::read_for(&assembly).unwrap();
        assert_eq!(manifest.identity.name, "Plain");
        assert_eq!(manifest.identity.version, DEFAULT_VERSION);
        assert!(manifest.references.is_empty());
    }

    #[test]
    fn test_read_missing_assembly_fails() {
        let result = AssemblyManifest::read_for(Path::new("/definitely/not/here.dll"));
        assert!(matches!(result, Err(IdentityError::Io { .. })));
    }

    #[test]
    fn test_dependency_table_lookup_is_case_insensitive() {
        let identity = AssemblyIdentity::new("Support", "2.0.0").unwrap();
        let table = DependencyTable::from_descriptors([AssemblyDescriptor {
            identity: identity.clone(),
            location: PathBuf::from("/opt/support.dll"),
        }]);

        assert_eq!(table.len(), 1);
        let hit = table.get("SUPPORT, Version=2.0.0, Culture=neutral, PublicKeyToken=null").unwrap();
        assert_eq!(hit.identity, identity);
        assert!(table.get("Support, Version=3.0.0, Culture=neutral, PublicKeyToken=null").is_none());
    }

    #[test]
    fn test_dependency_table_serializes_as_list() {
        let table = DependencyTable::from_descriptors([AssemblyDescriptor {
            identity: AssemblyIdentity::new("Support", "2.0.0").unwrap(),
            location: PathBuf::from("/opt/support.dll"),
        }]);
        let json = serde_json::to_value(&table).unwrap();
        assert!(json.is_array());

        let back: DependencyTable = serde_json::from_value(json).unwrap();
        assert!(back.get("Support, Version=2.0.0, Culture=neutral, PublicKeyToken=null").is_some());
    }

    proptest! {
        #[test]
        fn full_name_parses_back(
            name in "[A-Za-z][A-Za-z0-9_.]{0,16}",
            major in 0u32..100, minor in 0u32..100, patch in 0u32..100,
            token in proptest::option::of("[0-9a-f]{16}"),
        ) {
            let mut identity = AssemblyIdentity::new(name, format!("{major}.{minor}.{patch}")).unwrap();
            identity.public_key_token = token;
            let parsed: AssemblyIdentity = identity.full_name().parse().unwrap();
            prop_assert_eq!(parsed, identity);
        }
    }
}
