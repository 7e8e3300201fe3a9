//! The assemblies the host already has, offered to every context through its dependency table.

use std::fs;
use std::path::{Path, PathBuf};

use testhost_core::identity::MANIFEST_SUFFIX;
use testhost_core::{AssemblyDescriptor, AssemblyIdentity, AssemblyManifest, DependencyTable};

/// Short name the engine itself is known by.
pub const ENGINE_ASSEMBLY_NAME: &str = "testhost";

/// Directory holding the running engine, when it can be determined.
pub fn engine_directory() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

/// The engine's own identity: its short name and the numeric part of its version.
pub fn engine_identity() -> AssemblyIdentity {
    let version = format!(
        "{}.{}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH")
    );
    AssemblyIdentity {
        name: ENGINE_ASSEMBLY_NAME.to_string(),
        version,
        culture: testhost_core::identity::NEUTRAL_CULTURE.to_string(),
        public_key_token: None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyCatalog {
    descriptors: Vec<AssemblyDescriptor>,
}

impl AssemblyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine itself plus every assembly with a manifest in `directories` and the engine directory.
    pub fn discover(directories: &[PathBuf]) -> Self {
        let mut catalog = Self::new();
        let engine_dir = engine_directory();
        if let Ok(location) = std::env::current_exe() {
            catalog.register(AssemblyDescriptor {
                identity: engine_identity(),
                location,
            });
        }
        for dir in directories.iter().chain(engine_dir.iter()) {
            catalog.scan(dir);
        }
        tracing::debug!(assemblies = catalog.len(), "assembly catalog built");
        catalog
    }

    pub fn register(&mut self, descriptor: AssemblyDescriptor) {
        if self.descriptors.iter().any(|d| d.identity == descriptor.identity) {
            return;
        }
        self.descriptors.push(descriptor);
    }

    /// Register every assembly in `dir` that ships a manifest. Unreadable entries are skipped.
    pub fn scan(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(dir = %dir.display(), %error, "cannot scan supporting directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(assembly_name) = file_name.to_str().and_then(|n| n.strip_suffix(MANIFEST_SUFFIX)) else {
                continue;
            };
            let location = dir.join(assembly_name);
            if !location.is_file() {
                continue;
            }
            match AssemblyManifest::read_for(&location) {
                Ok(manifest) => self.register(AssemblyDescriptor {
                    identity: manifest.identity,
                    location,
                }),
                Err(error) => tracing::warn!(path = %location.display(), %error, "skipping unreadable manifest"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Immutable table for one context.
    pub fn snapshot(&self) -> DependencyTable {
        DependencyTable::from_descriptors(self.descriptors.iter().cloned())
    }
}
