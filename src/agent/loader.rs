//! Assembly loading inside an isolated context.
//!
//! Two entry points mirror the two load modes a context supports:
//!
//! - [`AssemblyLoader::preload`] inspects an assembly by path, reading only its manifest. The result is cached
//!   per path so the path based inspection happens once.
//! - [`AssemblyLoader::load`] activates an assembly by full identity. The application base is searched first; on a
//!   miss every installed [`ResolveHook`] is asked in turn.
//!
//! Activation goes through the shadow-copy cache when the assembly lives in one of the shadow-copy directories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use testhost_core::{AssemblyDescriptor, AssemblyIdentity, AssemblyManifest, IdentityError};
use thiserror::Error;

/// File name suffixes searched under the application base, in order.
pub const SEARCH_SUFFIXES: [&str; 5] = ["", ".dll", ".exe", ".so", ".dylib"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(
        "could not load assembly '{full_name}': no candidate under '{}' and no resolver supplied it",
        base.display()
    )]
    NotFound { full_name: String, base: PathBuf },

    #[error("'{}' was resolved for '{requested}' but identifies as '{found}'", location.display())]
    IdentityMismatch {
        requested: String,
        found: String,
        location: PathBuf,
    },

    #[error("could not shadow-copy '{}': {source}", path.display())]
    ShadowCopy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("assembly inspection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Consulted when an assembly cannot be found under the application base.
pub trait ResolveHook: Send + Sync {
    /// Supply a descriptor for `full_name`, or decline with `None`.
    fn resolve(&self, full_name: &str) -> Option<AssemblyDescriptor>;
}

/// An activated assembly.
#[derive(Debug, Clone)]
pub struct LoadedAssembly {
    pub manifest: Arc<AssemblyManifest>,
    /// Where the assembly was found.
    pub location: PathBuf,
    /// What is actually executed: `location` or its shadow copy.
    pub image: PathBuf,
}

impl LoadedAssembly {
    pub fn identity(&self) -> &AssemblyIdentity {
        &self.manifest.identity
    }

    pub fn full_name(&self) -> String {
        self.manifest.identity.full_name()
    }
}

/// Per-context shadow-copy cache. Removed from disk when dropped.
#[derive(Debug)]
pub struct ShadowCopy {
    cache: TempDir,
    directories: Vec<PathBuf>,
}

impl ShadowCopy {
    pub fn new(context_name: &str, directories: &[PathBuf]) -> io::Result<Self> {
        let cache = tempfile::Builder::new()
            .prefix(&format!("{context_name}-shadow-"))
            .tempdir()?;
        let directories = directories.iter().map(|d| normalize(d)).collect();
        Ok(Self { cache, directories })
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    fn covers(&self, location: &Path) -> bool {
        location
            .parent()
            .map(normalize)
            .is_some_and(|parent| self.directories.iter().any(|d| *d == parent))
    }

    /// Copy `location` into the cache when covered, returning the path to activate.
    fn activate(&self, location: &Path, identity: &AssemblyIdentity) -> Result<PathBuf, LoadError> {
        if !self.covers(location) {
            return Ok(location.to_path_buf());
        }
        let Some(file_name) = location.file_name() else {
            return Ok(location.to_path_buf());
        };
        // One directory per identity keeps same-named files from different versions apart.
        let slot = self.cache.path().join(format!("{}-{}", identity.name, identity.version));
        let copy = slot.join(file_name);
        let result = fs::create_dir_all(&slot).and_then(|_| fs::copy(location, &copy));
        result.map_err(|source| LoadError::ShadowCopy {
            path: location.to_path_buf(),
            source,
        })?;
        tracing::debug!(from = %location.display(), to = %copy.display(), "shadow-copied assembly");
        Ok(copy)
    }
}

fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub struct AssemblyLoader {
    application_base: PathBuf,
    shadow: Option<ShadowCopy>,
    hooks: Vec<Arc<dyn ResolveHook>>,
    inspected: Mutex<HashMap<PathBuf, Arc<AssemblyManifest>>>,
    loaded: Mutex<HashMap<String, Arc<LoadedAssembly>>>,
}

impl AssemblyLoader {
    pub fn new(application_base: impl Into<PathBuf>) -> Self {
        Self {
            application_base: application_base.into(),
            shadow: None,
            hooks: Vec::new(),
            inspected: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_shadow_copy(mut self, shadow: ShadowCopy) -> Self {
        self.shadow = Some(shadow);
        self
    }

    /// Install a resolver consulted after probing fails.
    pub fn with_resolve_hook(mut self, hook: Arc<dyn ResolveHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Inspect an assembly by path without activating it.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub async fn preload(&self, path: &Path) -> Result<Arc<AssemblyManifest>, LoadError> {
        let key = normalize(path);
        let cached = self.lock_inspected().get(&key).cloned();
        if let Some(manifest) = cached {
            return Ok(manifest);
        }

        let owned = key.clone();
        let manifest = tokio::task::spawn_blocking(move || AssemblyManifest::read_for(&owned)).await??;
        let manifest = Arc::new(manifest);
        tracing::debug!(identity = %manifest.identity, "inspected assembly");

        // A racing inspection of the same path keeps the first entry.
        let mut inspected = self.lock_inspected();
        Ok(inspected.entry(key).or_insert(manifest).clone())
    }

    /// Activate an assembly by full identity.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn load(&self, identity: &AssemblyIdentity) -> Result<Arc<LoadedAssembly>, LoadError> {
        let key = identity.key();
        let cached = self.lock_loaded().get(&key).cloned();
        if let Some(assembly) = cached {
            return Ok(assembly);
        }

        let (location, manifest) = match self.search(identity).await {
            Some(found) => found,
            None => self.resolve_with_hooks(identity).await?,
        };

        let image = match &self.shadow {
            Some(shadow) => shadow.activate(&location, identity)?,
            None => location.clone(),
        };
        let assembly = Arc::new(LoadedAssembly {
            manifest,
            location,
            image,
        });
        tracing::debug!(image = %assembly.image.display(), "activated assembly");

        let mut loaded = self.lock_loaded();
        Ok(loaded.entry(key).or_insert(assembly).clone())
    }

    /// Look for `identity` among inspected assemblies under the base, then by file name.
    async fn search(&self, identity: &AssemblyIdentity) -> Option<(PathBuf, Arc<AssemblyManifest>)> {
        let base = normalize(&self.application_base);
        let inspected = self
            .lock_inspected()
            .iter()
            .find(|(path, manifest)| path.parent() == Some(base.as_path()) && manifest.identity == *identity)
            .map(|(path, manifest)| (path.clone(), manifest.clone()));
        if inspected.is_some() {
            return inspected;
        }

        for suffix in SEARCH_SUFFIXES {
            let candidate = base.join(format!("{}{suffix}", identity.name));
            if !candidate.is_file() {
                continue;
            }
            match self.preload(&candidate).await {
                Ok(manifest) if manifest.identity == *identity => return Some((candidate, manifest)),
                Ok(manifest) => {
                    tracing::debug!(
                        candidate = %candidate.display(),
                        found = %manifest.identity,
                        "candidate identity mismatch"
                    );
                }
                Err(error) => {
                    tracing::debug!(candidate = %candidate.display(), %error, "candidate unreadable");
                }
            }
        }
        None
    }

    async fn resolve_with_hooks(
        &self,
        identity: &AssemblyIdentity,
    ) -> Result<(PathBuf, Arc<AssemblyManifest>), LoadError> {
        let full_name = identity.full_name();
        for hook in &self.hooks {
            let Some(descriptor) = hook.resolve(&full_name) else {
                continue;
            };
            let manifest = self.preload(&descriptor.location).await?;
            if manifest.identity != *identity {
                return Err(LoadError::IdentityMismatch {
                    requested: full_name,
                    found: manifest.identity.full_name(),
                    location: descriptor.location,
                });
            }
            return Ok((descriptor.location, manifest));
        }
        Err(LoadError::NotFound {
            full_name,
            base: self.application_base.clone(),
        })
    }

    fn lock_inspected(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<AssemblyManifest>>> {
        self.inspected.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_loaded(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<LoadedAssembly>>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }
}
