//! Dependency injection for isolated contexts.

use testhost_core::{AssemblyDescriptor, DependencyTable};

use super::loader::ResolveHook;

/// Satisfies failed resolutions from the host's dependency table.
///
/// The table is immutable and shared by reference count, so concurrent resolutions need no locking. Each
/// context owns its own injector.
#[derive(Debug, Clone)]
pub struct AssemblyInjector {
    table: DependencyTable,
}

impl AssemblyInjector {
    pub fn new(table: DependencyTable) -> Self {
        Self { table }
    }
}

impl ResolveHook for AssemblyInjector {
    fn resolve(&self, full_name: &str) -> Option<AssemblyDescriptor> {
        let found = self.table.get(full_name).cloned();
        match &found {
            Some(descriptor) => {
                tracing::debug!(full_name, location = %descriptor.location.display(), "injected dependency")
            }
            None => tracing::trace!(full_name, "dependency not in table; declining"),
        }
        found
    }
}
