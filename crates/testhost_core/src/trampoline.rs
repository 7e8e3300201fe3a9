//! The progress seam between the isolated context and the caller.

use serde_json::Value;

/// Receives loosely-typed progress from inside an isolated context.
///
/// `progress` carries one fixed-arity record (see [`crate::records`]). Implementations on the caller side
/// re-hydrate it into their own result types; implementations inside the context forward it over the channel.
pub trait SinkTrampoline: Send + Sync {
    fn begin(&self, message: &str);
    fn progress(&self, args: Vec<Value>);
    fn finished(&self, message: &str);
}

impl<T: SinkTrampoline + ?Sized> SinkTrampoline for std::sync::Arc<T> {
    fn begin(&self, message: &str) {
        (**self).begin(message)
    }

    fn progress(&self, args: Vec<Value>) {
        (**self).progress(args)
    }

    fn finished(&self, message: &str) {
        (**self).finished(message)
    }
}
