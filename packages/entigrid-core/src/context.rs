//! Explicit application context passed into constructors, replacing any
//! implicit process-wide singleton (config notifier, logger handle, etc).

use std::sync::Arc;

/// Identity and process-wide configuration shared by every component of one
/// running resource process. Cheap to clone (wraps an `Arc` internally via
/// its caller) and threaded explicitly rather than accessed through a
/// global.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Identifier of the resource instance this process serves.
    pub instance_id: Arc<str>,
    /// Root directory under which this instance's storage lives.
    pub storage_root: Arc<std::path::Path>,
}

impl AppContext {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, storage_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            instance_id: Arc::from(instance_id.into().into_boxed_str()),
            storage_root: Arc::from(storage_root.into().into_boxed_path()),
        }
    }

    /// Directory under `storage_root` dedicated to this instance.
    #[must_use]
    pub fn instance_dir(&self) -> std::path::PathBuf {
        self.storage_root.join(&*self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_dir_joins_root_and_id() {
        let ctx = AppContext::new("acct-1", "/var/lib/entigrid");
        assert_eq!(ctx.instance_dir(), std::path::PathBuf::from("/var/lib/entigrid/acct-1"));
    }
}
