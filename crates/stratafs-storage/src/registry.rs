//! Registry of filesystem types announced by the user-space server.
//!
//! Each type the server can serve registers here before any volume of that
//! type mounts. The registry is a plain dynamically-sized list behind one
//! mutex; registration traffic is mount-time only.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// A registered filesystem type.
#[derive(Debug, Clone, Serialize)]
pub struct FsType {
    /// Type name, unique within the registry.
    pub name: String,
    /// Table major version the serving process speaks.
    pub major: u16,
    /// Table minor version the serving process speaks.
    pub minor: u16,
}

/// Mutex-guarded list of registered filesystem types.
pub struct FsTypeRegistry {
    inner: Mutex<Vec<Arc<FsType>>>,
}

impl FsTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Registers a filesystem type. Names are unique; a second registration
    /// under the same name fails.
    pub fn register(&self, fs: FsType) -> StorageResult<Arc<FsType>> {
        let mut inner = self.inner.lock();
        if inner.iter().any(|t| t.name == fs.name) {
            warn!("filesystem type {} already registered", fs.name);
            return Err(StorageError::AlreadyRegistered { name: fs.name });
        }
        debug!("registered filesystem type {} v{}.{}", fs.name, fs.major, fs.minor);
        let fs = Arc::new(fs);
        inner.push(Arc::clone(&fs));
        Ok(fs)
    }

    /// Removes a type by name; returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|t| t.name != name);
        let removed = inner.len() != before;
        if removed {
            debug!("unregistered filesystem type {}", name);
        }
        removed
    }

    /// Looks a type up by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<FsType>> {
        self.inner.lock().iter().find(|t| t.name == name).cloned()
    }

    /// Names of every registered type, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FsTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs(name: &str) -> FsType {
        FsType {
            name: name.to_string(),
            major: 1,
            minor: 0,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = FsTypeRegistry::new();
        assert!(registry.is_empty());

        registry.register(fs("strata")).unwrap();
        registry.register(fs("strata-dev")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("strata").unwrap().major, 1);
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.names(), vec!["strata", "strata-dev"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = FsTypeRegistry::new();
        registry.register(fs("strata")).unwrap();
        assert!(matches!(
            registry.register(fs("strata")),
            Err(StorageError::AlreadyRegistered { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = FsTypeRegistry::new();
        registry.register(fs("strata")).unwrap();

        assert!(registry.unregister("strata"));
        assert!(!registry.unregister("strata"));
        assert!(registry.lookup("strata").is_none());

        // Name is free again.
        registry.register(fs("strata")).unwrap();
    }
}
