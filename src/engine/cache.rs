//! In-memory object cache keyed by module identity.

use std::fs;
use std::path::Path;

use hashbrown::HashMap;
use log::{debug, info};

use crate::core::error::{EngineError, EngineResult};

/// Compiled object files by module name.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: HashMap<String, Vec<u8>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a copy of the object compiled for `module`.
    pub fn notify_object_compiled(&mut self, module: &str, object: &[u8]) {
        debug!("caching {} bytes of object code for {}", object.len(), module);
        self.objects.insert(module.to_string(), object.to_vec());
    }

    /// Copy of the cached object for `module`.
    pub fn get_object(&self, module: &str) -> Option<Vec<u8>> {
        self.objects.get(module).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Write the single cached object verbatim to `path`.
    pub fn dump_to_object_file(&self, path: &Path) -> EngineResult<()> {
        let mut objects = self.objects.values();
        match (objects.next(), objects.next()) {
            (Some(object), None) => {
                fs::write(path, object)?;
                info!("dumped object code to {}", path.display());
                Ok(())
            }
            (None, _) => Err(EngineError::Cache("no object in cache".into())),
            (Some(_), Some(_)) => Err(EngineError::Cache(format!(
                "expected exactly one object, found {}",
                self.objects.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_returns_copy() {
        let mut cache = ObjectCache::new();
        assert!(cache.get_object("m").is_none());
        cache.notify_object_compiled("m", &[1, 2, 3]);
        assert_eq!(cache.get_object("m"), Some(vec![1, 2, 3]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_dump_requires_exactly_one_entry() {
        let dir = std::env::temp_dir().join(format!("arrayjit-cache-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("module.o");

        let mut cache = ObjectCache::new();
        assert!(matches!(cache.dump_to_object_file(&path), Err(EngineError::Cache(_))));

        cache.notify_object_compiled("a", b"\x7fELF");
        cache.dump_to_object_file(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"\x7fELF");

        cache.notify_object_compiled("b", b"other");
        assert!(matches!(cache.dump_to_object_file(&path), Err(EngineError::Cache(_))));
        fs::remove_dir_all(&dir).unwrap();
    }
}
