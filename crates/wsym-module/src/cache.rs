//! `ModuleCache`: spec.md §4.5, including the deliberately-preserved
//! asymmetry between URL-loaded and inline-loaded modules' content hash.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::module::{resolve_local_module_file, Module};
use crate::types::ModuleId;

/// A loaded module plus, for inline-loaded bytes, the temp file its
/// contents were materialized into (kept alive as long as the cache entry
/// is, and deleted on drop unless `keep_temp_modules` was set).
pub struct CacheEntry {
    pub module: Module,
    pub url: Option<String>,
    _temp_file: Option<NamedTempFile>,
}

pub struct ModuleCache {
    by_id: HashMap<ModuleId, Arc<CacheEntry>>,
    by_hash: HashMap<[u8; 16], ModuleId>,
    search_paths: Vec<PathBuf>,
    keep_temp_modules: bool,
    next_id: AtomicU64,
}

impl ModuleCache {
    pub fn new(search_paths: Vec<PathBuf>, keep_temp_modules: bool) -> Self {
        ModuleCache {
            by_id: HashMap::new(),
            by_hash: HashMap::new(),
            search_paths,
            keep_temp_modules,
            next_id: AtomicU64::new(1),
        }
    }

    /// Loads a module given a URL (resolved against the configured search
    /// paths), hashing the **URL string itself**, not the file's bytes —
    /// matching (not "fixing") the original's asymmetric cache key scheme,
    /// which hashes bytes only for `add_from_bytes`.
    pub fn add_from_url(&mut self, url: &str) -> Result<ModuleId> {
        let hash = md5::compute(url.as_bytes()).0;
        if let Some(existing) = self.by_hash.get(&hash) {
            debug!(url, module_id = existing.0, "module cache hit (by url hash)");
            return Ok(*existing);
        }

        let path = PathBuf::from(url);
        let resolved = resolve_local_module_file(&path, &self.search_paths)
            .with_context(|| format!("could not resolve module url {url}"))?;
        let bytes = std::fs::read(&resolved).with_context(|| format!("reading {}", resolved.display()))?;
        let module = Module::parse(bytes)?;

        let id = self.alloc_id();
        self.by_id.insert(
            id,
            Arc::new(CacheEntry {
                module,
                url: Some(url.to_string()),
                _temp_file: None,
            }),
        );
        self.by_hash.insert(hash, id);
        debug!(url, module_id = id.0, "module loaded from url");
        Ok(id)
    }

    /// Loads a module from inline bytes (`addRawModule`'s `code` field),
    /// hashing the **module bytes**, materializing them into a temp file so
    /// later `resolveLocalModuleFile`-style lookups still have a real path
    /// to point at.
    pub fn add_from_bytes(&mut self, bytes: Vec<u8>) -> Result<ModuleId> {
        let hash = md5::compute(&bytes).0;
        if let Some(existing) = self.by_hash.get(&hash) {
            debug!(module_id = existing.0, "module cache hit (by content hash)");
            return Ok(*existing);
        }

        let mut temp_file = NamedTempFile::new().context("creating temp file for inline module")?;
        std::io::Write::write_all(&mut temp_file, &bytes).context("writing inline module to temp file")?;
        let temp_file = if self.keep_temp_modules {
            let (_, path) = temp_file.keep().context("keeping temp module file")?;
            debug!(path = %path.display(), "kept temp module file");
            None
        } else {
            Some(temp_file)
        };

        let module = Module::parse(bytes)?;
        let id = self.alloc_id();
        self.by_id.insert(
            id,
            Arc::new(CacheEntry {
                module,
                url: None,
                _temp_file: temp_file,
            }),
        );
        self.by_hash.insert(hash, id);
        debug!(module_id = id.0, "module loaded from inline bytes");
        Ok(id)
    }

    pub fn find(&self, id: ModuleId) -> Option<Arc<CacheEntry>> {
        self.by_id.get(&id).cloned()
    }

    pub fn delete(&mut self, id: ModuleId) -> bool {
        if let Some(entry) = self.by_id.remove(&id) {
            self.by_hash.retain(|_, v| *v != id);
            warn!(module_id = id.0, "module evicted from cache");
            drop(entry);
            true
        } else {
            false
        }
    }

    pub fn find_modules_containing(&self, filename: &str) -> Vec<ModuleId> {
        self.by_id
            .iter()
            .filter(|(_, entry)| entry.module.source_scripts().iter().any(|s| s.filename == filename))
            .map(|(id, _)| *id)
            .collect()
    }

    fn alloc_id(&self) -> ModuleId {
        ModuleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
