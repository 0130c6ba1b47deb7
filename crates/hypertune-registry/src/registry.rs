//! Hypernetwork registry
//!
//! Maps hypernetwork names to files found under a root directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hypertune_net::HYPERNETWORK_EXTENSION;
use thiserror::Error;
use tracing::{debug, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No hypernetwork name given")]
    EmptyName,

    #[error("Hypernetwork not found: {0}")]
    NotFound(String),
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory scanned (recursively) for hypernetwork files
    pub root: PathBuf,
    /// File extension to pick up, without the dot
    pub extension: String,
}

impl RegistryConfig {
    /// Configuration scanning `root` for the default extension
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hypertune")
                .join("hypernetworks"),
            extension: HYPERNETWORK_EXTENSION.to_string(),
        }
    }
}

/// Name → file mapping of available hypernetworks
///
/// Names are file stems, so two files with the same stem in different
/// subdirectories share one name; the later one in path order wins.
pub struct HypernetworkRegistry {
    config: RegistryConfig,
    entries: HashMap<String, PathBuf>,
}

impl HypernetworkRegistry {
    /// Create an empty registry; call [`scan`](Self::scan) to populate it
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Create a registry for `root` and scan it
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new(RegistryConfig::with_root(root));
        registry.scan();
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Rebuild the mapping from disk
    ///
    /// Returns the number of registered names.
    pub fn scan(&mut self) -> usize {
        self.entries.clear();

        let mut files = Vec::new();
        collect_files(&self.config.root, &self.config.extension, &mut files);
        files.sort();

        for path in files {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if let Some(previous) = self.register(name.clone(), path.clone()) {
                warn!(
                    name = %name,
                    previous = %previous.display(),
                    path = %path.display(),
                    "Duplicate hypernetwork name, later file wins"
                );
            }
        }

        debug!(
            root = %self.config.root.display(),
            count = self.entries.len(),
            "Scanned hypernetworks"
        );
        self.entries.len()
    }

    /// Register a file under `name`, returning the path it replaced
    pub fn register(
        &mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Option<PathBuf> {
        self.entries.insert(name.into(), path.into())
    }

    /// Path for a name
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(PathBuf::as_path)
    }

    /// Path for a name, as an error when missing
    pub fn resolve(&self, name: &str) -> Result<&Path, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Check if a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All entries, sorted by name
    pub fn list(&self) -> Vec<(&str, &Path)> {
        let mut entries: Vec<(&str, &Path)> = self
            .entries
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
            .collect();
        entries.sort_unstable_by_key(|(name, _)| *name);
        entries
    }

    /// Find the best name containing `search` (case-insensitive)
    ///
    /// The shortest matching name wins; ties go to the alphabetically first.
    /// Returns `None` for an empty search term or when nothing matches.
    pub fn find_closest_name(&self, search: &str) -> Option<&str> {
        if search.is_empty() {
            return None;
        }

        let search = search.to_lowercase();
        self.entries
            .keys()
            .filter(|name| name.to_lowercase().contains(&search))
            .min_by(|a, b| a.chars().count().cmp(&b.chars().count()).then_with(|| a.cmp(b)))
            .map(String::as_str)
    }

    /// Where a hypernetwork called `name` is stored under the root
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.config
            .root
            .join(format!("{}.{}", name, self.config.extension))
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HypernetworkRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Recursively collect files with `extension` below `dir`
fn collect_files(dir: &Path, extension: &str, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "Skipping unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, extension, found);
        } else if path.extension().is_some_and(|ext| ext == extension) {
            found.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_with(names: &[&str]) -> HypernetworkRegistry {
        let mut registry = HypernetworkRegistry::new(RegistryConfig::with_root("/test"));
        for name in names {
            registry.register(*name, format!("/test/{name}.safetensors"));
        }
        registry
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_find_closest_prefers_shortest() {
        let registry = registry_with(&["cat_v2", "cat", "bigcat"]);
        assert_eq!(registry.find_closest_name("cat"), Some("cat"));
    }

    #[test]
    fn test_find_closest_case_insensitive() {
        let registry = registry_with(&["AnimeStyle_v3", "Anime"]);
        assert_eq!(registry.find_closest_name("ANIME"), Some("Anime"));
        assert_eq!(registry.find_closest_name("style"), Some("AnimeStyle_v3"));
    }

    #[test]
    fn test_find_closest_nothing() {
        let registry = registry_with(&["cat"]);
        assert_eq!(registry.find_closest_name(""), None);
        assert_eq!(registry.find_closest_name("dog"), None);

        let empty = registry_with(&[]);
        assert_eq!(empty.find_closest_name("cat"), None);
    }

    #[test]
    fn test_find_closest_tie_is_alphabetical() {
        let registry = registry_with(&["cat_b", "cat_a"]);
        assert_eq!(registry.find_closest_name("cat"), Some("cat_a"));
    }

    #[test]
    fn test_scan_recursive_by_extension() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("anime.safetensors"));
        touch(&root.join("styles/painterly.safetensors"));
        touch(&root.join("styles/deep/ink.safetensors"));
        touch(&root.join("notes.txt"));

        let mut registry = HypernetworkRegistry::new(RegistryConfig::with_root(root));
        assert_eq!(registry.scan(), 3);
        assert_eq!(registry.names(), vec!["anime", "ink", "painterly"]);
        assert_eq!(
            registry.get("ink"),
            Some(root.join("styles/deep/ink.safetensors").as_path())
        );
        assert!(!registry.contains("notes"));
    }

    #[test]
    fn test_scan_duplicate_names_later_path_wins() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("a/style.safetensors"));
        touch(&root.join("b/style.safetensors"));

        let registry = HypernetworkRegistry::open(root);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("style"),
            Some(root.join("b/style.safetensors").as_path())
        );
    }

    #[test]
    fn test_scan_missing_root() {
        let mut registry =
            HypernetworkRegistry::new(RegistryConfig::with_root("/nonexistent/hypernetworks"));
        assert_eq!(registry.scan(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve() {
        let registry = registry_with(&["cat"]);
        assert!(registry.resolve("cat").is_ok());
        assert!(matches!(registry.resolve(""), Err(RegistryError::EmptyName)));
        assert!(matches!(registry.resolve("dog"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_output_path() {
        let registry = registry_with(&[]);
        assert_eq!(
            registry.output_path("cat"),
            PathBuf::from("/test/cat.safetensors")
        );
    }
}
