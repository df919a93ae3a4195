//! Plugin manifest parsing and the integrity/policy/capability load
//! sequence (`spec.md` §4.4, §6 "Plugin manifest", §8 testable properties
//! 6–7). Content hashing follows the teacher workspace's general pattern of
//! hashing a canonicalized byte stream with `sha2` before trusting
//! third-party code (seen in `turbomcp`'s DPoP/consent-ticket signing
//! paths), adapted here to hash a whole directory tree instead of a single
//! payload.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use discovery_protocol::schema::build_schema;
use discovery_protocol::types::Tool;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::ServerError;
use crate::registry::ToolRegistry;
use crate::runtime::{SubprocessHandler, ToolHandler};

/// `dependenciesPolicy` values (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[allow(clippy::derivable_impls)]
pub enum DependenciesPolicy {
    /// Only bundled code may run; any `externalDependencies` entry fails load.
    BundledOnly,
    /// The plugin may declare external dependencies.
    ExternalAllowed,
}

impl Default for DependenciesPolicy {
    fn default() -> Self {
        Self::BundledOnly
    }
}

/// One `{path, sha256}` entry in `dist.checksums.files`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChecksum {
    /// Path relative to the plugin's distribution root.
    pub path: String,
    /// Expected sha256 hex digest.
    pub sha256: String,
}

/// The `dist` block of a plugin manifest.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DistBlock {
    /// `sha256:<hex64>` content hash of the whole distribution directory.
    pub hash: Option<String>,
    /// Declared file count, informational only.
    pub file_count: Option<u64>,
    /// Declared total byte count, informational only.
    pub total_bytes: Option<u64>,
    /// Per-file checksums, when the manifest opts into them.
    pub checksums: Option<ChecksumsBlock>,
}

/// `dist.checksums` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChecksumsBlock {
    /// Per-file expected checksums.
    pub files: Vec<FileChecksum>,
}

/// A declared tool/resource/prompt name under `capabilities`.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityEntry {
    /// The declared name.
    pub name: String,
}

/// `capabilities` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CapabilitiesBlock {
    /// Declared tool names.
    #[serde(default)]
    pub tools: Vec<CapabilityEntry>,
    /// Declared resource names.
    #[serde(default)]
    pub resources: Vec<CapabilityEntry>,
    /// Declared prompt names.
    #[serde(default)]
    pub prompts: Vec<CapabilityEntry>,
}

/// A parsed `manifest.json` (`spec.md` §6).
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Manifest schema version; only `"2"` is recognized.
    #[serde(rename = "manifestVersion")]
    pub manifest_version: String,
    /// Plugin identifier, conventionally its directory name.
    pub name: String,
    /// Semver plugin version.
    pub version: String,
    /// Path to the module (relative to the plugin directory) exporting
    /// `createPlugin(server)`.
    pub entry: String,
    /// Integrity metadata.
    #[serde(default)]
    pub dist: DistBlock,
    /// External-dependency policy.
    #[serde(default, rename = "dependenciesPolicy")]
    pub dependencies_policy: DependenciesPolicy,
    /// Declared external dependencies, checked against the policy.
    #[serde(default, rename = "externalDependencies")]
    pub external_dependencies: Vec<String>,
    /// Declared capabilities, checked in strict mode.
    #[serde(default)]
    pub capabilities: CapabilitiesBlock,
}

/// Cached content hash for one plugin directory, keyed by an mtime+size
/// fingerprint so an unchanged tree returns the same hash without
/// re-reading files (`spec.md` §4.4 step 2).
struct HashCacheEntry {
    fingerprint: u64,
    hash: String,
}

/// Computes and caches plugin directory content hashes.
#[derive(Default)]
pub struct ContentHasher {
    cache: Mutex<HashMap<PathBuf, HashCacheEntry>>,
}

impl ContentHasher {
    /// Build an empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `dir`'s contents as `sha256:<hex64>`, matching `dist.hash`'s
    /// format. Files are walked in stable (sorted) order and each
    /// contributes `path\0size\0contentHash` to the running digest
    /// (`spec.md` §4.4 step 2). `manifest.json` itself is excluded: it
    /// declares the hash, so it can't also be an input to it.
    pub fn hash_dir(&self, dir: &Path) -> Result<String, ServerError> {
        let fingerprint = directory_fingerprint(dir)?;
        if let Some(entry) = self.cache.lock().get(dir) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.hash.clone());
            }
        }

        let mut files = list_files_sorted(dir)?;
        files.retain(|f| f.file_name().and_then(|n| n.to_str()) != Some("manifest.json"));
        files.sort();

        let mut digest = Sha256::new();
        for relative in &files {
            let absolute = dir.join(relative);
            let bytes = fs::read(&absolute).map_err(|err| {
                ServerError::internal(format!("reading {}: {err}", absolute.display()))
            })?;
            let file_hash = Sha256::digest(&bytes);
            digest.update(relative.to_string_lossy().as_bytes());
            digest.update(b"\0");
            digest.update(bytes.len().to_string().as_bytes());
            digest.update(b"\0");
            digest.update(hex::encode(file_hash).as_bytes());
        }

        let hash = format!("sha256:{}", hex::encode(digest.finalize()));
        self.cache.lock().insert(
            dir.to_path_buf(),
            HashCacheEntry {
                fingerprint,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }
}

/// Cheap local hex encoder so this crate doesn't need the `hex` crate just
/// for sha256 digests.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn directory_fingerprint(dir: &Path) -> Result<u64, ServerError> {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for relative in list_files_sorted(dir)? {
        if relative.file_name().and_then(|n| n.to_str()) == Some("manifest.json") {
            continue;
        }
        let absolute = dir.join(&relative);
        let meta = fs::metadata(&absolute)
            .map_err(|err| ServerError::internal(format!("stat {}: {err}", absolute.display())))?;
        relative.hash(&mut hasher);
        meta.len().hash(&mut hasher);
        if let Ok(modified) = meta.modified() {
            modified
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .hash(&mut hasher);
        }
    }
    Ok(hasher.finish())
}

fn list_files_sorted(dir: &Path) -> Result<Vec<PathBuf>, ServerError> {
    fn walk(base: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<(), ServerError> {
        let entries = fs::read_dir(current)
            .map_err(|err| ServerError::internal(format!("reading {}: {err}", current.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| ServerError::internal(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out)?;
            } else {
                out.push(path.strip_prefix(base).unwrap_or(&path).to_path_buf());
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

/// Runs the full `spec.md` §4.4 load sequence: manifest validation (steps
/// 1–5), then registering the plugin's declared tools (step 7) and
/// checking the result against its declared capabilities (step 6). Rust
/// has no JS runtime to call a `createPlugin(server)` export in-process, so
/// step 7 is reinterpreted the same way built-in subprocess tools work
/// (`spec.md` §4.5 scenario A): the plugin's `entry` file is invoked as a
/// sandboxed executable per tool call, receiving the tool name and
/// JSON-encoded arguments as argv.
pub struct PluginLoader {
    hasher: ContentHasher,
    strict_capabilities: bool,
}

impl PluginLoader {
    /// `strict_capabilities` enables step 6 (declared-vs-registered tool
    /// match), mirroring `spec.md` §6 `STRICT_CAPABILITIES`.
    #[must_use]
    pub fn new(strict_capabilities: bool) -> Self {
        Self {
            hasher: ContentHasher::new(),
            strict_capabilities,
        }
    }

    /// Parse and validate one plugin directory's manifest, returning the
    /// parsed [`Manifest`] if every check (steps 1–5) passes.
    pub fn validate(&self, plugin_dir: &Path) -> Result<Manifest, ServerError> {
        let manifest_path = plugin_dir.join("manifest.json");
        let raw = fs::read_to_string(&manifest_path).map_err(|err| ServerError::Load {
            plugin_id: plugin_dir.display().to_string(),
            message: format!("reading manifest.json: {err}"),
        })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|err| ServerError::Load {
            plugin_id: plugin_dir.display().to_string(),
            message: format!("parsing manifest.json: {err}"),
        })?;

        if manifest.manifest_version != "2" {
            return Err(ServerError::Load {
                plugin_id: manifest.name.clone(),
                message: format!("unsupported manifestVersion {}", manifest.manifest_version),
            });
        }

        let computed_hash = self.hasher.hash_dir(plugin_dir)?;
        if let Some(declared) = &manifest.dist.hash {
            if declared != &computed_hash {
                return Err(ServerError::Integrity {
                    plugin_id: manifest.name.clone(),
                    message: format!(
                        "declared dist.hash {declared} does not match computed {computed_hash}"
                    ),
                });
            }
        } else {
            return Err(ServerError::Integrity {
                plugin_id: manifest.name.clone(),
                message: "manifest is missing required dist.hash".to_string(),
            });
        }

        if let Some(checksums) = &manifest.dist.checksums {
            let mut seen = std::collections::HashSet::new();
            for entry in &checksums.files {
                if !seen.insert(entry.path.clone()) {
                    return Err(ServerError::Integrity {
                        plugin_id: manifest.name.clone(),
                        message: format!("duplicate checksum entry for {}", entry.path),
                    });
                }
                let file_path = plugin_dir.join(&entry.path);
                let bytes = fs::read(&file_path).map_err(|_| ServerError::Integrity {
                    plugin_id: manifest.name.clone(),
                    message: format!("checksummed file {} does not exist", entry.path),
                })?;
                let actual = hex::encode(Sha256::digest(&bytes));
                if actual != entry.sha256 {
                    return Err(ServerError::Integrity {
                        plugin_id: manifest.name.clone(),
                        message: format!("checksum mismatch for {}", entry.path),
                    });
                }
            }
        }

        if !manifest.external_dependencies.is_empty()
            && manifest.dependencies_policy == DependenciesPolicy::BundledOnly
        {
            return Err(ServerError::Policy {
                plugin_id: manifest.name.clone(),
                message: "externalDependencies declared under bundled-only policy".to_string(),
            });
        }

        Ok(manifest)
    }

    /// Current on-disk content hash for `plugin_dir`, for hot-reload
    /// comparison against a [`LoadedPlugin`]'s recorded hash.
    pub fn content_hash(&self, plugin_dir: &Path) -> Result<String, ServerError> {
        self.hasher.hash_dir(plugin_dir)
    }

    /// Validate `plugin_dir`'s manifest (steps 1–5), register every
    /// declared tool against `registry` (step 7), then check the result
    /// against declared capabilities (step 6). Tools registered during a
    /// failed attempt are rolled back before returning the error.
    pub fn load(&self, plugin_dir: &Path, registry: &ToolRegistry) -> Result<LoadedPlugin, ServerError> {
        let manifest = self.validate(plugin_dir)?;
        let entry_path = plugin_dir.join(&manifest.entry);

        let mut tool_names = Vec::with_capacity(manifest.capabilities.tools.len());
        for declared in &manifest.capabilities.tools {
            let (tool, handler) = plugin_tool(&manifest, &entry_path, &declared.name);
            if let Err(err) = registry.register_tool(tool, Vec::new(), handler, Some(manifest.name.clone())) {
                registry.unregister_plugin_tools(&manifest.name);
                return Err(err);
            }
            tool_names.push(declared.name.clone());
        }

        if let Err(err) = self.check_capability_match(&manifest, &tool_names) {
            registry.unregister_plugin_tools(&manifest.name);
            return Err(err);
        }

        let content_hash = self.hasher.hash_dir(plugin_dir)?;
        Ok(LoadedPlugin {
            manifest,
            tool_names,
            content_hash,
        })
    }

    /// Remove a loaded plugin's tools from `registry` (unload half of
    /// hot-reload, or explicit shutdown).
    pub fn unload(&self, plugin_id: &str, registry: &ToolRegistry) {
        registry.unregister_plugin_tools(plugin_id);
    }

    /// Step 6: in strict mode, every tool a plugin *actually registered*
    /// must have been declared in its manifest capabilities.
    pub fn check_capability_match(
        &self,
        manifest: &Manifest,
        registered_tool_names: &[String],
    ) -> Result<(), ServerError> {
        if !self.strict_capabilities {
            return Ok(());
        }
        let declared: std::collections::HashSet<&str> =
            manifest.capabilities.tools.iter().map(|c| c.name.as_str()).collect();
        for name in registered_tool_names {
            if !declared.contains(name.as_str()) {
                return Err(ServerError::CapabilityMismatch {
                    plugin_id: manifest.name.clone(),
                    message: format!("tool '{name}' registered but not declared in capabilities"),
                });
            }
        }
        Ok(())
    }
}

/// A currently loaded plugin's bookkeeping: which tools it owns, so unload
/// and hot-reload can find them, plus the last-seen content hash used to
/// detect changes for the debounce window.
pub struct LoadedPlugin {
    /// The plugin's manifest at last successful load.
    pub manifest: Manifest,
    /// Names of tools this plugin registered.
    pub tool_names: Vec<String>,
    /// Content hash at load time, to detect on-disk changes for hot-reload.
    pub content_hash: String,
}

/// Tracks loaded plugins for the hot-reload watcher
/// (`spec.md` §4.4 "a failed reload leaves the previous version in place").
#[derive(Default)]
pub struct PluginTable {
    loaded: Mutex<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginTable {
    /// Build an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful load.
    pub fn insert(&self, plugin: LoadedPlugin) {
        self.loaded.lock().insert(plugin.manifest.name.clone(), Arc::new(plugin));
    }

    /// Fetch the currently loaded version of a plugin, if any.
    pub fn get(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.loaded.lock().get(plugin_id).cloned()
    }

    /// Remove a plugin's bookkeeping entry (its tools must be unregistered
    /// from the [`crate::registry::ToolRegistry`] separately).
    pub fn remove(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.loaded.lock().remove(plugin_id)
    }

    /// `true` if the plugin's on-disk content hash differs from what's
    /// currently loaded, signaling a hot-reload is due.
    pub fn needs_reload(&self, plugin_id: &str, current_hash: &str) -> bool {
        match self.get(plugin_id) {
            Some(loaded) => loaded.content_hash != current_hash,
            None => false,
        }
    }
}

/// Build the [`Tool`] descriptor and subprocess handler for one of a
/// plugin's declared tools. All plugin tools currently share one schema
/// (no-argument) since `capabilities.tools` entries in the manifest carry
/// only a bare name, not a parameter list.
fn plugin_tool(manifest: &Manifest, entry_path: &Path, tool_name: &str) -> (Tool, Arc<dyn ToolHandler>) {
    let tool = Tool {
        name: tool_name.to_string(),
        description: format!("tool '{tool_name}' provided by plugin '{}'", manifest.name),
        input_schema: build_schema(&[]),
        category: manifest.name.clone(),
    };
    let program = entry_path.display().to_string();
    let dispatched_tool = tool_name.to_string();
    let handler: Arc<dyn ToolHandler> = Arc::new(SubprocessHandler {
        program,
        argv_builder: Box::new(move |args| {
            let payload = serde_json::to_string(args).map_err(|err| err.to_string())?;
            Ok(vec![dispatched_tool.clone(), payload])
        }),
        timeout_override: None,
    });
    (tool, handler)
}

/// Load every plugin under `plugins_dir` (one subdirectory per plugin).
/// A plugin that fails to load is logged and skipped rather than aborting
/// the rest (`spec.md` §4.4: one bad plugin must not block the others). A
/// missing `plugins_dir` is not an error — it just means no plugins.
pub fn load_all(loader: &PluginLoader, registry: &ToolRegistry, table: &PluginTable, plugins_dir: &Path) {
    let entries = match fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match loader.load(&path, registry) {
            Ok(loaded) => {
                info!(plugin = %loaded.manifest.name, tools = loaded.tool_names.len(), "loaded plugin");
                table.insert(loaded);
            }
            Err(err) => warn!(dir = %path.display(), %err, "plugin failed to load"),
        }
    }
}

/// Debounce window for hot-reload (`spec.md` §4.4 "debounced >= 500ms").
pub const RELOAD_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

/// Spawn a background task that watches `plugins_dir` for on-disk changes
/// and hot-reloads the affected plugin, debounced so a multi-file write
/// doesn't trigger a reload per file (`spec.md` §4.4). A failed reload
/// leaves the previously loaded version registered and serving calls.
pub fn spawn_hot_reload(
    loader: Arc<PluginLoader>,
    registry: Arc<ToolRegistry>,
    table: Arc<PluginTable>,
    plugins_dir: PathBuf,
) {
    use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        Config::default(),
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(%err, "failed to create plugin hot-reload watcher");
            return;
        }
    };

    if let Err(err) = watcher.watch(&plugins_dir, RecursiveMode::Recursive) {
        warn!(%err, dir = %plugins_dir.display(), "failed to watch plugins directory");
        return;
    }

    tokio::spawn(async move {
        let _watcher = watcher; // dropping this stops the watch; keep it alive for the task's lifetime
        let mut pending: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        let mut debounce = tokio::time::interval(RELOAD_DEBOUNCE);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            for path in event.paths {
                                if let Some(plugin_dir) = plugin_root(&plugins_dir, &path) {
                                    pending.insert(plugin_dir);
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = debounce.tick() => {
                    for plugin_dir in pending.drain() {
                        reload_one(&loader, &registry, &table, &plugin_dir);
                    }
                }
            }
        }
    });
}

/// Map a changed file path back to the plugin subdirectory (first path
/// component under `plugins_dir`) that owns it.
fn plugin_root(plugins_dir: &Path, changed: &Path) -> Option<PathBuf> {
    let relative = changed.strip_prefix(plugins_dir).ok()?;
    let first = relative.components().next()?;
    Some(plugins_dir.join(first.as_os_str()))
}

fn reload_one(loader: &PluginLoader, registry: &ToolRegistry, table: &PluginTable, plugin_dir: &Path) {
    let Some(plugin_id) = plugin_dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Some(previous) = table.get(plugin_id) else {
        return; // not a tracked plugin (e.g. a file outside any plugin directory)
    };
    let current_hash = match loader.content_hash(plugin_dir) {
        Ok(hash) => hash,
        Err(_) => return, // directory gone or unreadable; leave the loaded version in place
    };
    if !table.needs_reload(plugin_id, &current_hash) {
        return;
    }

    registry.unregister_plugin_tools(plugin_id);
    match loader.load(plugin_dir, registry) {
        Ok(loaded) => {
            info!(plugin = plugin_id, "hot-reloaded plugin");
            table.insert(loaded);
        }
        Err(err) => {
            warn!(plugin = plugin_id, %err, "hot-reload failed, restoring previous version");
            restore(&previous, plugin_dir, registry);
        }
    }
}

/// Re-register a previous version's tools verbatim after a failed reload
/// attempt, without re-running integrity checks (the on-disk content that
/// just failed validation is not what's being restored into the registry;
/// the previous, already-trusted version's shape is).
fn restore(previous: &LoadedPlugin, plugin_dir: &Path, registry: &ToolRegistry) {
    let entry_path = plugin_dir.join(&previous.manifest.entry);
    for name in &previous.tool_names {
        let (tool, handler) = plugin_tool(&previous.manifest, &entry_path, name);
        if let Err(err) = registry.register_tool(tool, Vec::new(), handler, Some(previous.manifest.name.clone())) {
            warn!(plugin = %previous.manifest.name, tool = %name, %err, "failed to restore tool after reload failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn write_plugin(dir: &Path, entry_body: &str, extra_manifest: &str) -> String {
        fs::write(dir.join("index.js"), entry_body).unwrap();
        let hasher = ContentHasher::new();
        // First hash with a placeholder so the manifest file itself doesn't
        // need to be part of the hashed set (manifest.json is metadata, not
        // distribution content).
        let hash = hasher.hash_dir(dir).unwrap();
        let manifest = format!(
            r#"{{"manifestVersion":"2","name":"demo","version":"1.0.0","entry":"index.js","dist":{{"hash":"{hash}"}}{extra}}}"#,
            extra = extra_manifest
        );
        let mut file = fs::File::create(dir.join("manifest.json")).unwrap();
        file.write_all(manifest.as_bytes()).unwrap();
        hash
    }

    #[test]
    fn valid_manifest_passes() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "module.exports = {}", "");
        let loader = PluginLoader::new(false);
        assert!(loader.validate(dir.path()).is_ok());
    }

    #[test]
    fn tampered_content_fails_integrity_check() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "module.exports = {}", "");
        fs::write(dir.path().join("index.js"), "module.exports = { tampered: true }").unwrap();
        let loader = PluginLoader::new(false);
        let err = loader.validate(dir.path()).unwrap_err();
        assert!(matches!(err, ServerError::Integrity { .. }));
    }

    #[test]
    fn external_dependencies_under_bundled_only_fails_policy() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","externalDependencies":["left-pad"]"#,
        );
        let loader = PluginLoader::new(false);
        let err = loader.validate(dir.path()).unwrap_err();
        assert!(matches!(err, ServerError::Policy { .. }));
    }

    #[test]
    fn external_dependencies_allowed_with_explicit_policy() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","dependenciesPolicy":"external-allowed","externalDependencies":["left-pad"]"#,
        );
        let loader = PluginLoader::new(false);
        assert!(loader.validate(dir.path()).is_ok());
    }

    #[test]
    fn unchanged_tree_hashes_identically() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "x").unwrap();
        let hasher = ContentHasher::new();
        let first = hasher.hash_dir(dir.path()).unwrap();
        let second = hasher.hash_dir(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn load_registers_declared_tools() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","capabilities":{"tools":[{"name":"scanner_probe"}]}"#,
        );
        let loader = PluginLoader::new(false);
        let registry = ToolRegistry::new();
        let loaded = loader.load(dir.path(), &registry).unwrap();
        assert_eq!(loaded.tool_names, vec!["scanner_probe".to_string()]);
        assert!(registry.lookup("scanner_probe").is_some());
    }

    #[test]
    fn unload_removes_registered_tools() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","capabilities":{"tools":[{"name":"scanner_probe"}]}"#,
        );
        let loader = PluginLoader::new(false);
        let registry = ToolRegistry::new();
        loader.load(dir.path(), &registry).unwrap();
        loader.unload("demo", &registry);
        assert!(registry.lookup("scanner_probe").is_none());
    }

    #[test]
    fn strict_capabilities_accepts_declared_tool_registration() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","capabilities":{"tools":[{"name":"scanner_probe"},{"name":"extra_tool"}]}"#,
        );
        let loader = PluginLoader::new(true);
        let registry = ToolRegistry::new();
        let loaded = loader.load(dir.path(), &registry).unwrap();
        assert_eq!(loaded.tool_names.len(), 2);
    }

    #[test]
    fn check_capability_match_rejects_undeclared_tool_in_strict_mode() {
        let dir = tempdir().unwrap();
        write_plugin(
            dir.path(),
            "module.exports = {}",
            r#","capabilities":{"tools":[{"name":"scanner_probe"}]}"#,
        );
        let loader = PluginLoader::new(true);
        let manifest = loader.validate(dir.path()).unwrap();
        let err = loader
            .check_capability_match(&manifest, &["scanner_probe".to_string(), "undeclared".to_string()])
            .unwrap_err();
        assert!(matches!(err, ServerError::CapabilityMismatch { .. }));
    }

    #[test]
    fn needs_reload_reflects_content_change() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "module.exports = {}", "");
        let loader = PluginLoader::new(false);
        let registry = ToolRegistry::new();
        let table = PluginTable::new();
        let loaded = loader.load(dir.path(), &registry).unwrap();
        let plugin_id = loaded.manifest.name.clone();
        table.insert(loaded);

        assert!(!table.needs_reload(&plugin_id, &loader.content_hash(dir.path()).unwrap()));

        fs::write(dir.path().join("index.js"), "module.exports = { v2: true }").unwrap();
        let new_hash = loader.content_hash(dir.path()).unwrap();
        assert!(table.needs_reload(&plugin_id, &new_hash));
    }

    #[test]
    fn reload_one_restores_previous_version_on_failed_reload() {
        // The directory basename must match `manifest.name` (the real
        // on-disk convention `spec.md` §6 assumes): `reload_one` derives the
        // plugin id it looks up in the table from the directory name.
        let root = tempdir().unwrap();
        let plugin_dir = root.path().join("demo");
        fs::create_dir(&plugin_dir).unwrap();
        write_plugin(
            &plugin_dir,
            "module.exports = {}",
            r#","capabilities":{"tools":[{"name":"scanner_probe"}]}"#,
        );
        let loader = PluginLoader::new(false);
        let registry = ToolRegistry::new();
        let table = PluginTable::new();
        let loaded = loader.load(&plugin_dir, &registry).unwrap();
        table.insert(loaded);

        // Corrupt the entry file without updating dist.hash: the next load
        // attempt will fail the integrity check.
        fs::write(plugin_dir.join("index.js"), "tampered").unwrap();

        reload_one(&loader, &registry, &table, &plugin_dir);

        assert!(registry.lookup("scanner_probe").is_some());
    }
}
