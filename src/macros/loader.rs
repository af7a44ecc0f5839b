//! Macro loading and the hot-reloadable macro table.
//!
//! The loader scans a document tree into a name-keyed table, tolerating
//! per-file failures: one bad file never aborts the scan, it just records
//! a [`LoadError`]. Each reload rebuilds the whole table (macros and
//! errors) and publishes it atomically; readers hold an `Arc` snapshot
//! and never observe a partial rebuild.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::macros::include::expand_all;
use crate::macros::model::{MacroDefinition, MacroDocument, Step};
use crate::macros::validate::validate_steps;
use crate::types::{LoadError, Result};

/// Files whose name starts with this prefix are side documents (notes,
/// shared fragments for other tools) and are skipped by the loader.
pub const SIDE_DOCUMENT_PREFIX: &str = "_";

const MACRO_EXTENSION: &str = "json";

/// One immutable load pass: macros keyed by canonical name, plus the load
/// errors recorded along the way.
#[derive(Debug, Default)]
pub struct MacroTable {
    macros: HashMap<String, Arc<MacroDefinition>>,
    errors: Vec<LoadError>,
}

impl MacroTable {
    /// Case-insensitive lookup by canonical name.
    pub fn get(&self, name: &str) -> Option<&Arc<MacroDefinition>> {
        self.macros.get(&name.trim().to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.macros.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn errors(&self) -> &[LoadError] {
        &self.errors
    }
}

#[cfg(test)]
impl MacroTable {
    /// Build a table directly from definitions, bypassing the filesystem.
    pub(crate) fn from_defs(defs: Vec<MacroDefinition>) -> Self {
        Self {
            macros: defs
                .into_iter()
                .map(|def| (def.name.clone(), Arc::new(def)))
                .collect(),
            errors: Vec::new(),
        }
    }
}

/// Shared, hot-reloadable macro table. Rebuilds run under one lock; the
/// finished table is swapped in as a whole and a reload-completed
/// notification fires after publish.
pub struct MacroRegistry {
    root: PathBuf,
    current: RwLock<Arc<MacroTable>>,
    reload_lock: Mutex<()>,
    reload_tx: watch::Sender<u64>,
}

impl MacroRegistry {
    /// Create an empty registry rooted at `root` without scanning.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (reload_tx, _) = watch::channel(0);
        Self {
            root: root.into(),
            current: RwLock::new(Arc::new(MacroTable::default())),
            reload_lock: Mutex::new(()),
            reload_tx,
        }
    }

    /// Create a registry and perform the initial load.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::new(root);
        registry.reload()?;
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the whole table from disk and publish it atomically.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock();

        let table = build_table(&self.root);
        info!(
            root = %self.root.display(),
            macros = table.len(),
            errors = table.errors().len(),
            "Macro table rebuilt"
        );

        *self.current.write() = Arc::new(table);
        self.reload_tx.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// The current published table. Holding the returned snapshot keeps
    /// one consistent load pass alive across an entire invocation.
    pub fn snapshot(&self) -> Arc<MacroTable> {
        self.current.read().clone()
    }

    /// Subscribe to reload-completed notifications (a generation counter
    /// bumped after each publish).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.reload_tx.subscribe()
    }
}

/// Derive the canonical macro name from a path relative to the scan root:
/// extension stripped, separators normalized to `/`, lowercased.
pub fn canonical_name(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if let Some(last) = parts.last_mut() {
        if let Some(stem) = Path::new(last.as_str())
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
        {
            *last = stem;
        }
    }
    parts.join("/").to_ascii_lowercase()
}

fn build_table(root: &Path) -> MacroTable {
    let mut macros: HashMap<String, MacroDefinition> = HashMap::new();
    let mut errors: Vec<LoadError> = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| !e.eq_ignore_ascii_case(MACRO_EXTENSION))
            .unwrap_or(true)
        {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if file_name.starts_with(SIDE_DOCUMENT_PREFIX) {
            debug!(path = %path.display(), "Skipping side document");
            continue;
        }

        let name = canonical_name(root, path);
        match load_file(path, &name) {
            Ok(def) => {
                if macros.contains_key(&name) {
                    errors.push(LoadError {
                        path: path.to_path_buf(),
                        macro_name: name.clone(),
                        message: format!("duplicate macro name '{}'", name),
                    });
                } else {
                    macros.insert(name, def);
                }
            }
            Err(message) => {
                warn!(path = %path.display(), error = %message, "Macro file rejected");
                errors.push(LoadError {
                    path: path.to_path_buf(),
                    macro_name: name,
                    message,
                });
            }
        }
    }

    errors.extend(expand_all(&mut macros));

    MacroTable {
        macros: macros
            .into_iter()
            .map(|(name, def)| (name, Arc::new(def)))
            .collect(),
        errors,
    }
}

fn load_file(path: &Path, name: &str) -> std::result::Result<MacroDefinition, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read file: {}", e))?;
    if content.trim().is_empty() {
        return Err("file is empty".to_string());
    }

    let doc: MacroDocument =
        serde_json::from_str(&content).map_err(|e| format!("parse error: {}", e))?;
    if doc.steps.is_empty() {
        return Err("macro must have at least one step".to_string());
    }

    validate_steps(&doc.steps).map_err(|e| e.message)?;

    let steps: Vec<Step> = doc.steps.iter().filter_map(Step::from_raw).collect();
    // validation guarantees every raw step converts
    debug_assert_eq!(steps.len(), doc.steps.len());

    Ok(MacroDefinition {
        name: name.to_string(),
        source_path: path.to_path_buf(),
        display_name: doc.name,
        description: doc.description,
        timeout: doc.timeout,
        parameters: doc.parameters,
        steps,
    })
}
