use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use anyhow::{Context, Result, anyhow};
use log::{info, warn};

/// Resolves a municipality to its closing clip
pub trait ClosingClipLookup: Send + Sync {
    /// Path of the configured closing clip, or None when no mapping exists.
    /// The file itself may be missing; callers check.
    fn lookup(&self, municipality: &str) -> Option<PathBuf>;
}

/// Immutable snapshot of both lookup files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupTables {
    pub municipalities: Vec<String>,
    /// `<Name>.mp4` -> closing clip file name
    pub mapping: HashMap<String, String>,
}

impl LookupTables {
    /// Parse both files; a missing or unreadable file is an error, not an empty table
    pub fn load(municipalities_file: &Path, mapping_file: &Path) -> Result<Self> {
        let municipalities = std::fs::read_to_string(municipalities_file)
            .with_context(|| format!("Failed to read municipalities: {}", municipalities_file.display()))?;
        let mapping = std::fs::read_to_string(mapping_file)
            .with_context(|| format!("Failed to read closing clip mapping: {}", mapping_file.display()))?;

        Ok(LookupTables {
            municipalities: parse_municipalities(&municipalities),
            mapping: parse_mapping(&mapping),
        })
    }
}

fn parse_municipalities(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn parse_mapping(text: &str) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(" -> ") {
            Some((original, normalized)) if !original.trim().is_empty() && !normalized.trim().is_empty() => {
                mapping.insert(original.trim().to_string(), normalized.trim().to_string());
            }
            _ => warn!("Ignoring malformed mapping line {}: {}", n + 1, line),
        }
    }
    mapping
}

/// Process-wide catalog of municipalities and closing clips.
///
/// Readers get a shared snapshot; `refresh` swaps in a new one and keeps the old
/// snapshot when the files cannot be read.
pub struct ClosingClipCatalog {
    municipalities_file: PathBuf,
    mapping_file: PathBuf,
    clip_dir: PathBuf,
    tables: RwLock<Arc<LookupTables>>,
}

impl ClosingClipCatalog {
    pub fn load(municipalities_file: &Path, mapping_file: &Path, clip_dir: &Path) -> Result<Self> {
        let tables = LookupTables::load(municipalities_file, mapping_file)?;
        info!("📋 Loaded {} municipalities and {} closing clip mappings",
              tables.municipalities.len(), tables.mapping.len());

        Ok(ClosingClipCatalog {
            municipalities_file: municipalities_file.to_path_buf(),
            mapping_file: mapping_file.to_path_buf(),
            clip_dir: clip_dir.to_path_buf(),
            tables: RwLock::new(Arc::new(tables)),
        })
    }

    /// Re-read both files. Returns true when the tables changed.
    pub fn refresh(&self) -> Result<bool> {
        let fresh = LookupTables::load(&self.municipalities_file, &self.mapping_file)?;
        let mut guard = self.tables.write().map_err(|_| anyhow!("lookup tables lock poisoned"))?;
        if **guard == fresh {
            return Ok(false);
        }
        info!("📋 Lookup tables changed: {} municipalities, {} mappings",
              fresh.municipalities.len(), fresh.mapping.len());
        *guard = Arc::new(fresh);
        Ok(true)
    }

    pub fn snapshot(&self) -> Arc<LookupTables> {
        match self.tables.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn municipalities(&self) -> Vec<String> {
        self.snapshot().municipalities.clone()
    }
}

impl ClosingClipLookup for ClosingClipCatalog {
    fn lookup(&self, municipality: &str) -> Option<PathBuf> {
        let key = format!("{}.mp4", municipality);
        self.snapshot()
            .mapping
            .get(&key)
            .map(|file| self.clip_dir.join(file))
    }
}
