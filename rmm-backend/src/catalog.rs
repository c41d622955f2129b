//! Model catalog: discovers GGUF model files on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// File name recognised as the weights of a model stored in its own directory.
pub const MODEL_FILE_NAME: &str = "model.gguf";

/// A model file discoverable on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    /// Unique identifier derived from the directory or file name.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Quantization type parsed from the file name (e.g., "Q4_K_M").
    pub quantization: Option<String>,
    /// Whether the model currently has a loaded instance.
    pub loaded: bool,
}

impl ModelDescriptor {
    fn from_file(name: String, path: PathBuf, size_bytes: u64) -> Self {
        let quantization = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(extract_quantization)
            .or_else(|| extract_quantization(&name));

        Self {
            name,
            path,
            size_bytes,
            quantization,
            loaded: false,
        }
    }

    /// Size in whole mebibytes, as reported by the listing endpoint.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }
}

/// Scan `root_dir` for models.
///
/// Two layouts are recognised:
/// - `<root>/<name>/model.gguf`, named after the directory;
/// - `<root>/<name>.gguf`, named after the file stem.
///
/// Split weights are listed once: only the first shard (`-00001-of-N`) is
/// registered, under its stem without the shard suffix, and later shards are
/// skipped.
///
/// Root-level files are registered last, so on a name collision the root
/// file wins. A missing or unreadable directory yields an empty list.
pub fn scan(root_dir: &Path) -> Vec<ModelDescriptor> {
    let mut models: HashMap<String, ModelDescriptor> = HashMap::new();

    let entries: Vec<PathBuf> = match std::fs::read_dir(root_dir) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => return Vec::new(),
    };

    for dir in entries.iter().filter(|p| p.is_dir()) {
        let weights = dir.join(MODEL_FILE_NAME);
        let Some(size) = file_size(&weights) else {
            continue;
        };
        let Some(name) = dir.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        models.insert(
            name.to_string(),
            ModelDescriptor::from_file(name.to_string(), weights, size),
        );
    }

    for file in entries.iter().filter(|p| is_gguf(p)) {
        let Some(size) = file_size(file) else {
            continue;
        };
        let Some(filename) = file.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        // Skip non-primary shards (e.g., -00002-of-00003.gguf)
        if is_non_primary_shard(filename) {
            continue;
        }

        let name = create_model_id(filename);
        models.insert(name.clone(), ModelDescriptor::from_file(name, file.clone(), size));
    }

    let mut descriptors: Vec<ModelDescriptor> = models.into_values().collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));

    tracing::debug!(
        "Catalog scan of {} found {} models",
        root_dir.display(),
        descriptors.len()
    );

    descriptors
}

fn is_gguf(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("gguf"))
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Check if a filename is a non-primary shard (not the first part of a split model).
fn is_non_primary_shard(filename: &str) -> bool {
    if let Some(pos) = filename.find("-of-") {
        let prefix = &filename[..pos];
        if let Some(dash_pos) = prefix.rfind('-') {
            let shard_num = &prefix[dash_pos + 1..];
            if !shard_num.is_empty()
                && shard_num.chars().all(|c| c.is_ascii_digit())
                && shard_num != "00001"
            {
                return true;
            }
        }
    }
    false
}

/// Model name for a root-level GGUF file: the stem without any shard suffix.
fn create_model_id(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    let clean = match stem.find("-00001-of-") {
        Some(pos) => &stem[..pos],
        None => stem,
    };

    clean.to_string()
}

/// Extract quantization type from a name (e.g., "model-q4_0.gguf" -> "Q4_0").
fn extract_quantization(filename: &str) -> Option<String> {
    // Longer patterns first so "q4_k_m" is not reported as "q4_k".
    let patterns = [
        "q3_k_s", "q3_k_m", "q3_k_l", "q4_k_s", "q4_k_m", "q5_k_s", "q5_k_m", "q2_k", "q6_k",
        "q4_0", "q4_1", "q5_0", "q5_1", "q8_0", "f16", "f32",
    ];

    let lower = filename.to_lowercase();
    patterns
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .map(|pattern| pattern.to_uppercase())
}
