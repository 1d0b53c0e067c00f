//! Scanner: discovers input images, assigns stable page ids, and computes
//! content checksums (spec §4.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};
use crate::model::Page;

const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively enumerates supported images under `root`, sorted by
/// lexicographic path, and assigns each a stable id.
///
/// The id defaults to the file stem; if two files would share an id,
/// each's immediate parent directory name is prepended
/// (`<parent>_<stem>`) to disambiguate. Checksums, when `include_checksums`
/// is set, are SHA-256 of the full file content.
pub fn scan(root: &Path, include_checksums: bool) -> PipelineResult<Vec<Page>> {
    if !root.exists() {
        return Err(PipelineError::RootNotFound { path: root.to_path_buf() });
    }
    if !root.is_dir() {
        return Err(PipelineError::RootNotADirectory { path: root.to_path_buf() });
    }

    let mut paths = Vec::new();
    walk(root, &mut paths)?;
    paths.sort();

    if paths.is_empty() {
        return Err(PipelineError::EmptyCorpus { path: root.to_path_buf() });
    }

    let ids = assign_ids(root, &paths);

    let mut pages = Vec::with_capacity(paths.len());
    for (path, id) in paths.into_iter().zip(ids) {
        let checksum = if include_checksums {
            Some(checksum_of(&path)?)
        } else {
            None
        };
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        pages.push(Page::new(id, filename, path, checksum));
    }

    Ok(pages)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> PipelineResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| PipelineError::UnreadableFile {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PipelineError::UnreadableFile {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if is_supported(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Assigns ids for every path, disambiguating collisions with the parent
/// directory name.
fn assign_ids(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = paths
        .iter()
        .map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_insert(0) += 1;
    }

    paths
        .iter()
        .zip(stems.iter())
        .map(|(path, stem)| {
            if counts.get(stem.as_str()).copied().unwrap_or(0) > 1 {
                let parent_name = path
                    .parent()
                    .and_then(|p| p.strip_prefix(root).ok().or(Some(p)))
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "root".to_string());
                format!("{parent_name}_{stem}")
            } else {
                stem.clone()
            }
        })
        .collect()
}

fn checksum_of(path: &Path) -> PipelineResult<String> {
    let bytes = std::fs::read(path).map_err(|source| PipelineError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
