//! Shared helpers for object-store backends.

use muninn_core::{Error, Result};
use std::path::{Path, PathBuf};

/// Join non-empty key segments with `/`.
pub fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Files to upload for a product, as `(local path, object key)` pairs, plus
/// the directory keys making the hierarchy observable.
///
/// A non-enclosed product maps its single path onto the product key itself;
/// an enclosed product nests each part under the product key.
pub fn collect_upload_entries(
    paths: &[PathBuf],
    product_key: &str,
    use_enclosing_directory: bool,
) -> Result<(Vec<(PathBuf, String)>, Vec<String>)> {
    let mut files = Vec::new();
    let mut directories = Vec::new();

    if use_enclosing_directory {
        directories.push(product_key.to_string());
        for path in paths {
            let name = file_name(path)?;
            walk(
                path,
                &join_key(&[product_key, name.as_str()]),
                &mut files,
                &mut directories,
            )?;
        }
    } else {
        walk(&paths[0], product_key, &mut files, &mut directories)?;
    }
    Ok((files, directories))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Storage(format!("invalid source path: {}", path.display())))
}

fn walk(
    path: &Path,
    key: &str,
    files: &mut Vec<(PathBuf, String)>,
    directories: &mut Vec<String>,
) -> Result<()> {
    if path.is_dir() {
        directories.push(key.to_string());
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| Error::Storage(format!("cannot list '{}': {e}", path.display())))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::Storage(e.to_string()))?;
        entries.sort();
        for entry in entries {
            let name = file_name(&entry)?;
            walk(&entry, &join_key(&[key, name.as_str()]), files, directories)?;
        }
        Ok(())
    } else if path.is_file() {
        files.push((path.to_path_buf(), key.to_string()));
        Ok(())
    } else {
        Err(Error::Storage(format!(
            "path does not refer to a regular file or directory: {}",
            path.display()
        )))
    }
}

/// Local target path for a downloaded object, from its key relative to the
/// product key. Rejects keys that would escape the target directory.
pub fn target_path(target_dir: &Path, relative_key: &str) -> Result<PathBuf> {
    let mut path = target_dir.to_path_buf();
    for segment in relative_key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::Storage(format!(
                "unsafe object key segment: \"{relative_key}\""
            )));
        }
        path.push(segment);
    }
    Ok(path)
}
