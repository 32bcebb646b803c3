/// Lane order files (`_order.json`).
///
/// The order file is authoritative for display order. Directory enumeration
/// is only used to find files the order file does not mention yet; those are
/// appended alphabetically. Entries naming files that no longer exist are
/// dropped when reading.
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;

use crate::types::CARD_EXTENSION;

/// Read an order file. A missing file is an empty order; an unparsable one is
/// logged and treated as empty so the lane stays listable.
pub async fn read_order_file(path: &Path) -> Result<Vec<String>, std::io::Error> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str::<Vec<String>>(&content) {
            Ok(order) => Ok(order),
            Err(e) => {
                log::warn!(
                    "[markban.order.read] Ignoring malformed order file {:?}: {}",
                    path,
                    e
                );
                Ok(Vec::new())
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Whether a directory entry name is a card file.
pub fn is_card_filename(name: &str) -> bool {
    !name.starts_with('.')
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext.to_str() == Some(CARD_EXTENSION))
        && name.len() > CARD_EXTENSION.len() + 1
}

/// Card filenames present in a lane directory, sorted. A missing directory is
/// an empty lane.
pub async fn list_card_files(dir: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_card_filename(&name) {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// Listed files that exist, in listed order, then unlisted files
/// alphabetically. `files` must be sorted.
pub fn resolve_order(order: &[String], files: &[String]) -> Vec<String> {
    let present: HashSet<&str> = files.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(files.len());
    let mut resolved = Vec::with_capacity(files.len());

    for name in order {
        if present.contains(name.as_str()) && seen.insert(name.as_str()) {
            resolved.push(name.clone());
        }
    }
    for name in files {
        if seen.insert(name.as_str()) {
            resolved.push(name.clone());
        }
    }
    resolved
}

/// Build the order for an explicit reorder request. Every requested name must
/// exist in `files`; the first one that does not is returned as the error.
pub fn apply_explicit_order(explicit: &[String], files: &[String]) -> Result<Vec<String>, String> {
    let present: HashSet<&str> = files.iter().map(String::as_str).collect();
    if let Some(missing) = explicit.iter().find(|name| !present.contains(name.as_str())) {
        return Err(missing.clone());
    }
    Ok(resolve_order(explicit, files))
}

/// Insert `filename` at `position` (clamped to the end), removing any
/// existing occurrence first.
pub fn insert_at(order: &mut Vec<String>, filename: &str, position: Option<usize>) {
    order.retain(|name| name != filename);
    match position {
        Some(pos) if pos <= order.len() => order.insert(pos, filename.to_string()),
        _ => order.push(filename.to_string()),
    }
}
