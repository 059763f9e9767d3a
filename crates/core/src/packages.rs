use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    pub name: String,
    pub source_path: PathBuf,
}

/// Lists the packages under `cache_dir`: one per immediate subdirectory,
/// hidden entries skipped, sorted by name.
pub fn list_packages(cache_dir: &Path) -> Result<Vec<PackageRef>> {
    if !cache_dir.is_dir() {
        warn!(
            event = "packages.cache_missing",
            cache_dir = %cache_dir.display(),
            "packages.cache_missing"
        );
        return Ok(Vec::new());
    }

    let mut packages = Vec::new();
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        packages.push(PackageRef {
            name,
            source_path: entry.path(),
        });
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(
        event = "packages.listed",
        cache_dir = %cache_dir.display(),
        count = packages.len(),
        "packages.listed"
    );
    Ok(packages)
}

pub fn default_repository_name(package: Option<&PackageRef>) -> String {
    match package {
        Some(p) if !p.name.is_empty() => format!("{}-backup", p.name),
        _ => "package-backup".to_string(),
    }
}

pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut len = bytes as f64;
    let mut order = 0;
    while len >= 1024.0 && order < UNITS.len() - 1 {
        order += 1;
        len /= 1024.0;
    }
    let text = format!("{len:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text} {}", UNITS[order])
}
