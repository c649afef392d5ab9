//! Helpers shared by unit and integration tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{GcConfig, StoreConfig};

/// Small, deterministic configuration rooted at `root`: no background
/// collector, so tests decide when cycles run.
pub fn config_for_tests(root: &Path) -> StoreConfig {
    StoreConfig {
        root_dir: root.to_path_buf(),
        txn_buffer_size: 4 * 1024,
        txn_buffer_count: 64,
        revision_table_count: 64,
        revision_pool_capacity: 1_000_000,
        gc: GcConfig {
            background: false,
            interval_ms: 20,
            collect_on_release: true,
        },
        ..StoreConfig::default()
    }
}

/// Sorted listing of every entry under `root`, one line per entry.
///
/// Directories end in `/`, symlinks show their target. File contents are not
/// included, so rewrites of the mapped metadata files do not show up.
pub fn tree_snapshot(root: &Path) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    walk(root, root, &mut lines)?;
    lines.sort();
    Ok(lines)
}

fn walk(root: &Path, dir: &Path, lines: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = relative_display(root, &path);
        let kind = entry.file_type()?;
        if kind.is_symlink() {
            lines.push(format!("{relative} -> {}", fs::read_link(&path)?.display()));
        } else if kind.is_dir() {
            lines.push(format!("{relative}/"));
            walk(root, &path, lines)?;
        } else {
            lines.push(relative);
        }
    }
    Ok(())
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
