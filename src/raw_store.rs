use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::workspace::{self, Workspace};

/// Zero-padded for readability only; ordering always comes from the
/// persisted position, never from these names.
pub fn raw_unit_file_name(position: u64) -> String {
    format!("unit_{position:05}.html")
}

pub fn raw_unit_path(workspace: &Workspace, slug: &str, position: u64) -> PathBuf {
    workspace.raw_dir(slug).join(raw_unit_file_name(position))
}

/// Writes the page atomically and returns its sha256. An existing file for
/// the same position is replaced, since a refetch supersedes it.
pub fn write_raw_unit(path: &Path, html: &str) -> anyhow::Result<String> {
    if html.trim().is_empty() {
        anyhow::bail!("refusing to store empty raw unit: {}", path.display());
    }
    workspace::write_atomic(path, html.as_bytes())
        .with_context(|| format!("write raw unit: {}", path.display()))?;
    Ok(workspace::sha256_hex(html.as_bytes()))
}

pub fn read_raw_unit(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read raw unit: {}", path.display()))
}
