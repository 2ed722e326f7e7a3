use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Workspace-relative path with `/` separators and no leading `./` or `/`.
/// Traversal out of the workspace is rejected.
pub fn normalize_workspace_rel_path(input: &str) -> Result<String> {
    let mut trimmed = input.trim().replace('\\', "/");
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest.to_string();
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest.to_string();
        } else {
            break;
        }
    }
    let trimmed = trimmed.trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        bail!("path is required");
    }
    validate_rel_path(&trimmed)?;
    Ok(trimmed)
}

fn validate_rel_path(posix: &str) -> Result<()> {
    if posix.split('/').any(|p| p.is_empty() || p == "." || p == "..") {
        bail!("invalid path: {posix}");
    }
    Ok(())
}

pub fn join_inside(root: &Path, rel_posix: &str) -> Result<PathBuf> {
    validate_rel_path(rel_posix)?;

    let mut out = PathBuf::from(root);
    for part in rel_posix.split('/') {
        out.push(part);
    }

    let rel = out.strip_prefix(root).unwrap_or(&out);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        bail!("invalid path: {rel_posix}");
    }
    Ok(out)
}

/// A glob is anything the file search has to answer; plain paths are checked directly.
pub fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}
