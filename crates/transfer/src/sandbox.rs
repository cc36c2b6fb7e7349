use std::path::{Component, Path, PathBuf};

/// Resolves a peer-supplied path against the served `root`.
///
/// The path is normalised lexically: a leading `/` is ignored, `.` is
/// dropped and `..` pops the previous component. Returns `None` if the
/// result would escape `root`, or if the path contains a NUL byte or a
/// drive prefix. An empty path (or `/`) resolves to `root` itself.
///
/// When `root` exists on disk, the deepest existing part of the result is
/// also canonicalised and must stay under the canonical root, so a symlink
/// inside the tree cannot lead outside it.
pub fn resolve_path(root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.contains('\0') {
        return None;
    }
    let trimmed = requested.trim_start_matches(['/', '\\']);

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    if escapes_through_link(root, &resolved) {
        return None;
    }
    Some(resolved)
}

fn escapes_through_link(root: &Path, resolved: &Path) -> bool {
    let Ok(real_root) = root.canonicalize() else {
        return false;
    };
    let Some(existing) = resolved
        .ancestors()
        .take_while(|p| p.starts_with(root))
        .find(|p| p.symlink_metadata().is_ok())
    else {
        return false;
    };
    match existing.canonicalize() {
        Ok(real) => !real.starts_with(&real_root),
        // Dangling link.
        Err(_) => true,
    }
}

/// Path of `path` relative to `root`, using `/` separators, for listings
/// and log lines. Falls back to the full path when outside `root`.
pub fn display_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => {
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            format!("/{}", parts.join("/"))
        }
        Err(_) => path.display().to_string(),
    }
}
