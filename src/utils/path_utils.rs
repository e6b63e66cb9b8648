use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) and `$VAR` references in a path string.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    shellexpand::full(path_str)
        .map(|cow_str| PathBuf::from(cow_str.as_ref()))
        .map_err(|e| AppError::InvalidPath(format!("Failed to expand path '{}': {}", path_str, e)))
}

/// Produces the key form of a working directory: absolute, `.`/`..` folded,
/// canonicalized when the directory exists.
pub fn normalize_cwd(path: &Path) -> Result<PathBuf, AppError> {
    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut components = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            _ => components.push(component),
        }
    }
    let folded: PathBuf = components.iter().collect();
    if folded.as_os_str().is_empty() {
        return Err(AppError::InvalidPath(format!("Empty working directory: {}", path.display())));
    }

    // dunce keeps Windows paths free of the \\?\ prefix
    match dunce::canonicalize(&folded) {
        Ok(canonical_path) => Ok(canonical_path),
        Err(e) => {
            debug!(path = %folded.display(), error = %e, "Working directory could not be canonicalized");
            Ok(folded)
        }
    }
}

/// Compares two working directories after normalization.
pub fn same_cwd(a: &Path, b: &Path) -> bool {
    match (normalize_cwd(a), normalize_cwd(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
