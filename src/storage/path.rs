use std::path::PathBuf;

use super::StorageError;

/// Resolves `~/` and `$HOME` prefixes against the process environment.
pub fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let home = || std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable);

    if let Some(rest) = raw_path.strip_prefix("~/") {
        return Ok(PathBuf::from(home()?).join(rest));
    }

    if raw_path == "~" || raw_path == "$HOME" {
        return Ok(PathBuf::from(home()?));
    }

    if let Some(rest) = raw_path.strip_prefix("$HOME/") {
        return Ok(PathBuf::from(home()?).join(rest));
    }

    Ok(PathBuf::from(raw_path))
}
