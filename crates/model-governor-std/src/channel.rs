// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Mapping from a channel name to the Unix socket the service listens on.

use std::path::{Path, PathBuf};

/// Directory, under the runtime dir, holding every governor socket.
pub const SOCKET_SUBDIR: &str = "model-governor";

/// Resolve `channel_name` to a socket path.
///
/// A name containing a path separator is taken as a literal path.  Otherwise
/// the socket lives at:
///
/// 1. `$XDG_RUNTIME_DIR/model-governor/<name>.sock` if `XDG_RUNTIME_DIR` is set
/// 2. `<temp dir>/model-governor/<name>.sock` as fallback
///
/// # Examples
///
/// ```rust
/// use model_governor_std::channel::socket_path;
///
/// assert_eq!(socket_path("/run/gov.sock").to_str(), Some("/run/gov.sock"));
/// assert!(socket_path("model-governor").ends_with("model-governor/model-governor.sock"));
/// ```
pub fn socket_path(channel_name: &str) -> PathBuf {
    if channel_name.contains(std::path::MAIN_SEPARATOR) {
        return PathBuf::from(channel_name);
    }
    let base = std::env::var_os("XDG_RUNTIME_DIR").map_or_else(std::env::temp_dir, PathBuf::from);
    base.join(SOCKET_SUBDIR).join(format!("{channel_name}.sock"))
}

/// Create the socket's parent directory if it is missing.
///
/// Existing directories are left as they are.  Newly created ones are
/// restricted to the owner.
pub fn ensure_parent_dir(socket: &Path) -> std::io::Result<()> {
    let Some(parent) = socket.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_parent_only() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nested").join("gov.sock");
        ensure_parent_dir(&socket).unwrap();
        assert!(socket.parent().unwrap().is_dir());
        assert!(!socket.exists());
    }
}
