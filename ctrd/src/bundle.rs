//! State directory preparation for containers owned by a remapped root.

use crate::error::Result;
use nix::unistd::{Gid, Uid, chown};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory under which `uid:gid` may create container directories.
///
/// For host root this is the state dir itself. Otherwise every path segment
/// that is missing or not traversable by others is replaced by a sibling
/// `<segment>.<uid>.<gid>` directory owned by the remapped root.
pub async fn prepare_bundle_root(state_dir: &Path, uid: u32, gid: u32) -> Result<PathBuf> {
    let root = std::path::absolute(state_dir)?;
    if uid == 0 && gid == 0 {
        return Ok(root);
    }

    let mut path = PathBuf::from("/");
    for component in root.components() {
        let Component::Normal(segment) = component else {
            continue;
        };
        path.push(segment);

        let traversable = match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o001 != 0
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !traversable {
            let mut remapped = path.into_os_string();
            remapped.push(format!(".{uid}.{gid}"));
            path = PathBuf::from(remapped);
            mkdir_as(&path, uid, gid).await?;
        }
    }
    Ok(path)
}

/// Create `path` with mode 0700 owned by `uid:gid`. Existing directories are kept as is.
pub async fn mkdir_as(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.mode(0o700);
    match builder.create(path).await {
        Ok(()) => {
            debug!(path = %path.display(), uid, gid, "Created directory");
            if Uid::effective().as_raw() != uid || Gid::effective().as_raw() != gid {
                chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create `path` and any missing parents, each owned by `uid:gid`.
pub async fn mkdir_all_as(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let mut missing = Vec::new();
    let mut cur = Some(path);
    while let Some(p) = cur {
        if tokio::fs::try_exists(p).await? {
            break;
        }
        missing.push(p.to_path_buf());
        cur = p.parent();
    }
    for dir in missing.iter().rev() {
        mkdir_as(dir, uid, gid).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_root_uses_state_dir() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("state");
        let root = prepare_bundle_root(&state, 0, 0).await.unwrap();
        assert_eq!(root, state);
    }

    #[tokio::test]
    async fn test_mkdir_all_creates_private_dirs() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        mkdir_all_as(&nested, uid, gid).await.unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // Existing directories are accepted.
        mkdir_all_as(&nested, uid, gid).await.unwrap();
    }

    #[tokio::test]
    async fn test_remapped_segments_for_private_dirs() {
        let tmp = TempDir::new().unwrap();
        let private = tmp.path().join("private");
        std::fs::create_dir(&private).unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(&private, std::fs::Permissions::from_mode(0o700)).unwrap();

        // Use our own ids so the chown is permitted without privileges.
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        if uid == 0 && gid == 0 {
            // Root takes the early return; nothing to remap.
            return;
        }
        let state = private.join("state");
        let root = prepare_bundle_root(&state, uid, gid).await.unwrap();

        let expected = tmp
            .path()
            .join(format!("private.{uid}.{gid}"))
            .join(format!("state.{uid}.{gid}"));
        assert_eq!(root, expected);
        assert!(root.is_dir());
    }
}
