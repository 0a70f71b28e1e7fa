use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

/// Mode applied to extracted request trees so container tasks can write into
/// them regardless of the container user.
pub const REQUEST_TREE_MODE: u32 = 0o777;

fn process_ids() -> (u32, u32) {
    // Safety: getuid/getgid cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// Walk `path` and set `mode` on every entry owned by the current process
/// user and group. Entries owned by anyone else are left alone; the engine
/// never elevates.
pub fn change_permissions_recursive(path: &Path, mode: u32) {
    let (uid, gid) = process_ids();
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "walk failed while normalizing permissions");
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "stat failed while normalizing permissions");
                continue;
            }
        };
        if meta.uid() != uid || meta.gid() != gid {
            continue;
        }
        if let Err(e) = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode)) {
            warn!(path = %entry.path().display(), error = %e, "chmod failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_mode_on_owned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("inner");
        fs::create_dir(&sub).unwrap();
        let file = sub.join("data.txt");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        change_permissions_recursive(dir.path(), REQUEST_TREE_MODE);

        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, REQUEST_TREE_MODE);
        let dir_mode = fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, REQUEST_TREE_MODE);
    }
}
