//! Workspace materialization.
//!
//! Writes request file sets into a workspace directory, either wholesale
//! for a fresh build or as a minimal add/modify/delete pass when a cached
//! workspace is being reused. Paths were validated at ingress; they are
//! re-checked here anyway before anything touches the filesystem.

use std::io;
use std::path::{Component, Path};

use texd_core::diff::FileChanges;
use texd_core::fileset::FileEntry;
use tracing::debug;

/// Write every entry of a fresh file set under `root`.
pub fn write_file_set(root: &Path, files: &[FileEntry]) -> io::Result<()> {
    for file in files {
        write_entry(root, file)?;
    }
    Ok(())
}

/// Apply an incremental diff to an existing workspace: write added and
/// modified entries, unlink deleted paths.
pub fn apply_changes(root: &Path, changes: &FileChanges) -> io::Result<()> {
    for file in changes.added.iter().chain(&changes.modified) {
        write_entry(root, file)?;
    }

    for path in &changes.deleted {
        let dest = root.join(guard_path(path)?);
        match std::fs::remove_file(&dest) {
            Ok(()) => debug!(path, "removed deleted file from workspace"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {},
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn write_entry(root: &Path, file: &FileEntry) -> io::Result<()> {
    let dest = root.join(guard_path(&file.path)?);

    if let Some(parent) = dest.parent() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(parent)?;
    }

    let bytes = file
        .decoded_content()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    std::fs::write(&dest, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644))?;
    }

    Ok(())
}

/// Paths must stay inside the workspace: relative, normal components only.
fn guard_path(path: &str) -> io::Result<&Path> {
    let p = Path::new(path);
    if p.as_os_str().is_empty()
        || p.is_absolute()
        || p.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsafe workspace path {path:?}"),
        ));
    }
    Ok(p)
}
