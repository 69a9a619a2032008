//! Directory artifacts travel as uncompressed POSIX tar: relative paths
//! from the archive root, file modes preserved, no absolute paths, no
//! device entries.

use std::fs::File;
use std::path::Path;

use tar::{Archive, Builder, EntryType};

use crate::error::{Error, Result};

/// Pack a directory into a tar file.
pub fn pack_dir(src: &Path, dest_tar: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::Artifact(format!(
            "'{}' is not a directory",
            src.display()
        )));
    }

    let file = File::create(dest_tar)
        .map_err(|e| Error::Artifact(format!("creating archive '{}': {e}", dest_tar.display())))?;

    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all("", src)
        .map_err(|e| Error::Artifact(format!("archiving '{}': {e}", src.display())))?;
    builder
        .into_inner()
        .and_then(|mut f| std::io::Write::flush(&mut f).map(|_| f))
        .map_err(|e| Error::Artifact(format!("finishing archive: {e}")))?;

    Ok(())
}

/// Unpack a tar file into a directory, reconstructing the tree.
///
/// Entries with absolute paths, parent traversal, or device types are
/// rejected.
pub fn unpack_tar(tar_path: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| Error::Artifact(format!("creating '{}': {e}", dest_dir.display())))?;

    let file = File::open(tar_path)
        .map_err(|e| Error::Artifact(format!("opening archive '{}': {e}", tar_path.display())))?;

    let mut archive = Archive::new(file);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| Error::Artifact(format!("reading archive: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Artifact(format!("reading entry: {e}")))?;

        let header_type = entry.header().entry_type();
        if matches!(header_type, EntryType::Block | EntryType::Char) {
            return Err(Error::Artifact(format!(
                "archive '{}' contains a device entry",
                tar_path.display()
            )));
        }

        let path = entry
            .path()
            .map_err(|e| Error::Artifact(format!("entry path: {e}")))?;
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Artifact(format!(
                "archive '{}' contains an unsafe path '{}'",
                tar_path.display(),
                path.display()
            )));
        }

        entry
            .unpack_in(dest_dir)
            .map_err(|e| Error::Artifact(format!("unpacking into '{}': {e}", dest_dir.display())))?;
    }

    Ok(())
}
