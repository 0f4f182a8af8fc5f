use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{BundleError, BUNDLE_EXTENSION, ENTRY_POINT, SCRIPT_EXTENSIONS};

/// Package `src` into a bundle at `dst`, appending the bundle extension if
/// `dst` lacks it. Returns the path written.
///
/// The source is snapshotted into a temporary directory first so that a
/// tree changing underneath the build cannot produce a torn archive, and the
/// archive is only renamed into place once complete.
pub fn build(src: &Path, dst: &Path) -> Result<PathBuf, BundleError> {
    if fs::read_dir(src)?.next().is_none() {
        return Err(BundleError::IsEmpty);
    }
    check_main(src)?;

    let snapshot = tempfile::tempdir()?;
    copy_tree(src, snapshot.path())?;

    let dst = with_bundle_extension(dst);
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let archive = tempfile::NamedTempFile::new_in(&parent)?;
    write_archive(snapshot.path(), archive.as_file())?;
    archive.persist(&dst).map_err(|e| BundleError::Io(e.error))?;

    tracing::debug!(src = %src.display(), dst = %dst.display(), "built bundle");
    Ok(dst)
}

fn with_bundle_extension(dst: &Path) -> PathBuf {
    let name = dst.to_string_lossy();
    if name.ends_with(BUNDLE_EXTENSION) {
        dst.to_path_buf()
    } else {
        PathBuf::from(format!("{name}{BUNDLE_EXTENSION}"))
    }
}

fn check_main(src: &Path) -> Result<(), BundleError> {
    for ext in SCRIPT_EXTENSIONS {
        let candidate = src.join(format!("{ENTRY_POINT}{ext}"));
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_file() => return Ok(()),
            Ok(_) => return Err(BundleError::InvalidMain(candidate.display().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(BundleError::MissingMain)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), BundleError> {
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

fn write_archive(root: &Path, out: &fs::File) -> Result<(), BundleError> {
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            let data = fs::read(entry.path())?;
            zip.write_all(&data)?;
        }
    }
    zip.finish()?;
    Ok(())
}
