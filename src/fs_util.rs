use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::Builder;

use crate::error::BratError;

fn ensure_parent(path: &Path) -> Result<&Path, BratError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| BratError::Filesystem(err.to_string()))?;
    Ok(parent)
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), BratError> {
    let parent = ensure_parent(path)?;
    let mut temp = Builder::new()
        .prefix(".bcbrat-write")
        .tempfile_in(parent)
        .map_err(|err| BratError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| BratError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| BratError::Filesystem(format!("{}: {err}", path.display())))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<(), BratError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed previous output");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BratError::Filesystem(format!("{}: {err}", path.display()))),
    }
}

/// Produce a new version of `target` through `produce`, which writes to the
/// staged path it is handed, then rename the staged file over `target`.
///
/// The staging directory lives next to `target` so the rename never crosses a
/// filesystem. If `produce` fails or leaves nothing behind, `target` is not
/// touched and the staging directory is removed.
pub fn replace_atomic<F>(target: &Path, produce: F) -> Result<(), BratError>
where
    F: FnOnce(&Path) -> Result<(), BratError>,
{
    let parent = ensure_parent(target)?;
    let file_name = target
        .file_name()
        .ok_or_else(|| BratError::FileReplacement(format!("{} has no file name", target.display())))?;
    let staging = Builder::new()
        .prefix(".bcbrat-replace")
        .tempdir_in(parent)
        .map_err(|err| BratError::FileReplacement(err.to_string()))?;
    let staged = staging.path().join(file_name);
    produce(&staged)?;
    if !staged.is_file() {
        return Err(BratError::FileReplacement(format!(
            "no output produced for {}",
            target.display()
        )));
    }
    fs::rename(&staged, target).map_err(|err| {
        BratError::FileReplacement(format!("{}: {err}", target.display()))
    })?;
    Ok(())
}
