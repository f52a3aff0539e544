//! Packages per-document artifacts into the single results archive.

use crate::error::TablesError;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::CompressionMethod;

/// Write `artifacts` into a new zip at `destination`, each stored under its
/// file name. An existing file at `destination` is replaced.
///
/// Entries keep the order of `artifacts`. An empty list yields a valid,
/// empty archive.
pub fn build_archive(destination: &Path, artifacts: &[PathBuf]) -> Result<PathBuf, TablesError> {
    let archive_err = |detail: String| TablesError::Archive {
        path: destination.to_path_buf(),
        detail,
    };

    let file = File::create(destination).map_err(|e| archive_err(e.to_string()))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let options: FileOptions<'_, ()> =
        FileOptions::default().compression_method(CompressionMethod::Deflated);

    for artifact in artifacts {
        let name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| archive_err(format!("invalid artifact path {}", artifact.display())))?;

        zip.start_file(name, options)
            .map_err(|e| archive_err(format!("{name}: {e}")))?;
        let mut input = File::open(artifact).map_err(|e| archive_err(format!("{name}: {e}")))?;
        let bytes =
            io::copy(&mut input, &mut zip).map_err(|e| archive_err(format!("{name}: {e}")))?;
        debug!("Archived {} ({} bytes)", name, bytes);
    }

    zip.finish().map_err(|e| archive_err(e.to_string()))?;
    Ok(destination.to_path_buf())
}
