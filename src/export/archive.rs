//! Tarballs of scenario output directories.

use std::fs::File;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ArchiveError;

/// Packs `dir` into `tar_path`, rooted at the directory's own name.
pub fn create_tar_gz(dir: &Path, tar_path: &Path) -> Result<(), ArchiveError> {
    let build_err = |source: std::io::Error| ArchiveError::Build {
        path: tar_path.to_path_buf(),
        source,
    };

    let root = dir
        .file_name()
        .map(Path::new)
        .unwrap_or_else(|| Path::new("."));

    let file = File::create(tar_path).map_err(build_err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(root, dir).map_err(build_err)?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(build_err)?;
    Ok(())
}
