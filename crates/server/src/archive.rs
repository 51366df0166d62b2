//! Zip packing of the local client profile directory.
//!
//! Both directions do blocking file I/O and run on the blocking pool.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("profile directory {0} does not exist")]
    MissingSource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("archive task failed: {0}")]
    Task(String),
}

/// Compress every file under `src` into a zip at `dest`.
///
/// Entry names are relative to `src`. Returns the archive size in bytes.
pub async fn pack_dir(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || pack_dir_blocking(&src, &dest))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

/// Extract the zip at `archive` into `dest`, creating it if needed.
///
/// Returns the number of entries extracted.
pub async fn unpack(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn pack_dir_blocking(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    if !src.is_dir() {
        return Err(ArchiveError::MissingSource(src.display().to_string()));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(BufWriter::new(File::create(dest)?));

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let Some(name) = entry_name(src, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            let mut input = BufReader::new(File::open(entry.path())?);
            std::io::copy(&mut input, &mut writer)?;
        }
        // Sockets and lock symlinks left behind by the browser are skipped.
    }

    let out = writer.finish()?;
    let file = out.into_inner().map_err(|e| ArchiveError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    std::fs::create_dir_all(dest)?;
    let entries = zip.len();
    zip.extract(dest)?;
    Ok(entries)
}

/// Forward-slash path of `path` relative to `root`; `None` for the root itself.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    if relative.as_os_str().is_empty() {
        return None;
    }
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
