use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use engine_logging::engine_debug;

use crate::decode::decode_entry_name;
use crate::ExtractError;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "avif", "heic", "tif", "tiff",
];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz"];

/// Black-box archive capability: unpack `archive` into `destination`.
///
/// Returns every regular file produced. Implementations run on a blocking thread.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ExtractError>;
}

pub fn is_image_path(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

pub fn is_archive_path(path: &Path) -> bool {
    has_extension(path, ARCHIVE_EXTENSIONS)
}

/// True when the last path segment of `url` names an archive.
pub fn is_archive_url(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .is_some_and(|segment| is_archive_path(Path::new(&segment)))
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// Zip extraction with path-traversal protection and non-UTF-8 name decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let file = File::open(archive).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ExtractError::NotFound(archive.display().to_string()),
            _ => ExtractError::Io(err),
        })?;
        let mut zip = zip::ZipArchive::new(file).map_err(|err| {
            ExtractError::Unsupported(format!("{}: {err}", archive.display()))
        })?;

        fs::create_dir_all(destination)?;
        let mut produced = Vec::new();
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|err| ExtractError::Corrupt(err.to_string()))?;

            let name = decode_entry_name(entry.name_raw()).replace('\\', "/");
            let relative = Path::new(name.trim_start_matches('/'));
            if relative.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            }) {
                return Err(ExtractError::UnsafePath(name));
            }
            if relative.as_os_str().is_empty() {
                continue;
            }

            let out_path = destination.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            io::copy(&mut entry, &mut out_file)?;
            produced.push(out_path);
        }

        engine_debug!(
            "extracted {} files from {}",
            produced.len(),
            archive.display()
        );
        Ok(produced)
    }
}
