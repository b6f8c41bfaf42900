//! Packages a file or directory tree into a checksummed archive.
//!
//! The archive always holds a single top-level entry named after the
//! source's base name; the installer relies on that to find what to move
//! onto the target path.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::core::models::{Archive, ArchiveFormat, HashAlgorithm, SourceArtifact, SourceKind};
use crate::error::{FerryError, Result};

/// Buffer size for hashing (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// One file or directory destined for the archive.
#[derive(Debug, Clone)]
struct ArchiveEntry {
    path: PathBuf,
    /// `/`-separated name inside the archive, rooted at the source base name.
    name: String,
    is_dir: bool,
}

/// Builds archives into a scratch directory. Built archives are never
/// removed here; whoever runs the pipeline deletes them.
#[derive(Debug, Clone)]
pub struct Archiver {
    scratch_dir: PathBuf,
    hash_algorithm: HashAlgorithm,
}

impl Archiver {
    pub fn new(scratch_dir: impl Into<PathBuf>, hash_algorithm: HashAlgorithm) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            hash_algorithm,
        }
    }

    /// Where `build` will write the archive for this source and timestamp.
    pub fn output_path(
        &self,
        source: &SourceArtifact,
        format: ArchiveFormat,
        timestamp: &str,
    ) -> Result<PathBuf> {
        let root_name = root_name(&source.path)?;
        Ok(self
            .scratch_dir
            .join(format!("{}_{}.{}", root_name, timestamp, format.extension())))
    }

    /// Build on the blocking pool. No timeout: bounded by disk and CPU only.
    pub async fn build(
        &self,
        source: &SourceArtifact,
        format: ArchiveFormat,
        timestamp: &str,
    ) -> Result<Archive> {
        let archiver = self.clone();
        let source = source.clone();
        let timestamp = timestamp.to_string();

        tokio::task::spawn_blocking(move || archiver.build_blocking(&source, format, &timestamp))
            .await?
    }

    pub fn build_blocking(
        &self,
        source: &SourceArtifact,
        format: ArchiveFormat,
        timestamp: &str,
    ) -> Result<Archive> {
        let kind = source
            .kind()
            .ok_or_else(|| FerryError::SourceNotFound(source.path.clone()))?;
        let root_name = root_name(&source.path)?;
        let output = self.output_path(source, format, timestamp)?;

        fs::create_dir_all(&self.scratch_dir)?;

        info!(
            source = %source.path.display(),
            format = %format,
            output = %output.display(),
            "Building archive"
        );

        let entries = collect_entries(source, &root_name, kind)?;
        match format {
            ArchiveFormat::Zip => write_zip(&output, &entries)?,
            ArchiveFormat::TarGz => write_tar_gz(&output, &entries)?,
        }

        let size = fs::metadata(&output)?.len();
        let hash = hash_file(&output, self.hash_algorithm)?;

        info!(
            entries = entries.len(),
            size,
            hash = %hash,
            algorithm = %self.hash_algorithm,
            "Archive built"
        );

        Ok(Archive {
            path: output,
            format,
            hash,
            hash_algorithm: self.hash_algorithm,
            size,
            root_name,
            source_kind: kind,
        })
    }
}

/// Base name of the source, resolving `.` and similar through the filesystem.
pub fn root_name(path: &Path) -> Result<String> {
    let resolved = fs::canonicalize(path).map_err(|_| FerryError::SourceNotFound(path.to_path_buf()))?;
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            FerryError::ArchiveFormat(format!("{} has no base name", path.display()))
        })
}

fn collect_entries(
    source: &SourceArtifact,
    root_name: &str,
    kind: SourceKind,
) -> Result<Vec<ArchiveEntry>> {
    if kind == SourceKind::File {
        return Ok(vec![ArchiveEntry {
            path: source.path.clone(),
            name: root_name.to_string(),
            is_dir: false,
        }]);
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(&source.path)
        .sort_by_file_name()
        .into_iter()
        // Excluded directories are pruned, not descended into.
        .filter_entry(|e| e.depth() == 0 || !source.is_excluded(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(&source.path)
            .map_err(|e| FerryError::ArchiveFormat(e.to_string()))?;

        let mut name = root_name.to_string();
        for component in relative.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(ArchiveEntry {
                path: entry.path().to_path_buf(),
                name,
                is_dir: true,
            });
        } else if file_type.is_file() {
            entries.push(ArchiveEntry {
                path: entry.path().to_path_buf(),
                name,
                is_dir: false,
            });
        } else if file_type.is_symlink() && fs::metadata(entry.path()).is_ok_and(|m| m.is_file()) {
            // Symlinked files are stored with the contents they point at.
            entries.push(ArchiveEntry {
                path: entry.path().to_path_buf(),
                name,
                is_dir: false,
            });
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular entry");
        }
    }

    Ok(entries)
}

fn write_zip(output: &Path, entries: &[ArchiveEntry]) -> Result<()> {
    let mut zip = zip::ZipWriter::new(File::create(output)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        let mode = unix_mode(&entry.path);
        let options = match mode {
            Some(mode) => options.unix_permissions(mode),
            None => options,
        };

        if entry.is_dir {
            zip.add_directory(entry.name.as_str(), options)?;
        } else {
            zip.start_file(entry.name.as_str(), options)?;
            let mut file = File::open(&entry.path)?;
            std::io::copy(&mut file, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}

fn write_tar_gz(output: &Path, entries: &[ArchiveEntry]) -> Result<()> {
    let encoder = GzEncoder::new(File::create(output)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        if entry.is_dir {
            builder.append_dir(&entry.name, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.name)?;
        }
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(unix)]
fn unix_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_path: &Path) -> Option<u32> {
    None
}

/// Hex digest of a file, streamed in chunks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => digest_file::<Md5>(path),
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path)?);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Unpack an archive into `into`, overwriting existing files.
pub fn extract_archive(format: ArchiveFormat, archive: &Path, into: &Path) -> Result<()> {
    fs::create_dir_all(into)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
            zip.extract(into)?;
        }
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
            tar.set_overwrite(true);
            tar.unpack(into)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn create_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Relative paths of every regular file under `root`.
    fn file_set(root: &Path) -> BTreeSet<String> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    fn sample_tree(root: &Path) -> PathBuf {
        let app = root.join("app");
        create_file(&app.join("main.py"), b"print('hi')");
        create_file(&app.join("lib/util.py"), b"def util(): pass");
        create_file(&app.join("lib/util.pyc"), b"\x00\x01");
        create_file(&app.join("node_modules/left-pad/index.js"), b"module.exports = 1");
        create_file(&app.join("static/logo.svg"), b"<svg/>");
        app
    }

    #[test]
    fn round_trip_reproduces_tree_minus_excludes() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            let temp = tempdir().unwrap();
            let app = sample_tree(temp.path());
            let source = SourceArtifact::new(
                &app,
                vec!["*.pyc".to_string(), "node_modules".to_string()],
            );
            let archiver = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Md5);

            let archive = archiver
                .build_blocking(&source, format, "20261015_101010_000")
                .unwrap();
            assert_eq!(archive.root_name, "app");
            assert_eq!(archive.source_kind, SourceKind::Directory);
            assert!(archive.path.ends_with(format!(
                "app_20261015_101010_000.{}",
                format.extension()
            )));

            let out = temp.path().join("out");
            extract_archive(format, &archive.path, &out).unwrap();

            let expected: BTreeSet<String> = ["app/main.py", "app/lib/util.py", "app/static/logo.svg"]
                .into_iter()
                .map(String::from)
                .collect();
            assert_eq!(file_set(&out), expected, "format {}", format);
            assert_eq!(
                fs::read(out.join("app/lib/util.py")).unwrap(),
                b"def util(): pass"
            );
            assert!(!out.join("app/node_modules").exists());
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_archived_with_their_contents() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            let temp = tempdir().unwrap();
            let app = temp.path().join("app");
            create_file(&app.join("real.conf"), b"port = 8080");
            std::os::unix::fs::symlink("real.conf", app.join("current.conf")).unwrap();
            std::os::unix::fs::symlink("missing.conf", app.join("dangling.conf")).unwrap();

            let archiver = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Md5);
            let archive = archiver
                .build_blocking(&SourceArtifact::new(&app, vec![]), format, "ts")
                .unwrap();

            let out = temp.path().join("out");
            extract_archive(format, &archive.path, &out).unwrap();
            assert_eq!(
                fs::read(out.join("app/current.conf")).unwrap(),
                b"port = 8080",
                "format {}",
                format
            );
            assert!(out.join("app/real.conf").is_file());
            assert!(!out.join("app/dangling.conf").exists());
        }
    }

    #[test]
    fn single_file_is_archived_under_its_name() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("service.jar");
        create_file(&file, b"jar bytes");

        let archiver = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Sha256);
        let archive = archiver
            .build_blocking(&SourceArtifact::new(&file, vec![]), ArchiveFormat::TarGz, "ts")
            .unwrap();
        assert_eq!(archive.source_kind, SourceKind::File);

        let out = temp.path().join("out");
        extract_archive(ArchiveFormat::TarGz, &archive.path, &out).unwrap();
        assert_eq!(fs::read(out.join("service.jar")).unwrap(), b"jar bytes");
    }

    #[test]
    fn empty_directories_survive() {
        let temp = tempdir().unwrap();
        let app = temp.path().join("app");
        fs::create_dir_all(app.join("logs")).unwrap();

        let archiver = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Md5);
        let archive = archiver
            .build_blocking(&SourceArtifact::new(&app, vec![]), ArchiveFormat::Zip, "ts")
            .unwrap();

        let out = temp.path().join("out");
        extract_archive(ArchiveFormat::Zip, &archive.path, &out).unwrap();
        assert!(out.join("app/logs").is_dir());
    }

    #[test]
    fn missing_source_is_reported() {
        let temp = tempdir().unwrap();
        let archiver = Archiver::new(temp.path(), HashAlgorithm::Md5);
        let err = archiver
            .build_blocking(
                &SourceArtifact::new(temp.path().join("nope"), vec![]),
                ArchiveFormat::Zip,
                "ts",
            )
            .unwrap_err();
        assert!(matches!(err, FerryError::SourceNotFound(_)));
    }

    #[test]
    fn hash_matches_recomputation_and_size() {
        let temp = tempdir().unwrap();
        let app = sample_tree(temp.path());
        let archiver = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Md5);
        let archive = archiver
            .build_blocking(&SourceArtifact::new(&app, vec![]), ArchiveFormat::Zip, "ts")
            .unwrap();

        let bytes = fs::read(&archive.path).unwrap();
        assert_eq!(archive.size, bytes.len() as u64);
        assert_eq!(archive.hash, hex::encode(Md5::digest(&bytes)));
        assert_eq!(archive.hash.len(), 32);
    }

    #[test]
    fn known_md5_digest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hello.txt");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }
}
