//! Bundles a job's input and generated tree into one zip archive.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info_span, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ArchiveError;
use crate::storage::ArtifactStore;

const COMPRESSION_LEVEL: i64 = 9;

pub struct Archiver {
    store: ArtifactStore,
}

impl Archiver {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Writes `<archive_root>/<job_id>-<attempt>.zip` containing the input
    /// file at the top level (as `entry_name`) plus everything below
    /// `output_dir`.
    ///
    /// Files are streamed into the archive one at a time. The archive only
    /// appears under its final name after it has been fully flushed and
    /// synced; on any failure the partial file is removed.
    pub fn archive(
        &self,
        job_id: &str,
        attempt: u32,
        input_path: &Path,
        entry_name: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, ArchiveError> {
        let _span = info_span!("archive", job_id, attempt).entered();

        let (partial, file) = self.store.create_partial_archive(job_id, attempt)?;
        let final_path = self.store.archive_path_for(job_id, attempt);

        let written = write_archive(file, &partial, input_path, entry_name, output_dir)
            .and_then(|entries| {
                std::fs::rename(&partial, &final_path)
                    .map(|_| entries)
                    .map_err(|e| ArchiveError::Write {
                        path: final_path.clone(),
                        source: e,
                    })
            });

        match written {
            Ok(entries) => {
                debug!(entries, "Archive written");
                Ok(final_path)
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&partial) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %cleanup, "Failed to remove partial archive");
                    }
                }
                Err(e)
            }
        }
    }
}

fn write_archive(
    file: File,
    partial: &Path,
    input_path: &Path,
    entry_name: &str,
    output_dir: &Path,
) -> Result<usize, ArchiveError> {
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL));

    zip.start_file(entry_name, options)?;
    copy_into(&mut zip, input_path)?;
    let mut entries = 1;

    for entry in WalkDir::new(output_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let name = relative_entry_name(output_dir, entry.path());

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else if entry.file_type().is_file() {
            if name == entry_name {
                warn!(entry = %name, "Generated file shadows the input entry, skipping");
                continue;
            }
            zip.start_file(name, options)?;
            copy_into(&mut zip, entry.path())?;
        } else {
            // Symlinks are not followed; the archive only holds real files.
            continue;
        }
        entries += 1;
    }

    let mut writer = zip.finish()?;
    writer.flush().map_err(|e| ArchiveError::Write {
        path: partial.to_path_buf(),
        source: e,
    })?;
    let file = writer.into_inner().map_err(|e| ArchiveError::Write {
        path: partial.to_path_buf(),
        source: e.into_error(),
    })?;
    file.sync_all().map_err(|e| ArchiveError::Write {
        path: partial.to_path_buf(),
        source: e,
    })?;

    Ok(entries)
}

fn copy_into<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    path: &Path,
) -> Result<(), ArchiveError> {
    let mut source = File::open(path).map_err(|e| ArchiveError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::io::copy(&mut source, zip).map_err(|e| ArchiveError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Zip entry names always use `/`, whatever the host separator.
fn relative_entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: ArtifactStore,
        input: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(
            temp.path().join("uploads"),
            temp.path().join("output"),
            temp.path().join("archives"),
        );
        store.ensure_roots().unwrap();

        let input = store
            .store_upload("schema.prisma", b"model User { id Int @id }")
            .unwrap();
        let output = store.attempt_output_dir(&store.output_dir_for("job-1"), 1);
        store.prepare_output_dir(&output).unwrap();

        Fixture {
            _temp: temp,
            store,
            input,
            output,
        }
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn test_archive_contains_input_and_tree() {
        let fx = fixture();
        std::fs::create_dir_all(fx.output.join("src/models")).unwrap();
        std::fs::write(fx.output.join("index.ts"), "export * from './src';").unwrap();
        std::fs::write(fx.output.join("src/models/user.ts"), "export class User {}").unwrap();

        let archiver = Archiver::new(fx.store.clone());
        let path = archiver
            .archive("job-1", 1, &fx.input, "schema.prisma", &fx.output)
            .unwrap();

        assert_eq!(path, fx.store.archive_path_for("job-1", 1));
        assert!(!fx.store.partial_archive_path_for("job-1", 1).exists());

        let mut names = entry_names(&path);
        names.sort();
        assert_eq!(
            names,
            vec![
                "index.ts",
                "schema.prisma",
                "src/",
                "src/models/",
                "src/models/user.ts"
            ]
        );

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("src/models/user.ts")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "export class User {}");
    }

    #[test]
    fn test_archive_with_empty_output() {
        let fx = fixture();
        let archiver = Archiver::new(fx.store.clone());
        let path = archiver
            .archive("job-1", 1, &fx.input, "schema.prisma", &fx.output)
            .unwrap();
        assert_eq!(entry_names(&path), vec!["schema.prisma"]);
    }

    #[test]
    fn test_archive_streams_large_files() {
        let fx = fixture();
        let big = vec![b'x'; 4 * 1024 * 1024];
        std::fs::write(fx.output.join("big.txt"), &big).unwrap();

        let archiver = Archiver::new(fx.store.clone());
        let path = archiver
            .archive("job-1", 1, &fx.input, "schema.prisma", &fx.output)
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let entry = archive.by_name("big.txt").unwrap();
        assert_eq!(entry.size(), big.len() as u64);
        assert!(entry.compressed_size() < entry.size());
    }

    #[test]
    fn test_failure_removes_partial_archive() {
        let fx = fixture();
        let archiver = Archiver::new(fx.store.clone());

        let missing = fx.input.with_file_name("gone.prisma");
        let err = archiver
            .archive("job-1", 1, &missing, "schema.prisma", &fx.output)
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Read { .. }));
        assert!(!fx.store.partial_archive_path_for("job-1", 1).exists());
        assert!(!fx.store.archive_path_for("job-1", 1).exists());
    }

    #[test]
    fn test_attempts_write_separate_archives() {
        let fx = fixture();
        let archiver = Archiver::new(fx.store.clone());

        let first = archiver
            .archive("job-1", 1, &fx.input, "schema.prisma", &fx.output)
            .unwrap();
        std::fs::write(fx.output.join("late.ts"), "export {}").unwrap();
        let second = archiver
            .archive("job-1", 2, &fx.input, "schema.prisma", &fx.output)
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(entry_names(&first), vec!["schema.prisma"]);
        assert_eq!(entry_names(&second), vec!["schema.prisma", "late.ts"]);
    }

    #[test]
    fn test_generated_file_cannot_shadow_input() {
        let fx = fixture();
        std::fs::write(fx.output.join("schema.prisma"), "generated copy").unwrap();

        let archiver = Archiver::new(fx.store.clone());
        let path = archiver
            .archive("job-1", 1, &fx.input, "schema.prisma", &fx.output)
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("schema.prisma")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "model User { id Int @id }");
    }

    #[test]
    fn test_relative_entry_name() {
        let root = Path::new("/out/job");
        assert_eq!(
            relative_entry_name(root, Path::new("/out/job/a/b.ts")),
            "a/b.ts"
        );
    }
}
