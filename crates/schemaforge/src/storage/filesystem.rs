use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::StorageError;
use crate::sanitize::sanitize_file_name;

const ARCHIVE_EXTENSION: &str = "zip";
const PARTIAL_SUFFIX: &str = "partial";
const MAX_NAME_ATTEMPTS: usize = 16;

/// Filesystem layout for uploads, generated trees and archives.
///
/// Every path handed out is derived from a root plus a job id or a
/// generated name; removals refuse to touch anything outside the roots.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads_root: PathBuf,
    output_root: PathBuf,
    archive_root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(uploads_root: P, output_root: P, archive_root: P) -> Self {
        Self {
            uploads_root: uploads_root.as_ref().to_path_buf(),
            output_root: output_root.as_ref().to_path_buf(),
            archive_root: archive_root.as_ref().to_path_buf(),
        }
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Creates the three roots if they do not exist yet.
    pub fn ensure_roots(&self) -> Result<(), StorageError> {
        for root in [&self.uploads_root, &self.output_root, &self.archive_root] {
            ensure_directory(root)?;
        }
        Ok(())
    }

    /// Persists an uploaded file under a collision-free name.
    ///
    /// The name is `<unix-millis>-<short-uuid>-<sanitized original>`, and the
    /// file is opened with `create_new` so two uploads can never share it.
    pub fn store_upload(&self, original_name: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
        ensure_directory(&self.uploads_root)?;
        let safe_name = sanitize_file_name(original_name);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let short_id = uuid::Uuid::new_v4().simple().to_string();
            let candidate = self.uploads_root.join(format!(
                "{}-{}-{}",
                Utc::now().timestamp_millis(),
                &short_id[..8],
                safe_name
            ));

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(content).and_then(|_| file.flush()) {
                        drop(file);
                        let _ = std::fs::remove_file(&candidate);
                        return Err(StorageError::WriteFile {
                            path: candidate,
                            source: e,
                        });
                    }
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StorageError::WriteFile {
                        path: candidate,
                        source: e,
                    })
                }
            }
        }

        Err(StorageError::NameExhausted(safe_name))
    }

    /// The job-exclusive directory holding one subdirectory per attempt.
    pub fn output_dir_for(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id)
    }

    /// The directory one attempt of a job generates into. Attempts never
    /// share a directory, so a superseded attempt cannot touch a newer one.
    pub fn attempt_output_dir(&self, output_dir: &Path, attempt: u32) -> PathBuf {
        output_dir.join(format!("attempt-{}", attempt))
    }

    /// Empties and recreates an attempt's output directory.
    pub fn prepare_output_dir(&self, output_dir: &Path) -> Result<(), StorageError> {
        self.remove_dir(output_dir)?;
        ensure_directory(output_dir)
    }

    pub fn archive_path_for(&self, job_id: &str, attempt: u32) -> PathBuf {
        self.archive_root
            .join(format!("{}-{}.{}", job_id, attempt, ARCHIVE_EXTENSION))
    }

    /// Where an archive is written before it is renamed into place.
    pub fn partial_archive_path_for(&self, job_id: &str, attempt: u32) -> PathBuf {
        self.archive_root.join(format!(
            "{}-{}.{}.{}",
            job_id, attempt, ARCHIVE_EXTENSION, PARTIAL_SUFFIX
        ))
    }

    /// Creates the partial archive file, replacing any leftover from a
    /// crashed run of the same attempt.
    pub fn create_partial_archive(
        &self,
        job_id: &str,
        attempt: u32,
    ) -> Result<(PathBuf, File), StorageError> {
        ensure_directory(&self.archive_root)?;
        let path = self.partial_archive_path_for(job_id, attempt);
        let file = File::create(&path).map_err(|e| StorageError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        Ok((path, file))
    }

    /// Removes a file below one of the roots. Missing files are fine.
    pub fn remove_file(&self, path: &Path) -> Result<(), StorageError> {
        self.ensure_within_roots(path)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Remove {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Removes a directory tree below one of the roots. Missing trees are fine.
    pub fn remove_dir(&self, path: &Path) -> Result<(), StorageError> {
        self.ensure_within_roots(path)?;
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Remove {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Removes a directory below one of the roots if it has no entries left.
    pub fn remove_dir_if_empty(&self, path: &Path) -> Result<(), StorageError> {
        self.ensure_within_roots(path)?;
        let is_empty = match std::fs::read_dir(path) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::Remove {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        if !is_empty {
            return Ok(());
        }
        match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Remove {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Removes everything a job may have left on disk: the stored input,
    /// the output tree, and the final and partial archives of every attempt
    /// up to `attempts`.
    pub fn remove_job_files(
        &self,
        job_id: &str,
        attempts: u32,
        input_path: &Path,
        output_dir: &Path,
        archive_path: Option<&Path>,
    ) -> Result<(), StorageError> {
        self.remove_file(input_path)?;
        self.remove_dir(output_dir)?;
        if let Some(archive) = archive_path {
            self.remove_file(archive)?;
        }
        for attempt in 1..=attempts {
            self.remove_file(&self.archive_path_for(job_id, attempt))?;
            self.remove_file(&self.partial_archive_path_for(job_id, attempt))?;
        }
        Ok(())
    }

    fn ensure_within_roots(&self, path: &Path) -> Result<(), StorageError> {
        let roots = [&self.uploads_root, &self.output_root, &self.archive_root];
        if roots.iter().any(|root| is_within(path, root)) {
            return Ok(());
        }
        Err(StorageError::OutsideRoot {
            path: path.to_path_buf(),
            root: self.uploads_root.clone(),
        })
    }
}

/// Returns true if `path` lies strictly below `root` without `..` segments.
pub fn is_within(path: &Path, root: &Path) -> bool {
    use std::path::Component;

    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return false;
    }
    path != root && path.starts_with(root)
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}
