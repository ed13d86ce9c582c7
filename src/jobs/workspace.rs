//! Per-job directories on disk.
//!
//! The filesystem is the only record of a job's state. A workspace looks like:
//!
//! ```text
//! <uploads>/<id>/
//!     document.pdf   the upload, written before the job is queued
//!     job.json       original filename and effective options
//!     ocr.json       result, if the job succeeded
//!     error.txt      error message, if it failed
//! ```
//!
//! At most one of `ocr.json` and `error.txt` ever exists, and each appears
//! atomically: we write to a temporary file in the same directory and link it
//! into place without overwriting anything.

use std::{fmt, fs, io::Write as _, str::FromStr};

use schemars::JsonSchema;
use tempfile::NamedTempFile;

use crate::{
    error::JobError,
    ocr::{DocumentResult, OcrOptions},
    prelude::*,
};

/// Name of the uploaded document inside a workspace.
pub const DOCUMENT_FILE: &str = "document.pdf";
/// Name of the job manifest.
pub const MANIFEST_FILE: &str = "job.json";
/// Name of the success artifact.
pub const RESULT_FILE: &str = "ocr.json";
/// Name of the failure artifact.
pub const ERROR_FILE: &str = "error.txt";

/// Number of hex digits in a job ID.
const JOB_ID_LEN: usize = 12;

/// How many times we'll try to find an unused ID before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// An opaque job identifier: 12 lowercase hex digits.
///
/// Parsing is strict, so a [`JobId`] is always safe to use as a path
/// component.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(JOB_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() == JOB_ID_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Ok(Self(s.to_owned()))
        } else {
            Err(anyhow!("invalid job ID {:?}", s))
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recorded next to the document so a workspace can be understood on its own.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobManifest {
    /// The uploaded filename, sanitized.
    pub original_filename: String,

    /// The options the job ran with, after defaults were applied.
    pub options: OcrOptions,
}

/// What a workspace says about its job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// The job has been accepted but has no terminal artifact yet.
    Processing,
    /// The job succeeded.
    Done(DocumentResult),
    /// The job failed with this message.
    Failed(String),
    /// There is no such job.
    NotFound,
}

/// One job's directory.
#[derive(Clone, Debug)]
pub struct Workspace {
    id: JobId,
    dir: PathBuf,
}

impl Workspace {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self) -> PathBuf {
        self.dir.join(DOCUMENT_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    pub fn error_path(&self) -> PathBuf {
        self.dir.join(ERROR_FILE)
    }

    /// Read the job manifest.
    #[cfg(test)]
    pub fn read_manifest(&self) -> Result<JobManifest> {
        let path = self.manifest_path();
        let data = fs::read(&path)
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {:?}", path.display()))
    }

    /// Write `ocr.json`. Fails if either terminal artifact already exists.
    pub fn write_result(&self, result: &DocumentResult) -> Result<()> {
        let mut json =
            serde_json::to_vec_pretty(result).context("failed to serialize OCR result")?;
        json.push(b'\n');
        self.write_terminal_artifact(&self.result_path(), &self.error_path(), &json)
    }

    /// Write `error.txt`. Fails if either terminal artifact already exists.
    pub fn write_error(&self, message: &str) -> Result<()> {
        self.write_terminal_artifact(
            &self.error_path(),
            &self.result_path(),
            message.as_bytes(),
        )
    }

    /// Atomically create `path` containing `data`, unless `path` or `other`
    /// already exists.
    fn write_terminal_artifact(&self, path: &Path, other: &Path, data: &[u8]) -> Result<()> {
        if other.exists() {
            return Err(anyhow!(
                "refusing to write {:?} because {:?} already exists",
                path.display(),
                other.display()
            ));
        }
        let mut tmp = NamedTempFile::new_in(&self.dir).with_context(|| {
            format!("failed to create temporary file in {:?}", self.dir.display())
        })?;
        tmp.write_all(data)
            .and_then(|()| tmp.as_file().sync_all())
            .with_context(|| format!("failed to write {:?}", tmp.path().display()))?;
        tmp.persist_noclobber(path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to persist {:?}", path.display()))?;
        Ok(())
    }

    /// Work out the job's status from which files exist.
    fn status(&self) -> Result<JobStatus> {
        if !self.document_path().is_file() {
            return Ok(JobStatus::NotFound);
        }
        let result_path = self.result_path();
        if result_path.exists() {
            let data = fs::read(&result_path)
                .with_context(|| format!("failed to read {:?}", result_path.display()))?;
            let result = serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse {:?}", result_path.display()))?;
            return Ok(JobStatus::Done(result));
        }
        let error_path = self.error_path();
        if error_path.exists() {
            let message = fs::read_to_string(&error_path)
                .with_context(|| format!("failed to read {:?}", error_path.display()))?;
            return Ok(JobStatus::Failed(message));
        }
        Ok(JobStatus::Processing)
    }
}

/// The directory holding every job's workspace.
#[derive(Clone, Debug)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    /// Use `root` for job workspaces, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {:?}", root.display()))?;
        Ok(Self { root })
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace, store `document` in it and record `manifest`.
    ///
    /// If anything goes wrong after the directory is created, the directory is
    /// removed again.
    #[instrument(level = "debug", skip_all)]
    pub fn create(&self, document: &[u8], manifest: &JobManifest) -> Result<Workspace, JobError> {
        let workspace = self.create_dir().map_err(JobError::workspace)?;
        let populate = || -> Result<()> {
            let document_path = workspace.document_path();
            fs::write(&document_path, document)
                .with_context(|| format!("failed to write {:?}", document_path.display()))?;
            let manifest_path = workspace.manifest_path();
            let json = serde_json::to_vec_pretty(manifest)
                .context("failed to serialize job manifest")?;
            fs::write(&manifest_path, json)
                .with_context(|| format!("failed to write {:?}", manifest_path.display()))?;
            Ok(())
        };
        if let Err(err) = populate() {
            self.remove(&workspace);
            return Err(JobError::workspace(err));
        }
        debug!(id = %workspace.id, "Created job workspace");
        Ok(workspace)
    }

    /// Exclusively create a directory with a fresh ID.
    fn create_dir(&self) -> Result<Workspace> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = JobId::generate();
            let dir = self.root.join(id.as_str());
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Workspace { id, dir }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(%id, "Job ID collision, retrying");
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {:?}", dir.display()));
                }
            }
        }
        Err(anyhow!("could not find an unused job ID"))
    }

    /// The workspace for `id`, without checking that it exists.
    pub fn open(&self, id: &JobId) -> Workspace {
        Workspace {
            id: id.clone(),
            dir: self.root.join(id.as_str()),
        }
    }

    /// Look up a job by its string ID. Malformed IDs are simply not found.
    pub fn status(&self, id: &str) -> Result<JobStatus, JobError> {
        let Ok(id) = id.parse::<JobId>() else {
            return Ok(JobStatus::NotFound);
        };
        self.open(&id).status().map_err(JobError::workspace)
    }

    /// Delete a workspace, logging rather than failing.
    pub fn remove(&self, workspace: &Workspace) {
        if let Err(err) = fs::remove_dir_all(&workspace.dir) {
            error!(
                directory = ?workspace.dir.display(),
                "failed to delete job workspace: {}",
                err
            );
        }
    }
}
