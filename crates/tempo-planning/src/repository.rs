use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::subject::Subject;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
  #[error("failed to read subjects from {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse subjects in {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Source of the subjects a run generates plans for.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
  /// Snapshot of the currently active subjects.
  async fn list_active_subjects(&self) -> Result<Vec<Subject>, RepositoryError>;
}

/// A fixed, in-memory list of subjects.
#[derive(Debug, Clone, Default)]
pub struct StaticSubjectRepository {
  subjects: Vec<Subject>,
}

impl StaticSubjectRepository {
  pub fn new(subjects: Vec<Subject>) -> Self {
    Self { subjects }
  }
}

#[async_trait]
impl SubjectRepository for StaticSubjectRepository {
  async fn list_active_subjects(&self) -> Result<Vec<Subject>, RepositoryError> {
    Ok(self.subjects.clone())
  }
}

/// Reads subjects from a JSON array on disk on every call.
///
/// A missing file means there are no active subjects.
#[derive(Debug, Clone)]
pub struct JsonFileSubjectRepository {
  path: PathBuf,
}

impl JsonFileSubjectRepository {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[async_trait]
impl SubjectRepository for JsonFileSubjectRepository {
  async fn list_active_subjects(&self) -> Result<Vec<Subject>, RepositoryError> {
    let content = match tokio::fs::read_to_string(&self.path).await {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %self.path.display(), "subjects_file_missing");
        return Ok(Vec::new());
      }
      Err(source) => {
        return Err(RepositoryError::Io {
          path: self.path.clone(),
          source,
        });
      }
    };

    serde_json::from_str(&content).map_err(|source| RepositoryError::Parse {
      path: self.path.clone(),
      source,
    })
  }
}
