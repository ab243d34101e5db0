//! File store (§4.10): sanitizes uploaded filenames, persists them under
//! `<storageRoot>/<collection>/<recordId>/`, and streams them back out with a MIME guess.

use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::schema::FieldOptions;
use crate::util::generate_random_string;

const MAX_BASENAME_LEN: usize = 100;
const SUFFIX_LEN: usize = 10;

/// Sanitizes `original` into a safe, collision-resistant filename (§4.10): strips any directory
/// components, replaces unsafe characters, collapses repeats, clamps length, lowercases the
/// extension, and appends a random suffix.
pub fn sanitize_filename(original: &str) -> String {
  let basename = Path::new(original)
    .file_name()
    .map(|s| s.to_string_lossy().to_string())
    .unwrap_or_else(|| "file".to_string());

  let (stem, ext) = match basename.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_lowercase())),
    _ => (basename, None),
  };

  let mut cleaned = String::with_capacity(stem.len());
  let mut last_was_underscore = false;
  for c in stem.chars() {
    let safe = c.is_ascii_alphanumeric() || c == '-';
    if safe {
      cleaned.push(c.to_ascii_lowercase());
      last_was_underscore = false;
    } else if !last_was_underscore {
      cleaned.push('_');
      last_was_underscore = true;
    }
  }
  let cleaned = cleaned.trim_matches('_');
  let cleaned = if cleaned.is_empty() { "file" } else { cleaned };
  let clamped: String = cleaned.chars().take(MAX_BASENAME_LEN).collect();

  let suffix = generate_random_string(SUFFIX_LEN).to_lowercase();
  return match ext {
    Some(ext) => format!("{clamped}_{suffix}.{ext}"),
    None => format!("{clamped}_{suffix}"),
  };
}

/// Checks `mime_type` against `patterns`, where each pattern is an exact MIME, `kind/*`, or `*`.
pub fn mime_allowed(mime_type: &str, patterns: &[String]) -> bool {
  if patterns.is_empty() {
    return true;
  }
  return patterns.iter().any(|pattern| {
    if pattern == "*" || pattern == "*/*" {
      return true;
    }
    if let Some(kind) = pattern.strip_suffix("/*") {
      return mime_type.split('/').next() == Some(kind);
    }
    return pattern == mime_type;
  });
}

/// A single validated incoming file, ready to be persisted once the owning record commits.
#[derive(Debug)]
pub struct IncomingFile {
  pub field_name: String,
  pub sanitized_name: String,
  pub content: Vec<u8>,
}

/// Validates a batch of uploads for one field against its [`FieldOptions`] (§4.10): count,
/// per-file size, and MIME. Any single failure aborts the whole field's batch.
pub fn validate_uploads(
  field_name: &str,
  uploads: &[(String, String, Vec<u8>)],
  options: &FieldOptions,
) -> Result<Vec<IncomingFile>, AppError> {
  if uploads.len() > options.max_files() as usize {
    return Err(AppError::Validation(format!(
      "field '{field_name}' accepts at most {} file(s)",
      options.max_files()
    )));
  }

  let mut validated = vec![];
  for (original_name, mime_type, bytes) in uploads {
    if bytes.len() as u64 > options.max_size() {
      return Err(AppError::Validation(format!(
        "file '{original_name}' exceeds max size of {} bytes",
        options.max_size()
      )));
    }
    if !mime_allowed(mime_type, options.allowed_types()) {
      return Err(AppError::Validation(format!(
        "file '{original_name}' has disallowed type '{mime_type}'"
      )));
    }
    validated.push(IncomingFile {
      field_name: field_name.to_string(),
      sanitized_name: sanitize_filename(original_name),
      content: bytes.clone(),
    });
  }
  return Ok(validated);
}

/// Persists and serves files under `<storageRoot>/<collection>/<recordId>/` (§4.10). Backed
/// directly by the filesystem: distinct `(collection, recordId)` directories need no locking.
#[derive(Clone)]
pub struct FileStore {
  root: PathBuf,
}

impl FileStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    return Self { root: root.into() };
  }

  fn record_dir(&self, collection: &str, record_id: &str) -> PathBuf {
    return self.root.join(collection).join(record_id);
  }

  pub async fn save(
    &self,
    collection: &str,
    record_id: &str,
    files: &[IncomingFile],
  ) -> Result<(), AppError> {
    let dir = self.record_dir(collection, record_id);
    tokio::fs::create_dir_all(&dir).await.map_err(AppError::internal)?;
    for file in files {
      let path = dir.join(&file.sanitized_name);
      tokio::fs::write(&path, &file.content).await.map_err(AppError::internal)?;
    }
    return Ok(());
  }

  pub async fn read(
    &self,
    collection: &str,
    record_id: &str,
    filename: &str,
  ) -> Result<(Vec<u8>, String), AppError> {
    let sanitized = Path::new(filename)
      .file_name()
      .map(|s| s.to_string_lossy().to_string())
      .ok_or_else(|| AppError::Validation("invalid filename".to_string()))?;
    let path = self.record_dir(collection, record_id).join(&sanitized);
    let bytes = tokio::fs::read(&path)
      .await
      .map_err(|_| AppError::NotFound(format!("file '{filename}' not found")))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream().to_string();
    return Ok((bytes, mime));
  }

  /// Best-effort recursive removal of a record's file directory (§4.10 cleanup); errors are
  /// logged, never propagated, since this runs from an `afterDelete` hook.
  pub async fn cleanup(&self, collection: &str, record_id: &str) {
    let dir = self.record_dir(collection, record_id);
    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
      if err.kind() != std::io::ErrorKind::NotFound {
        log::warn!("file cleanup failed for {}: {err}", dir.display());
      }
    }
  }

  /// Best-effort recursive removal of a whole collection's file tree, for admin collection
  /// deletion. Errors are logged, never propagated.
  pub async fn cleanup_collection(&self, collection: &str) {
    let dir = self.root.join(collection);
    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
      if err.kind() != std::io::ErrorKind::NotFound {
        log::warn!("collection file cleanup failed for {}: {err}", dir.display());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sanitize_filename_strips_path_and_unsafe_chars() {
    let sanitized = sanitize_filename("../../etc/My Report (final)!!.PDF");
    assert!(sanitized.starts_with("my_report_final_"));
    assert!(sanitized.ends_with(".pdf"));
    assert!(!sanitized.contains('/'));
    assert!(!sanitized.contains(' '));
  }

  #[test]
  fn test_sanitize_filename_clamps_length() {
    let long_name = format!("{}.txt", "a".repeat(500));
    let sanitized = sanitize_filename(&long_name);
    let stem_len = sanitized.rsplit_once('.').unwrap().0.len();
    assert!(stem_len <= MAX_BASENAME_LEN + 1 + SUFFIX_LEN);
  }

  #[test]
  fn test_mime_allowed_matching() {
    let patterns = vec!["image/*".to_string(), "application/pdf".to_string()];
    assert!(mime_allowed("image/png", &patterns));
    assert!(mime_allowed("application/pdf", &patterns));
    assert!(!mime_allowed("text/plain", &patterns));
    assert!(mime_allowed("anything/anything", &[]));
  }

  #[test]
  fn test_validate_uploads_rejects_too_many_files() {
    let options = FieldOptions {
      max_files: Some(1),
      ..Default::default()
    };
    let uploads = vec![
      ("a.png".to_string(), "image/png".to_string(), vec![1u8]),
      ("b.png".to_string(), "image/png".to_string(), vec![2u8]),
    ];
    let err = validate_uploads("photo", &uploads, &options).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[test]
  fn test_validate_uploads_rejects_oversized_file() {
    let options = FieldOptions {
      max_size: Some(4),
      ..Default::default()
    };
    let uploads = vec![("a.png".to_string(), "image/png".to_string(), vec![0u8; 10])];
    let err = validate_uploads("photo", &uploads, &options).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[tokio::test]
  async fn test_save_and_read_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let files = vec![IncomingFile {
      field_name: "photo".to_string(),
      sanitized_name: "pic.png".to_string(),
      content: vec![1, 2, 3],
    }];
    store.save("posts", "rec1", &files).await.unwrap();

    let (bytes, mime) = store.read("posts", "rec1", "pic.png").await.unwrap();
    assert_eq!(bytes, vec![1, 2, 3]);
    assert_eq!(mime, "image/png");
  }

  #[tokio::test]
  async fn test_cleanup_removes_record_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let files = vec![IncomingFile {
      field_name: "photo".to_string(),
      sanitized_name: "pic.png".to_string(),
      content: vec![1],
    }];
    store.save("posts", "rec1", &files).await.unwrap();
    store.cleanup("posts", "rec1").await;
    assert!(store.read("posts", "rec1", "pic.png").await.is_err());
  }

  #[tokio::test]
  async fn test_read_rejects_path_traversal() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let err = store.read("posts", "rec1", "../../etc/passwd").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
  }
}
