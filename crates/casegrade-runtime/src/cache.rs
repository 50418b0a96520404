//! Rubric caching for casegrade-runtime.
//!
//! Parsing a rubric is cheap but not free, and every case in a batch uses
//! the same one. Documents are cached by canonical path for the life of
//! the cache; a changed document is picked up only after invalidation.

use casegrade_core::{RubricDocument, RubricError};
use moka::future::Cache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-local cache of parsed rubric documents.
#[derive(Clone)]
pub struct RubricCache {
    cache: Cache<PathBuf, Arc<RubricDocument>>,
}

impl RubricCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    /// Load a rubric, parsing it on first use.
    ///
    /// Concurrent first loads of the same path parse once. Failures are not
    /// cached.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<Arc<RubricDocument>, RubricError> {
        let key = cache_key(path.as_ref())?;

        self.cache
            .try_get_with(key.clone(), async {
                tracing::info!(rubric = %key.display(), "Parsing rubric document");
                RubricDocument::load(&key).map(Arc::new)
            })
            .await
            .map_err(|e| match Arc::try_unwrap(e) {
                Ok(err) => err,
                Err(shared) => clone_error(&shared),
            })
    }

    /// Whether `path` is currently cached.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        cache_key(path.as_ref())
            .map(|key| self.cache.contains_key(&key))
            .unwrap_or(false)
    }

    /// Drop one document so the next load re-parses it.
    pub async fn invalidate(&self, path: impl AsRef<Path>) {
        if let Ok(key) = cache_key(path.as_ref()) {
            self.cache.invalidate(&key).await;
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for RubricCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RUBRIC_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for RubricCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RubricCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

fn cache_key(path: &Path) -> Result<PathBuf, RubricError> {
    path.canonicalize().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RubricError::NotFound(path.to_path_buf()),
        _ => RubricError::Io(e),
    })
}

// Another waiter on the same load holds a reference to the error.
fn clone_error(err: &RubricError) -> RubricError {
    match err {
        RubricError::NotFound(path) => RubricError::NotFound(path.clone()),
        RubricError::Empty(source) => RubricError::Empty(source.clone()),
        RubricError::DuplicateCriterion(id) => RubricError::DuplicateCriterion(*id),
        RubricError::MaxScoreOverflow => RubricError::MaxScoreOverflow,
        RubricError::Io(io) => RubricError::Io(std::io::Error::new(io.kind(), io.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rubric_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_is_cached_until_invalidated() {
        let file = rubric_file("Criterion 1: Maximum 10 points");
        let cache = RubricCache::new(8);

        let first = cache.load(file.path()).await.unwrap();
        assert_eq!(first.schema.max_possible_score(), 10);
        assert!(cache.contains(file.path()));

        std::fs::write(file.path(), "Criterion 1: Maximum 4 points").unwrap();
        let second = cache.load(file.path()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.invalidate(file.path()).await;
        let reloaded = cache.load(file.path()).await.unwrap();
        assert_eq!(reloaded.schema.max_possible_score(), 4);
    }

    #[tokio::test]
    async fn test_missing_rubric() {
        let cache = RubricCache::default();
        let err = cache.load("/nonexistent/rubric.txt").await.unwrap_err();
        assert!(matches!(err, RubricError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_rubric_not_cached() {
        let file = rubric_file("No maxima in here.");
        let cache = RubricCache::default();

        let err = cache.load(file.path()).await.unwrap_err();
        assert!(matches!(err, RubricError::Empty(_)));
        assert!(!cache.contains(file.path()));
    }
}
