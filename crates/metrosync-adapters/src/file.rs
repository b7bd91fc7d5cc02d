use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use metrosync_core::RawRecord;
use tokio::fs;
use tracing::debug;

use crate::{RowSource, RowSourceError};

/// Reads `<root>/<source_id>/<table_id>.json`, a JSON array of flat objects.
///
/// Stands in for the spreadsheet when running offline or under test.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    root: PathBuf,
}

impl JsonFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `None` when either id would escape the root directory.
    pub fn table_path(&self, source_id: &str, table_id: &str) -> Option<PathBuf> {
        if !is_plain_segment(source_id) || !is_plain_segment(table_id) {
            return None;
        }
        Some(self.root.join(source_id).join(format!("{table_id}.json")))
    }
}

fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[async_trait]
impl RowSource for JsonFileSource {
    async fn fetch(
        &self,
        source_id: &str,
        table_id: &str,
    ) -> Result<Vec<RawRecord>, RowSourceError> {
        let Some(path) = self.table_path(source_id, table_id) else {
            return Err(RowSourceError::not_found(source_id, table_id));
        };

        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RowSourceError::not_found(source_id, table_id));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into());
            }
        };

        let records: Vec<RawRecord> = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), records = records.len(), "loaded table file");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_segments_cannot_escape_root() {
        let source = JsonFileSource::new("/data");
        assert_eq!(
            source.table_path("sheet", "metros"),
            Some(PathBuf::from("/data/sheet/metros.json"))
        );
        assert!(source.table_path("..", "metros").is_none());
        assert!(source.table_path("sheet", "../secrets").is_none());
        assert!(source.table_path("sheet", "").is_none());
        assert!(source.table_path("a/b", "metros").is_none());
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let source = JsonFileSource::new(dir.path());
        let err = source.fetch("sheet", "nope").await.unwrap_err();
        assert!(matches!(err, RowSourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_json_is_an_error_not_an_empty_table() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sheet")).unwrap();
        std::fs::write(dir.path().join("sheet").join("metros.json"), "{not json").unwrap();
        let source = JsonFileSource::new(dir.path());
        let err = source.fetch("sheet", "metros").await.unwrap_err();
        assert!(matches!(err, RowSourceError::Anyhow(_)));
    }
}
