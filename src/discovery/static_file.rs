use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Discovery, DiscoveryError, Partition};

#[derive(Debug, Deserialize)]
struct PartitionFile {
    partitions: BTreeMap<String, Vec<String>>,
}

/// Partitions listed in a file
///
/// ```toml
/// [partitions]
/// RO = ["https://google.com", "https://emag.ro"]
/// United_States = ["https://google.com"]
/// ```
///
/// Files ending in `.json` are parsed as JSON with the same shape; anything
/// else as TOML. Partitions come out sorted by key.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    path: PathBuf,
}

impl StaticDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, contents: &str) -> Result<PartitionFile, DiscoveryError> {
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(contents).map_err(|e| {
                DiscoveryError::Fatal(format!("{}: {}", self.path.display(), e))
            })
        } else {
            toml::from_str(contents).map_err(|e| {
                DiscoveryError::Fatal(format!("{}: {}", self.path.display(), e))
            })
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<Partition>, DiscoveryError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DiscoveryError::Fatal(format!("Cannot read {}: {}", self.path.display(), e))
        })?;

        let file = self.parse(&contents)?;
        info!(path = %self.path.display(), partitions = file.partitions.len(), "Loaded partition file");

        Ok(file
            .partitions
            .into_iter()
            .map(|(key, urls)| Partition::new(key, urls))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partitions.toml");
        std::fs::write(
            &path,
            r#"
[partitions]
US = ["https://yahoo.com"]
RO = ["https://google.com", "https://emag.ro"]
"#,
        )
        .unwrap();

        let partitions = StaticDiscovery::new(&path).discover().await.unwrap();

        assert_eq!(
            partitions,
            vec![
                Partition::new(
                    "RO",
                    vec!["https://google.com".into(), "https://emag.ro".into()]
                ),
                Partition::new("US", vec!["https://yahoo.com".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partitions.json");
        std::fs::write(&path, r#"{"partitions": {"RO": ["https://google.com"]}}"#).unwrap();

        let partitions = StaticDiscovery::new(&path).discover().await.unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].key, "RO");
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let err = StaticDiscovery::new("/nonexistent/partitions.toml")
            .discover()
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_malformed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partitions.toml");
        std::fs::write(&path, "partitions = 3").unwrap();

        let err = StaticDiscovery::new(&path).discover().await.unwrap_err();

        assert!(!err.is_transient());
    }
}
