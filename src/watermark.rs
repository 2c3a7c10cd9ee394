use crate::error::{EnvoyError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const WATERMARK_DIR: &str = "enphaseEnvoy";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatermarkKind {
    ProductionMax,
    ConsumptionTotalMax,
    ConsumptionNetMax,
}

impl WatermarkKind {
    fn file_prefix(self) -> &'static str {
        match self {
            WatermarkKind::ProductionMax => "powerProductionMax",
            WatermarkKind::ConsumptionTotalMax => "powerConsumptionTotalMax",
            WatermarkKind::ConsumptionNetMax => "powerConsumptionNetMax",
        }
    }
}

/// Keeps the running maximum of each power stream in one small text file,
/// so the maxima survive daemon restarts.
#[derive(Clone, Debug)]
pub struct WatermarkStore {
    dir: PathBuf,
    host_key: String,
}

/// Strips address delimiters, "192.168.1.20" becomes "192168120".
pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

impl WatermarkStore {
    pub fn new(storage_path: impl AsRef<Path>, host: &str) -> Self {
        Self {
            dir: storage_path.as_ref().join(WATERMARK_DIR),
            host_key: sanitize_host(host),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: WatermarkKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}", kind.file_prefix(), self.host_key))
    }

    /// Creates the storage directory when it does not exist yet.
    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| EnvoyError::Persistence {
            path: self.dir.clone(),
            source,
        })
    }

    /// A missing file is not an error: there is simply no watermark yet.
    pub async fn read(&self, kind: WatermarkKind) -> Result<Option<f64>> {
        let path = self.path(kind);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(EnvoyError::Persistence { path, source }),
        };

        match content.trim().parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => Ok(Some(value)),
            _ => {
                warn!(
                    "ignoring unparsable watermark in {:?}: {:?}",
                    path,
                    content.trim()
                );
                Ok(None)
            }
        }
    }

    pub async fn write(&self, kind: WatermarkKind, value: f64) -> Result<()> {
        let path = self.path(kind);
        fs::write(&path, value.to_string())
            .await
            .map_err(|source| EnvoyError::Persistence { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_sanitized_into_file_name() {
        assert_eq!(sanitize_host("192.168.1.20"), "192168120");
        assert_eq!(sanitize_host("envoy.local"), "envoylocal");
        assert_eq!(sanitize_host("[fe80::1]:80"), "fe80180");

        let store = WatermarkStore::new("/var/lib/envoyd", "192.168.1.20");
        assert_eq!(
            store.path(WatermarkKind::ConsumptionNetMax),
            PathBuf::from("/var/lib/envoyd/enphaseEnvoy/powerConsumptionNetMax_192168120")
        );
    }

    #[tokio::test]
    async fn missing_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(tmp.path(), "envoy.local");
        store.prepare().unwrap();
        assert_eq!(store.read(WatermarkKind::ProductionMax).await.unwrap(), None);
    }

    #[tokio::test]
    async fn value_survives_a_new_store_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(tmp.path(), "10.0.0.5");
        store.prepare().unwrap();
        store.write(WatermarkKind::ProductionMax, 4.321).await.unwrap();

        let restarted = WatermarkStore::new(tmp.path(), "10.0.0.5");
        assert_eq!(
            restarted.read(WatermarkKind::ProductionMax).await.unwrap(),
            Some(4.321)
        );
        assert_eq!(
            restarted.read(WatermarkKind::ConsumptionTotalMax).await.unwrap(),
            None
        );

        let content = std::fs::read_to_string(store.path(WatermarkKind::ProductionMax)).unwrap();
        assert_eq!(content, "4.321");
    }

    #[tokio::test]
    async fn garbage_content_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(tmp.path(), "10.0.0.5");
        store.prepare().unwrap();
        std::fs::write(store.path(WatermarkKind::ConsumptionNetMax), "n/a").unwrap();
        std::fs::write(store.path(WatermarkKind::ConsumptionTotalMax), "-2").unwrap();
        assert_eq!(store.read(WatermarkKind::ConsumptionNetMax).await.unwrap(), None);
        assert_eq!(store.read(WatermarkKind::ConsumptionTotalMax).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_without_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(tmp.path().join("missing"), "10.0.0.5");
        let result = store.write(WatermarkKind::ProductionMax, 1.0).await;
        assert!(matches!(result, Err(EnvoyError::Persistence { .. })));
    }
}
