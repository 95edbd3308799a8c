//! Key-addressed artifact store.
//!
//! Pipeline stages exchange tables through named artifacts under one run
//! directory instead of ad hoc file paths. Every table is CSV with a
//! serde row type; the run configuration is a JSON artifact so a run can
//! be reproduced from its store alone.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The artifacts a run reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    Incidence,
    Notifications,
    Priors,
    CountryMeta,
    Splits,
    RunConfig,
}

impl ArtifactKey {
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKey::Incidence => "incidence.csv",
            ArtifactKey::Notifications => "notifications.csv",
            ArtifactKey::Priors => "priors.csv",
            ArtifactKey::CountryMeta => "country_meta.csv",
            ArtifactKey::Splits => "agesex_splits.csv",
            ArtifactKey::RunConfig => "run_config.json",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {key:?}: {source}")]
    Io {
        key: ArtifactKey,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact {key:?}: {source}")]
    Csv {
        key: ArtifactKey,
        #[source]
        source: csv::Error,
    },
    #[error("artifact {key:?}: {source}")]
    Json {
        key: ArtifactKey,
        #[source]
        source: serde_json::Error,
    },
}

/// One run's artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self, key: ArtifactKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub fn exists(&self, key: ArtifactKey) -> bool {
        self.path(key).exists()
    }

    pub fn read_table<T: DeserializeOwned>(&self, key: ArtifactKey) -> Result<Vec<T>, StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(self.path(key))
            .map_err(|source| StoreError::Csv { key, source })?;
        reader
            .deserialize()
            .collect::<Result<Vec<T>, csv::Error>>()
            .map_err(|source| StoreError::Csv { key, source })
    }

    pub fn write_table<T: Serialize>(&self, key: ArtifactKey, rows: &[T]) -> Result<(), StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_path(self.path(key))
            .map_err(|source| StoreError::Csv { key, source })?;
        for row in rows {
            writer
                .serialize(row)
                .map_err(|source| StoreError::Csv { key, source })?;
        }
        writer
            .flush()
            .map_err(|source| StoreError::Io { key, source })
    }

    pub fn read_json<T: DeserializeOwned>(&self, key: ArtifactKey) -> Result<T, StoreError> {
        let text = fs::read_to_string(self.path(key))
            .map_err(|source| StoreError::Io { key, source })?;
        serde_json::from_str(&text).map_err(|source| StoreError::Json { key, source })
    }

    pub fn write_json<T: Serialize>(&self, key: ArtifactKey, value: &T) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|source| StoreError::Json { key, source })?;
        fs::write(self.path(key), text).map_err(|source| StoreError::Io { key, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{CountryMeta, NotificationRecord};

    #[test]
    fn csv_round_trip_preserves_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let rows = vec![
            NotificationRecord {
                iso3: "AAA".into(),
                year: 2022,
                f014: Some(120.0),
                m014: Some(150.0),
                ..Default::default()
            },
            NotificationRecord {
                iso3: "BBB".into(),
                year: 2022,
                f04: Some(10.0),
                ..Default::default()
            },
        ];
        store
            .write_table(ArtifactKey::Notifications, &rows)
            .expect("write");
        let back: Vec<NotificationRecord> = store
            .read_table(ArtifactKey::Notifications)
            .expect("read");
        assert_eq!(back, rows);
        assert_eq!(back[0].f04, None);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let meta = vec![CountryMeta {
            iso3: "AAA".into(),
            region: "AFR".into(),
        }];
        store.write_json(ArtifactKey::RunConfig, &meta).expect("write");
        let back: Vec<CountryMeta> = store.read_json(ArtifactKey::RunConfig).expect("read");
        assert_eq!(back, meta);
    }

    #[test]
    fn missing_artifact_is_a_typed_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open");
        let result: Result<Vec<CountryMeta>, StoreError> =
            store.read_table(ArtifactKey::CountryMeta);
        assert!(matches!(result, Err(StoreError::Csv { .. })));
    }
}
