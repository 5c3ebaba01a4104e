//! Code producers invoked during the generation phase

use crate::error::AppResult;
use crate::snapshot::model::TableStructure;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

/// What a producer generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    Model,
    View,
    Api,
    Test,
}

impl ProducerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerKind::Model => "model",
            ProducerKind::View => "view",
            ProducerKind::Api => "api",
            ProducerKind::Test => "test",
        }
    }

    /// Output subdirectory under the generation root
    pub fn dir_name(&self) -> &'static str {
        match self {
            ProducerKind::Model => "models",
            ProducerKind::View => "views",
            ProducerKind::Api => "apis",
            ProducerKind::Test => "tests",
        }
    }
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates source files for one table
#[async_trait]
pub trait CodeProducer: Send + Sync {
    fn kind(&self) -> ProducerKind;

    /// Generate files for `table` under `output_dir`, returning the paths written
    async fn produce(
        &self,
        table: &str,
        structure: &TableStructure,
        output_dir: &Path,
    ) -> AppResult<Vec<PathBuf>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    table: &'a str,
    kind: ProducerKind,
    generated_at: String,
    structure: &'a TableStructure,
}

/// Writes a JSON manifest of the table structure to `<output>/<kind>/<table>.json`
#[derive(Debug, Clone, Copy)]
pub struct ManifestProducer {
    kind: ProducerKind,
}

impl ManifestProducer {
    pub fn new(kind: ProducerKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl CodeProducer for ManifestProducer {
    fn kind(&self) -> ProducerKind {
        self.kind
    }

    async fn produce(
        &self,
        table: &str,
        structure: &TableStructure,
        output_dir: &Path,
    ) -> AppResult<Vec<PathBuf>> {
        let dir = output_dir.join(self.kind.dir_name());
        fs::create_dir_all(&dir).await?;

        let manifest = Manifest {
            table,
            kind: self.kind,
            generated_at: Utc::now().to_rfc3339(),
            structure,
        };
        let path = dir.join(format!("{}.json", table));
        fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ColumnDef, TableInfo};

    #[tokio::test]
    async fn test_manifest_written_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let structure = TableStructure::from(
            TableInfo::new("users").column(ColumnDef::new("id", "INTEGER").primary_key()),
        );

        let files = ManifestProducer::new(ProducerKind::Api)
            .produce("users", &structure, dir.path())
            .await
            .unwrap();

        assert_eq!(files, vec![dir.path().join("apis").join("users.json")]);
        let body: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&files[0]).await.unwrap()).unwrap();
        assert_eq!(body["table"], "users");
        assert_eq!(body["kind"], "api");
        assert_eq!(body["structure"]["columns"]["id"]["dataType"], "INTEGER");
    }
}
