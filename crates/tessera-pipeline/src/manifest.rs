//! File metadata manifests in the catalog, one JSON object per file at
//! `manifests/{file_id}.json`.

use opendal::{ErrorKind, Operator};

use tessera_core::{check_file_id, FileMetadata, TesseraError, TesseraResult};

/// Current [`FileMetadata`] record format
pub const METADATA_VERSION: u32 = 1;

const MANIFEST_PREFIX: &str = "manifests/";

pub fn manifest_path(file_id: &str) -> String {
    format!("{MANIFEST_PREFIX}{file_id}.json")
}

/// Reads and writes metadata manifests on the catalog operator.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    catalog: Operator,
}

impl ManifestStore {
    pub fn new(catalog: Operator) -> Self {
        Self { catalog }
    }

    pub async fn write(&self, meta: &FileMetadata) -> TesseraResult<()> {
        check_file_id(&meta.file_id)?;
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| TesseraError::Serialization(format!("file metadata: {e}")))?;
        let path = manifest_path(&meta.file_id);
        self.catalog
            .write(&path, json)
            .await
            .map_err(|e| TesseraError::Storage(format!("writing {path}: {e}")))?;
        Ok(())
    }

    /// Fails `FileNotFound` when no manifest exists.
    pub async fn read(&self, file_id: &str) -> TesseraResult<FileMetadata> {
        check_file_id(file_id)?;
        let path = manifest_path(file_id);
        let bytes = match self.catalog.read(&path).await {
            Ok(buf) => buf.to_vec(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TesseraError::FileNotFound(file_id.to_string()))
            }
            Err(e) => return Err(TesseraError::Storage(format!("reading {path}: {e}"))),
        };
        let meta: FileMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| TesseraError::Serialization(format!("parsing {path}: {e}")))?;
        if meta.file_id != file_id {
            return Err(TesseraError::validation(format!(
                "{path} describes file {}",
                meta.file_id
            )));
        }
        Ok(meta)
    }

    pub async fn exists(&self, file_id: &str) -> TesseraResult<bool> {
        check_file_id(file_id)?;
        let path = manifest_path(file_id);
        self.catalog
            .exists(&path)
            .await
            .map_err(|e| TesseraError::Storage(format!("checking {path}: {e}")))
    }

    /// Returns whether a manifest was removed.
    pub async fn delete(&self, file_id: &str) -> TesseraResult<bool> {
        if !self.exists(file_id).await? {
            return Ok(false);
        }
        let path = manifest_path(file_id);
        match self.catalog.delete(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TesseraError::Storage(format!("deleting {path}: {e}"))),
        }
    }

    /// Ids of every committed file, sorted.
    pub async fn list(&self) -> TesseraResult<Vec<String>> {
        let entries = match self.catalog.list(MANIFEST_PREFIX).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TesseraError::Storage(format!(
                    "listing {MANIFEST_PREFIX}: {e}"
                )))
            }
        };
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|e| e.metadata().is_file())
            .filter_map(|e| e.name().strip_suffix(".json").map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::CipherSuite;

    fn memory_operator() -> Operator {
        Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish()
    }

    fn sample(file_id: &str) -> FileMetadata {
        FileMetadata {
            version: METADATA_VERSION,
            file_id: file_id.into(),
            size: 10,
            compressed_size: 8,
            compression_ratio: 0.8,
            encryption_type: CipherSuite::Aes256Gcm,
            iv: "AAAAAAAAAAAAAAAAAAAAAA==".into(),
            salt: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into(),
            file_hash: "00".repeat(32),
            share_count: 3,
            threshold: 2,
            user_held_shares: 0,
            data_shard_count: 2,
            parity_shard_count: 1,
            shard_size: 64,
            shard_hashes: Vec::new(),
            server_key_id: "k1".into(),
            master_key_version: 1,
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn write_read_list_delete() {
        let store = ManifestStore::new(memory_operator());
        store.write(&sample("b-file")).await.unwrap();
        store.write(&sample("a-file")).await.unwrap();

        let meta = store.read("a-file").await.unwrap();
        assert_eq!(meta.share_count, 3);
        assert_eq!(meta.encryption_type, CipherSuite::Aes256Gcm);
        assert_eq!(store.list().await.unwrap(), vec!["a-file", "b-file"]);

        assert!(store.delete("a-file").await.unwrap());
        assert!(!store.delete("a-file").await.unwrap());
        assert!(matches!(
            store.read("a-file").await,
            Err(TesseraError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn json_uses_camel_case() {
        let op = memory_operator();
        let store = ManifestStore::new(op.clone());
        store.write(&sample("f")).await.unwrap();
        let raw = op.read(&manifest_path("f")).await.unwrap().to_vec();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("\"serverKeyId\""));
        assert!(text.contains("\"dataShardCount\""));
    }

    #[tokio::test]
    async fn mismatched_file_id_is_rejected() {
        let op = memory_operator();
        let store = ManifestStore::new(op.clone());
        let json = serde_json::to_vec(&sample("other")).unwrap();
        op.write(&manifest_path("mine"), json).await.unwrap();
        assert!(matches!(
            store.read("mine").await,
            Err(TesseraError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn empty_catalog_lists_nothing() {
        let store = ManifestStore::new(memory_operator());
        assert!(store.list().await.unwrap().is_empty());
    }
}
