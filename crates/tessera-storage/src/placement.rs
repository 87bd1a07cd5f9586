//! Round-robin shard placement across storage nodes
//!
//! Shard `i` of a file lives on node `i mod node_count` at
//! `shards/{file_id}/{i:03}`. The mapping is recomputed on every call and
//! never stored, so the write and read paths cannot drift apart.

use std::time::Duration;

use futures::future::{join_all, try_join_all};
use opendal::{Buffer, ErrorKind, Operator};

use tessera_core::{check_file_id, TesseraError, TesseraResult};

/// Node holding shard `shard_index`.
pub fn node_for(shard_index: usize, node_count: usize) -> usize {
    shard_index % node_count.max(1)
}

fn shard_prefix(file_id: &str) -> String {
    format!("shards/{file_id}/")
}

/// Object path of one shard on its node.
pub fn shard_path(file_id: &str, shard_index: usize) -> String {
    format!("shards/{file_id}/{shard_index:03}")
}

/// Where a shard read is aimed, for log fields and error messages.
#[derive(Clone, Copy)]
struct ShardSlot<'a> {
    file_id: &'a str,
    index: usize,
    node: usize,
}

/// Bound one node read by `timeout`. `NotFound` and a timeout both mean the
/// shard is missing; any other storage error is fatal.
async fn read_within<F>(
    timeout: Duration,
    read: F,
    slot: ShardSlot<'_>,
) -> TesseraResult<Option<Vec<u8>>>
where
    F: std::future::Future<Output = opendal::Result<Buffer>>,
{
    let ShardSlot {
        file_id,
        index,
        node,
    } = slot;
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(buf)) => Ok(Some(buf.to_vec())),
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(file_id, shard = index, node, "shard missing");
            Ok(None)
        }
        Ok(Err(e)) => Err(TesseraError::Storage(format!(
            "reading shard {index} from node {node}: {e}"
        ))),
        Err(_) => {
            tracing::warn!(
                file_id,
                shard = index,
                node,
                timeout_ms = timeout.as_millis() as u64,
                "shard read timed out, treating as missing"
            );
            Ok(None)
        }
    }
}

/// Shard objects spread over a fixed, ordered set of nodes.
#[derive(Clone)]
pub struct ShardStore {
    nodes: Vec<Operator>,
    node_timeout: Duration,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("nodes", &self.nodes.len())
            .field("node_timeout", &self.node_timeout)
            .finish()
    }
}

impl ShardStore {
    pub fn new(nodes: Vec<Operator>, node_timeout: Duration) -> TesseraResult<Self> {
        if nodes.is_empty() {
            return Err(TesseraError::Config(
                "shard store needs at least one node".into(),
            ));
        }
        Ok(Self {
            nodes,
            node_timeout,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Operator] {
        &self.nodes
    }

    /// Write every shard to its node. Any write failure fails the call;
    /// cleaning up the shards that did land is the caller's job.
    pub async fn store(&self, file_id: &str, shards: &[Vec<u8>]) -> TesseraResult<()> {
        check_file_id(file_id)?;

        let writes = shards.iter().enumerate().map(|(index, shard)| {
            let node = node_for(index, self.nodes.len());
            let op = &self.nodes[node];
            let path = shard_path(file_id, index);
            let bytes = shard.clone();
            async move {
                op.write(&path, bytes).await.map_err(|e| {
                    TesseraError::Storage(format!("writing shard {index} to node {node}: {e}"))
                })?;
                tracing::trace!(file_id, shard = index, node, "shard stored");
                Ok::<_, TesseraError>(())
            }
        });
        try_join_all(writes).await?;

        tracing::debug!(
            file_id,
            shards = shards.len(),
            nodes = self.nodes.len(),
            "shard set placed"
        );
        Ok(())
    }

    async fn read_one(&self, file_id: &str, index: usize) -> TesseraResult<Option<Vec<u8>>> {
        let node = node_for(index, self.nodes.len());
        let path = shard_path(file_id, index);
        let slot = ShardSlot {
            file_id,
            index,
            node,
        };
        read_within(self.node_timeout, self.nodes[node].read(&path), slot).await
    }

    /// Read shards `0..total_shards`. Missing or timed-out shards are `None`.
    pub async fn retrieve(
        &self,
        file_id: &str,
        total_shards: usize,
    ) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        check_file_id(file_id)?;
        let reads = (0..total_shards).map(|index| self.read_one(file_id, index));
        join_all(reads).await.into_iter().collect()
    }

    /// Like [`retrieve`](Self::retrieve), but a shard whose BLAKE3 hash does
    /// not match `shard_hashes[i]` is dropped to `None`.
    pub async fn retrieve_verified(
        &self,
        file_id: &str,
        shard_hashes: &[String],
    ) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        let mut shards = self.retrieve(file_id, shard_hashes.len()).await?;
        for (index, (slot, expected)) in shards.iter_mut().zip(shard_hashes).enumerate() {
            let corrupt = matches!(slot, Some(bytes) if !tessera_chunks::matches_hex(bytes, expected));
            if corrupt {
                tracing::warn!(file_id, shard = index, "shard hash mismatch, treating as missing");
                *slot = None;
            }
        }
        Ok(shards)
    }

    /// Remove every shard of `file_id` from every node. Returns the number of
    /// objects removed; deleting an unknown file is not an error.
    pub async fn delete(&self, file_id: &str) -> TesseraResult<usize> {
        check_file_id(file_id)?;
        let prefix = shard_prefix(file_id);
        let mut removed = 0;

        for (node, op) in self.nodes.iter().enumerate() {
            let entries = match op.list(&prefix).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(TesseraError::Storage(format!(
                        "listing shards on node {node}: {e}"
                    )))
                }
            };
            for entry in entries.iter().filter(|e| e.metadata().is_file()) {
                match op.delete(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(TesseraError::Storage(format!(
                            "deleting {} on node {node}: {e}",
                            entry.path()
                        )))
                    }
                }
            }
            if let Err(e) = op.delete(&prefix).await {
                tracing::debug!(node, error = %e, "shard directory not removed");
            }
        }

        tracing::debug!(file_id, removed, "shards deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_nodes(n: usize) -> Vec<Operator> {
        (0..n)
            .map(|_| {
                Operator::new(opendal::services::Memory::default())
                    .expect("memory operator")
                    .finish()
            })
            .collect()
    }

    fn shards(count: usize) -> Vec<Vec<u8>> {
        (0..count).map(|i| vec![i as u8; 64]).collect()
    }

    #[test]
    fn round_robin_mapping() {
        let placed: Vec<usize> = (0..7).map(|i| node_for(i, 3)).collect();
        assert_eq!(placed, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(node_for(5, 1), 0);
    }

    #[tokio::test]
    async fn store_places_round_robin() {
        let nodes = memory_nodes(3);
        let store = ShardStore::new(nodes.clone(), Duration::from_secs(5)).unwrap();
        store.store("f1", &shards(6)).await.unwrap();

        for index in 0..6 {
            let on_node = nodes[index % 3].read(&shard_path("f1", index)).await.unwrap();
            assert_eq!(on_node.to_vec(), vec![index as u8; 64]);
            let elsewhere = nodes[(index + 1) % 3].read(&shard_path("f1", index)).await;
            assert!(elsewhere.is_err());
        }
    }

    #[tokio::test]
    async fn missing_shard_is_none() {
        let nodes = memory_nodes(2);
        let store = ShardStore::new(nodes.clone(), Duration::from_secs(5)).unwrap();
        store.store("f2", &shards(4)).await.unwrap();
        nodes[1].delete(&shard_path("f2", 3)).await.unwrap();

        let got = store.retrieve("f2", 4).await.unwrap();
        assert!(got[0].is_some() && got[1].is_some() && got[2].is_some());
        assert!(got[3].is_none());
    }

    #[tokio::test]
    async fn hash_mismatch_becomes_none() {
        let nodes = memory_nodes(2);
        let store = ShardStore::new(nodes.clone(), Duration::from_secs(5)).unwrap();
        let set = shards(3);
        store.store("f3", &set).await.unwrap();
        nodes[0]
            .write(&shard_path("f3", 2), vec![0xFFu8; 64])
            .await
            .unwrap();

        let hashes = tessera_chunks::hash_shards(&set);
        let got = store.retrieve_verified("f3", &hashes).await.unwrap();
        assert_eq!(got[0].as_deref(), Some(&set[0][..]));
        assert_eq!(got[1].as_deref(), Some(&set[1][..]));
        assert!(got[2].is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let nodes = memory_nodes(3);
        let store = ShardStore::new(nodes, Duration::from_secs(5)).unwrap();
        store.store("f4", &shards(5)).await.unwrap();
        store.store("other", &shards(2)).await.unwrap();

        assert_eq!(store.delete("f4").await.unwrap(), 5);
        assert_eq!(store.delete("f4").await.unwrap(), 0);
        assert!(store.retrieve("f4", 5).await.unwrap().iter().all(Option::is_none));
        assert!(store.retrieve("other", 2).await.unwrap().iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn delete_on_fs_node() {
        let dir = tempfile::tempdir().unwrap();
        let op = crate::build_node_operator(
            &tessera_core::config::NodeConfig::Fs {
                root: dir.path().to_path_buf(),
            },
            false,
        )
        .unwrap();
        let store = ShardStore::new(vec![op], Duration::from_secs(5)).unwrap();
        store.delete("never-stored").await.unwrap();
        store.store("f5", &shards(2)).await.unwrap();
        assert_eq!(store.delete("f5").await.unwrap(), 2);
        assert_eq!(store.delete("f5").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_unsafe_file_id() {
        let store = ShardStore::new(memory_nodes(1), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            store.store("../x", &shards(1)).await,
            Err(TesseraError::Validation(_))
        ));
    }

    #[test]
    fn empty_node_list_rejected() {
        assert!(ShardStore::new(Vec::new(), Duration::from_secs(1)).is_err());
    }

    fn slot() -> ShardSlot<'static> {
        ShardSlot {
            file_id: "f1",
            index: 4,
            node: 1,
        }
    }

    #[tokio::test]
    async fn slow_node_counts_as_missing() {
        let stalled = std::future::pending::<opendal::Result<Buffer>>();
        let got = read_within(Duration::from_millis(10), stalled, slot()).await;
        assert!(matches!(got, Ok(None)));
    }

    #[tokio::test]
    async fn not_found_counts_as_missing() {
        let gone = async {
            Err::<Buffer, _>(opendal::Error::new(ErrorKind::NotFound, "no such object"))
        };
        let got = read_within(Duration::from_secs(5), gone, slot()).await;
        assert!(matches!(got, Ok(None)));
    }

    #[tokio::test]
    async fn other_read_errors_are_fatal() {
        let denied = async {
            Err::<Buffer, _>(opendal::Error::new(ErrorKind::PermissionDenied, "denied"))
        };
        match read_within(Duration::from_secs(5), denied, slot()).await {
            Err(TesseraError::Storage(msg)) => {
                assert!(msg.contains("shard 4 from node 1"), "{msg}");
            }
            other => panic!("expected a storage error, got {other:?}"),
        }
    }
}
