//! Dataset discovery and purge.
//!
//! Finding which partitions exist uses `SCAN` where the store allows it. In
//! cluster mode, where `SCAN` is unavailable, partitions are looked up by their
//! batch-0 key in ascending windows until the first gap.

use crate::error::{ClientError, Result};
use crate::store::StoreClient;
use chunkhouse_core::key::MAX_PARTITIONS;
use chunkhouse_core::KeySpace;
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Batch-0 keys checked concurrently per window.
const LOOKUP_WINDOW: u32 = 64;

/// Sorted ids of the partitions that have at least one stored chunk.
///
/// With the probing fallback a partition whose batch-0 chunk is gone, and
/// every partition after the first such gap, is not reported.
pub async fn discover_partitions(store: &dyn StoreClient, keys: &KeySpace) -> Result<Vec<u32>> {
    if !store.topology().is_cluster() {
        match store.scan(&keys.scan_pattern()).await {
            Ok(found) => {
                let partitions: BTreeSet<u32> = found
                    .iter()
                    .filter_map(|key| keys.parse(key))
                    .map(|id| id.partition)
                    .collect();
                debug!(prefix = keys.prefix(), keys = found.len(), partitions = partitions.len(), "Scan discovery");
                return Ok(partitions.into_iter().collect());
            }
            Err(ClientError::Unsupported(_)) => {}
            Err(e) => return Err(e),
        }
    }
    walk_partitions(store, keys).await
}

async fn walk_partitions(store: &dyn StoreClient, keys: &KeySpace) -> Result<Vec<u32>> {
    let mut found = Vec::new();
    let mut start = 0;
    while start < MAX_PARTITIONS {
        let end = (start + LOOKUP_WINDOW).min(MAX_PARTITIONS);
        let lookups = (start..end).map(|partition| async move {
            let outcomes = store.multi_get(&[keys.key(partition, 0)]).await?;
            Ok::<_, ClientError>(outcomes.first().is_some_and(|o| o.is_present()))
        });
        let present = try_join_all(lookups).await?;

        for (offset, hit) in present.into_iter().enumerate() {
            if !hit {
                debug!(prefix = keys.prefix(), partitions = found.len(), "Batch-0 discovery");
                return Ok(found);
            }
            found.push(start + offset as u32);
        }
        start = end;
    }
    Ok(found)
}

/// Delete every chunk of `partitions`, one call per partition.
///
/// Returns the number of keys actually removed.
pub async fn purge_dataset(
    store: &dyn StoreClient,
    keys: &KeySpace,
    partitions: &[u32],
    batches_per_partition: u32,
) -> Result<u64> {
    let mut removed = 0;
    for &partition in partitions {
        let partition_keys = keys.partition_keys(partition, batches_per_partition);
        removed += store.delete(&partition_keys).await?;
    }
    info!(prefix = keys.prefix(), partitions = partitions.len(), removed, "Purged dataset");
    Ok(removed)
}

/// Delete whatever `SCAN` finds under the prefix, grouped per partition.
pub async fn purge_by_scan(store: &dyn StoreClient, keys: &KeySpace) -> Result<u64> {
    let mut by_partition: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for key in store.scan(&keys.scan_pattern()).await? {
        if let Some(id) = keys.parse(&key) {
            by_partition.entry(id.partition).or_default().push(key);
        }
    }

    let mut removed = 0;
    for partition_keys in by_partition.values() {
        removed += store.delete(partition_keys).await?;
    }
    info!(prefix = keys.prefix(), partitions = by_partition.len(), removed, "Purged by scan");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;

    async fn seed(store: &MemoryStore, keys: &KeySpace, partitions: u32, batches: u32) {
        for p in 0..partitions {
            for b in 0..batches {
                store.set(&keys.key(p, b), Bytes::from_static(b"x")).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_scan_discovery_ignores_other_prefixes() {
        let store = MemoryStore::new();
        let keys = KeySpace::new("demo:v1");
        seed(&store, &keys, 3, 2).await;
        seed(&store, &KeySpace::new("demo:v2"), 5, 1).await;

        assert_eq!(discover_partitions(&store, &keys).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_batch_zero_discovery_in_cluster_mode() {
        let store = MemoryStore::cluster(3);
        let keys = KeySpace::new("demo:v1");
        seed(&store, &keys, 70, 1).await;

        let found = discover_partitions(&store, &keys).await.unwrap();
        assert_eq!(found, (0..70).collect::<Vec<_>>());

        store.remove(&keys.key(5, 0));
        assert_eq!(discover_partitions(&store, &keys).await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_purge_dataset_and_purge_by_scan() {
        let store = MemoryStore::new();
        let keys = KeySpace::new("p");
        seed(&store, &keys, 3, 4).await;
        store.remove(&keys.key(0, 1));

        assert_eq!(purge_dataset(&store, &keys, &[0, 1], 4).await.unwrap(), 7);
        assert_eq!(store.len(), 4);

        assert_eq!(purge_by_scan(&store, &keys).await.unwrap(), 4);
        assert!(store.is_empty());
    }
}
