//! In-process multi-member clusters for tests.

use std::sync::Arc;

use crate::cluster::{to_data, to_object, Address, LocalFabric, Transport};
use crate::config::GridConfig;
use crate::engine::PeerMsg;
use crate::node::GridNode;
use crate::partition::{partition_id_for_key, PartitionId};
use crate::utils::GridError;

use serde::Serialize;

/// N members joined on one `LocalFabric`, listening on 127.0.0.1:5701..
pub struct TestCluster {
    pub fabric: LocalFabric,
    pub nodes: Vec<GridNode>,
    partition_count: u32,
}

impl TestCluster {
    /// Starts `n` members over `partition_count` partitions, every structure
    /// getting `backup_count` backups.
    pub async fn start(
        n: usize,
        partition_count: u32,
        backup_count: usize,
    ) -> Result<Self, GridError> {
        let mut config = GridConfig {
            partition_count,
            worker_count: 2,
            ..Default::default()
        };
        config.default_map.backup_count = backup_count;
        Self::start_with(n, config).await
    }

    pub async fn start_with(
        n: usize,
        config: GridConfig,
    ) -> Result<Self, GridError> {
        let fabric = LocalFabric::new();
        let addrs: Vec<Address> = (0..n).map(Self::addr_of).collect();
        let mut nodes = Vec::with_capacity(n);
        for &addr in &addrs {
            let (transport, inbox) = fabric.join(addr)?;
            let transport: Arc<dyn Transport> = transport;
            nodes.push(
                GridNode::start(config.clone(), transport, inbox, &addrs).await?,
            );
        }
        Ok(TestCluster {
            fabric,
            nodes,
            partition_count: config.partition_count,
        })
    }

    fn addr_of(i: usize) -> Address {
        Address::from(([127, 0, 0, 1], 5701 + i as u16))
    }

    /// Address of the i-th member.
    pub fn addr(&self, i: usize) -> Address {
        Self::addr_of(i)
    }

    /// Some `u32` key hashing into partition `p`.
    pub fn key_in_partition(&self, p: PartitionId) -> u32 {
        (0u32..)
            .find(|k| {
                to_data(k).map_or(false, |d| {
                    partition_id_for_key(&d, self.partition_count) == p
                })
            })
            .unwrap_or(0)
    }

    /// First key `make(0)`, `make(1)`, ... whose partition member `i` owns.
    pub fn key_owned_by<K: Serialize>(
        &self,
        i: usize,
        make: impl Fn(u32) -> K,
    ) -> Result<K, GridError> {
        let table = self.nodes[i].table();
        for n in 0..10000 {
            let key = make(n);
            let p = table.partition_id_for_key(&to_data(&key)?);
            if table.owner_of(p)? == self.addr(i) {
                return Ok(key);
            }
        }
        Err(GridError::msg("no key owned by member"))
    }

    /// Backup frames carried by the fabric, to `to` or to anyone.
    pub fn backup_sends(&self, to: Option<Address>) -> usize {
        self.fabric
            .frames()
            .iter()
            .filter(|f| to.map_or(true, |to| f.to == to))
            .filter(|f| {
                matches!(to_object::<PeerMsg>(&f.frame), Ok(PeerMsg::Backup { .. }))
            })
            .count()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
