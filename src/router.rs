//! Shard routing
//!
//! Storage adapters resolve every row key through a [`Router`]; the transfer
//! core never builds table names or picks databases itself.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;

/// Physical location of a row: database instance plus table split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardHandle {
    pub db_index: usize,
    /// `None` when the table is not split
    pub table_index: Option<u32>,
}

impl ShardHandle {
    /// Suffix appended to a logical table name (`""` or `"_3"`)
    pub fn table_suffix(&self) -> String {
        match self.table_index {
            Some(i) => format!("_{}", i),
            None => String::new(),
        }
    }
}

impl fmt::Display for ShardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db{}{}", self.db_index, self.table_suffix())
    }
}

pub trait Router: Send + Sync + fmt::Debug {
    fn route(&self, key: i64) -> ShardHandle;

    /// Every shard this router can produce, for full scans
    fn all_shards(&self) -> Vec<ShardHandle>;
}

/// `key mod db_count` picks the database, `key mod table_count` the table
#[derive(Debug, Clone, Copy)]
pub struct ModuloRouter {
    db_count: u32,
    table_count: u32,
}

impl ModuloRouter {
    pub fn new(db_count: u32, table_count: u32) -> Self {
        Self {
            db_count: db_count.max(1),
            table_count: table_count.max(1),
        }
    }
}

impl Router for ModuloRouter {
    fn route(&self, key: i64) -> ShardHandle {
        let table_index = if self.table_count <= 1 {
            None
        } else {
            Some(key.rem_euclid(self.table_count as i64) as u32)
        };
        ShardHandle {
            db_index: key.rem_euclid(self.db_count as i64) as usize,
            table_index,
        }
    }

    fn all_shards(&self) -> Vec<ShardHandle> {
        let tables: Vec<Option<u32>> = if self.table_count <= 1 {
            vec![None]
        } else {
            (0..self.table_count).map(Some).collect()
        };
        (0..self.db_count as usize)
            .flat_map(|db_index| {
                tables.iter().map(move |&table_index| ShardHandle {
                    db_index,
                    table_index,
                })
            })
            .collect()
    }
}

/// Routers for the three table families.
///
/// `record` and `balance` must agree on `db_index` for any holder: a leg
/// writes both inside one local transaction.
#[derive(Debug, Clone)]
pub struct Routing {
    pub db_count: usize,
    pub state: Arc<dyn Router>,
    pub record: Arc<dyn Router>,
    pub balance: Arc<dyn Router>,
}

impl Routing {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            db_count: config.db_count.max(1) as usize,
            state: Arc::new(ModuloRouter::new(config.db_count, config.state_split_num)),
            record: Arc::new(ModuloRouter::new(config.db_count, config.record_split_num)),
            balance: Arc::new(ModuloRouter::new(config.db_count, config.balance_split_num)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_table_has_no_suffix() {
        let router = ModuloRouter::new(1, 1);
        let shard = router.route(12345);
        assert_eq!(shard.db_index, 0);
        assert_eq!(shard.table_suffix(), "");
        assert_eq!(router.all_shards().len(), 1);
    }

    #[test]
    fn test_modulo_routing() {
        let router = ModuloRouter::new(2, 4);
        let shard = router.route(7);
        assert_eq!(shard.db_index, 1);
        assert_eq!(shard.table_index, Some(3));
        assert_eq!(shard.table_suffix(), "_3");
        assert_eq!(shard.to_string(), "db1_3");
    }

    #[test]
    fn test_all_shards_covers_every_route() {
        let router = ModuloRouter::new(3, 2);
        let shards = router.all_shards();
        assert_eq!(shards.len(), 6);
        for key in 0..100 {
            assert!(shards.contains(&router.route(key)));
        }
    }

    #[test]
    fn test_record_and_balance_share_db() {
        let config = EngineConfig {
            db_count: 3,
            record_split_num: 8,
            balance_split_num: 2,
            ..Default::default()
        };
        let routing = Routing::from_config(&config);
        for holder in [1_i64, 17, 1_000_000_007] {
            assert_eq!(
                routing.record.route(holder).db_index,
                routing.balance.route(holder).db_index
            );
        }
    }
}
