//! tessera-storage: shard nodes and the key fragment catalog over OpenDAL
//!
//! - `operator`: build an Operator per configured node (fs, memory, s3)
//! - `placement`: Shard Placement Store, round-robin over the shard nodes
//! - `fragments`: Key Fragment Store, wrapped key shares in the catalog
//! - `health`: reachability checks

pub mod fragments;
pub mod health;
pub mod operator;
pub mod placement;

pub use fragments::{FragmentRecord, KeyFragmentStore, LoadedFragments, SavedFragments};
pub use health::{check_all, check_health, is_healthy, NodeHealth};
pub use operator::{build_node_operator, build_node_operators};
pub use placement::{node_for, shard_path, ShardStore};
