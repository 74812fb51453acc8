//! Version chains and the per-block mutation controller
//!
//! - `ColumnChain`: value updates of one column, indexed per row
//! - `DeleteChain`: deleted row ranges of one block, with merge nodes
//! - `AppendChain`: appended row ranges of one block
//! - `MutationController`: all chains of a block behind the block lock
//! - `UpdateCmd`: redo encoding of chain changes

mod append_chain;
mod cmd;
mod column_chain;
mod controller;
mod delete_chain;
mod node;

pub use append_chain::{AppendChain, AppendRange};
pub use cmd::{CommandBatch, UpdateCmd, CMD_APPEND, CMD_COMPACT_BLOCK, CMD_DELETE, CMD_UPDATE};
pub use column_chain::{ColumnChain, ColumnChainState, ColumnDelta};
pub use controller::{BlockDelta, BlockState, MutationController, NodeTarget};
pub use delete_chain::{DeleteChain, DeleteChainState, DeleteNodeData};
pub use node::{NodeId, NodeState, VersionChain, VersionNode};
