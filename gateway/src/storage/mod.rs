//! # Storage Module
//!
//! Persistence for everything the pipeline tracks.
//!
//! ```text
//! models.rs: Block, Tx, TxInput and the notification row types
//! store.rs : the TxStore contract every component is written against
//! db.rs    : GatewayDb, the sled implementation of TxStore
//! ```
//!
//! Components only ever see `Arc<dyn TxStore>`. The embedded store keeps a
//! single-process deployment self-contained; a SQL store can be swapped in
//! behind the same trait.

pub mod db;
pub mod models;
pub mod store;

pub use db::GatewayDb;
pub use models::{
    Block, BlockId, CallbackTarget, CleanUpStats, NewBlock, NewTx, NotificationData,
    NotificationKey, NotificationKind, OutPoint, Tx, TxBlock, TxBlockDoubleSpend, TxId, TxInput,
    TxMempoolDoubleSpendAttempt, TxStatus,
};
pub use store::{StoreError, StoreResult, TxStore};
