//! Keeps accepted transactions alive in peer mempools.

pub mod checker;

pub use checker::{CheckerError, InvalidTx, MempoolChecker, ResubmitStats};
