// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # mAPI Gateway Core Library
//!
//! The pipeline behind a merchant API gateway: it follows the best chain
//! across a set of trusted peer nodes, keeps accepted transactions alive in
//! their mempools, and tells subscribers when their transactions are mined
//! or double spent.
//!
//! ## Architecture
//!
//! The modules mirror the stages a block or transaction passes through:
//!
//! - **discovery**: announced block hashes and refused transactions.
//! - **chain**: streamed block codec, block parser, reorg resolution.
//! - **resolver**: double-spend attribution through the spend graph.
//! - **mempool**: reconciliation and resubmission against peer mempools.
//! - **notification**: per-host paced, signed callback delivery.
//! - **storage**: the `TxStore` contract and its embedded sled store.
//! - **rpc**: the `PeerRpc` contract and the multi-node client.
//! - **cleanup**: retention of old blocks and expired transactions.
//! - **crypto**: double-SHA256, merkle branches, callback signing.
//! - **faults**: commit-boundary hooks for crash-recovery tests.
//! - **config**: runtime settings and protocol constants.
//!
//! ## Design Philosophy
//!
//! 1. Every outbound collaborator is a trait; the library never opens a
//!    socket on its own.
//! 2. Peer calls happen before store writes, so a failed call leaves
//!    nothing half done.
//! 3. Duplicate work is harmless: every row insert is idempotent.
//! 4. A slow subscriber only ever slows down its own callbacks.

pub mod chain;
pub mod cleanup;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod faults;
pub mod mempool;
pub mod notification;
pub mod resolver;
pub mod rpc;
pub mod storage;
