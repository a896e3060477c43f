//! Commit-boundary hooks for crash-recovery testing.
//!
//! Components that persist state in more than one step call
//! [`FaultInjection::before_commit`] before the write and
//! [`FaultInjection::after_commit`] once it is durable. Production wiring
//! uses [`NoFaults`]; tests inject implementations that fail at a chosen
//! point to check that state is left intact (before) or durable (after).

use std::fmt;
use thiserror::Error;

/// The multi-step commit a hook fires around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Chain membership and notification rows written for a parsed block.
    BlockParser,
    /// Bookkeeping written after a mempool resubmission.
    MempoolResubmit,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPoint::BlockParser => f.write_str("block-parser"),
            FaultPoint::MempoolResubmit => f.write_str("mempool-resubmit"),
        }
    }
}

/// A failure raised by an injected hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("injected fault {stage} {point}")]
pub struct InjectedFault {
    pub point: FaultPoint,
    pub stage: &'static str,
}

impl InjectedFault {
    pub fn before(point: FaultPoint) -> Self {
        Self {
            point,
            stage: "before",
        }
    }

    pub fn after(point: FaultPoint) -> Self {
        Self {
            point,
            stage: "after",
        }
    }
}

pub trait FaultInjection: Send + Sync {
    fn before_commit(&self, _point: FaultPoint) -> Result<(), InjectedFault> {
        Ok(())
    }

    fn after_commit(&self, _point: FaultPoint) -> Result<(), InjectedFault> {
        Ok(())
    }
}

/// Production hooks: never fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjection for NoFaults {}
