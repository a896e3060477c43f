//! Signed JSON callback bodies.
//!
//! The callback body is an envelope whose `payload` is the JSON-encoded
//! callback message as a string, signed byte-for-byte with the gateway's
//! Ed25519 key:
//!
//! ```json
//! {
//!   "payload": "{\"apiVersion\":\"1.5.0\",...}",
//!   "signature": "<hex>",
//!   "publicKey": "<hex>",
//!   "encoding": "UTF-8",
//!   "mimetype": "application/json"
//! }
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::CALLBACK_API_VERSION;
use crate::crypto::CallbackSigner;
use crate::storage::{NotificationData, NotificationKind};

/// Why a callback was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackReason {
    MerkleProof,
    DoubleSpend,
    DoubleSpendAttempt,
}

impl From<NotificationKind> for CallbackReason {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::MerkleProof => CallbackReason::MerkleProof,
            NotificationKind::DoubleSpend => CallbackReason::DoubleSpend,
            NotificationKind::DoubleSpendAttempt => CallbackReason::DoubleSpendAttempt,
        }
    }
}

/// The signed part of a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMessage {
    pub api_version: String,
    pub timestamp: String,
    pub miner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    pub callback_tx_id: String,
    pub callback_reason: CallbackReason,
    pub callback_payload: Value,
}

impl CallbackMessage {
    pub fn from_notification(item: &NotificationData, miner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            api_version: CALLBACK_API_VERSION.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            miner_id: miner_id.to_string(),
            block_hash: item.block_hash.map(|h| h.to_hex()),
            block_height: item.block_height,
            callback_tx_id: item.tx_hash.to_hex(),
            callback_reason: item.kind.into(),
            callback_payload: payload_for(item),
        }
    }
}

/// Kind-specific body. Merkle proofs use the TSC proof layout.
fn payload_for(item: &NotificationData) -> Value {
    match item.kind {
        NotificationKind::MerkleProof => {
            let (index, nodes) = item
                .merkle_branch
                .as_ref()
                .map(|b| (b.index, b.to_tsc_nodes()))
                .unwrap_or_default();
            json!({
                "index": index,
                "txOrId": item.tx_hash.to_hex(),
                "targetType": "hash",
                "target": item.block_hash.map(|h| h.to_hex()),
                "nodes": nodes,
            })
        }
        NotificationKind::DoubleSpend | NotificationKind::DoubleSpendAttempt => json!({
            "doubleSpendTxId": item.ds_tx_hash.map(|h| h.to_hex()),
            "payload": item.ds_tx_payload.as_ref().map(hex::encode),
        }),
    }
}

/// What is POSTed to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub payload: String,
    pub signature: String,
    pub public_key: String,
    pub encoding: String,
    pub mimetype: String,
}

impl SignedEnvelope {
    pub fn sign(message: &CallbackMessage, signer: &CallbackSigner) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(message)?;
        Ok(Self {
            signature: signer.sign_hex(payload.as_bytes()),
            public_key: signer.public_key_hex(),
            payload,
            encoding: "UTF-8".to_string(),
            mimetype: "application/json".to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
