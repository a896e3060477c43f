//! # HTTP Clients
//!
//! The outbound half of the binary: a JSON-RPC client for one peer node
//! ([`JsonRpcPeer`]), the [`PeerConnector`] that builds one per registered
//! node, and the [`CallbackTransport`] that posts signed envelopes to
//! subscribers.
//!
//! All of them share one pooled `reqwest::Client`. Per-request deadlines are
//! applied by the callers (`RpcMultiClient` and the dispatcher), so the
//! client itself carries no timeout.

use async_trait::async_trait;
use base64::Engine;
use futures::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::io::StreamReader;

use mapi_gateway::crypto::Hash256;
use mapi_gateway::notification::{CallbackError, CallbackTransport};
use mapi_gateway::rpc::{
    BlockHeaderInfo, BlockStream, CollidedTx, Node, PeerConnector, PeerRpc, RawTxSubmission,
    RpcError, RpcResult, SubmitOutcome,
};
use mapi_gateway::storage::CallbackTarget;

/// Builds the HTTP client shared by peers and callback delivery.
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("mapi-node/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// GET `url` and return the status code and body text.
pub async fn get_text(url: &str) -> reqwest::Result<(u16, String)> {
    let response = reqwest::get(url).await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body))
}

fn disconnected(e: reqwest::Error) -> RpcError {
    RpcError::Disconnected(e.to_string())
}

// ---------------------------------------------------------------------------
// JSON-RPC peer
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcReplyError>,
}

#[derive(Debug, Deserialize)]
struct RpcReplyError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderReply {
    hash: String,
    #[serde(default)]
    previousblockhash: Option<String>,
    height: u64,
    time: u32,
}

#[derive(Debug, Default, Deserialize)]
struct SendRawTxsReply {
    #[serde(default)]
    known: Vec<String>,
    #[serde(default)]
    evicted: Vec<String>,
    #[serde(default)]
    invalid: Vec<InvalidEntry>,
}

#[derive(Debug, Deserialize)]
struct InvalidEntry {
    txid: String,
    #[serde(default)]
    reject_reason: String,
    #[serde(default, rename = "collidedWith")]
    collided_with: Vec<CollidedEntry>,
}

#[derive(Debug, Deserialize)]
struct CollidedEntry {
    txid: String,
    #[serde(default)]
    hex: Option<String>,
}

/// JSON-RPC client for a single peer node.
pub struct JsonRpcPeer {
    client: Client,
    authority: String,
    authorization: Option<String>,
    next_id: AtomicU64,
}

impl JsonRpcPeer {
    pub fn new(client: Client, host: &str, port: u16, username: &str, password: &str) -> Self {
        let authorization = (!username.is_empty()).then(|| {
            let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            format!("Basic {credentials}")
        });
        // Bare IPv6 literals need brackets inside a URL authority.
        let authority = if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            client,
            authority,
            authorization,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_node(client: Client, node: &Node) -> Self {
        Self::new(client, &node.host, node.port, &node.username, &node.password)
    }

    fn url(&self, path: &str) -> RpcResult<Url> {
        Url::parse(&format!("http://{}{}", self.authority, path))
            .map_err(|e| RpcError::Malformed(format!("bad peer address {}: {e}", self.authority)))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Some(auth) => builder.header(AUTHORIZATION, auth),
            None => builder,
        }
    }

    async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });

        let response = self
            .request(self.client.post(self.url("/")?))
            .json(&request)
            .send()
            .await
            .map_err(disconnected)?;
        let status = response.status().as_u16();
        let raw = response.bytes().await.map_err(disconnected)?;

        // Nodes answer RPC errors with HTTP 500 and a JSON body.
        let reply: RpcReply = serde_json::from_slice(&raw).map_err(|e| {
            RpcError::Malformed(format!("{method}: HTTP {status} with undecodable body: {e}"))
        })?;
        if let Some(err) = reply.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        reply
            .result
            .ok_or_else(|| RpcError::Malformed(format!("{method}: reply has no result")))
    }

    async fn call_as<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> RpcResult<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Malformed(format!("{method}: {e}")))
    }
}

fn parse_hash(s: &str) -> RpcResult<Hash256> {
    Hash256::from_hex(s).map_err(|e| RpcError::Malformed(format!("bad hash {s:?}: {e}")))
}

fn is_missing_inputs(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("missing-inputs") || reason.contains("missing inputs")
}

fn is_already_known(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("already-known") || reason.contains("already-in-mempool")
}

/// Map a `sendrawtransactions` reply onto per-transaction outcomes aligned
/// with `txs`. Transactions the reply does not mention were accepted.
fn submit_outcomes(txs: &[RawTxSubmission], reply: SendRawTxsReply) -> Vec<SubmitOutcome> {
    let known: HashSet<String> = reply.known.iter().map(|s| s.to_ascii_lowercase()).collect();
    let evicted: HashSet<String> = reply.evicted.iter().map(|s| s.to_ascii_lowercase()).collect();

    txs.iter()
        .map(|tx| {
            let id = tx.hash.to_hex();
            if let Some(entry) = reply.invalid.iter().find(|e| e.txid.eq_ignore_ascii_case(&id)) {
                if is_missing_inputs(&entry.reject_reason) {
                    return SubmitOutcome::MissingInputs;
                }
                if is_already_known(&entry.reject_reason) {
                    return SubmitOutcome::AlreadyKnown;
                }
                let collided_with = entry
                    .collided_with
                    .iter()
                    .filter_map(|c| {
                        let hash = Hash256::from_hex(&c.txid).ok()?;
                        let payload = c.hex.as_deref().and_then(|h| hex::decode(h).ok());
                        Some(CollidedTx { hash, payload })
                    })
                    .collect();
                return SubmitOutcome::Rejected {
                    reason: entry.reject_reason.clone(),
                    collided_with,
                };
            }
            if known.contains(&id) {
                SubmitOutcome::AlreadyKnown
            } else if evicted.contains(&id) {
                SubmitOutcome::Rejected {
                    reason: "evicted".to_string(),
                    collided_with: Vec::new(),
                }
            } else {
                SubmitOutcome::Accepted
            }
        })
        .collect()
}


#[async_trait]
impl PeerRpc for JsonRpcPeer {
    /// Streams the binary block body from the node's REST interface.
    async fn get_block_as_stream(&self, hash: &Hash256) -> RpcResult<BlockStream> {
        let url = self.url(&format!("/rest/block/{}.bin", hash.to_hex()))?;
        let response = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(disconnected)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Node {
                code: i64::from(status.as_u16()),
                message: body.trim().to_string(),
            });
        }
        let chunks = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let stream: BlockStream = Box::new(StreamReader::new(Box::pin(chunks)));
        Ok(stream)
    }

    async fn get_block_header(&self, hash: &Hash256) -> RpcResult<BlockHeaderInfo> {
        let reply: HeaderReply = self
            .call_as("getblockheader", json!([hash.to_hex(), true]))
            .await?;
        Ok(BlockHeaderInfo {
            hash: parse_hash(&reply.hash)?,
            prev_hash: match reply.previousblockhash {
                Some(prev) => parse_hash(&prev)?,
                None => Hash256::ZERO,
            },
            height: reply.height,
            time: reply.time,
        })
    }

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>> {
        let ids: Vec<String> = self.call_as("getrawmempool", json!([])).await?;
        ids.iter().map(|id| parse_hash(id)).collect()
    }

    async fn send_raw_transactions(&self, txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>> {
        if txs.is_empty() {
            return Ok(Vec::new());
        }
        let batch: Vec<Value> = txs
            .iter()
            .map(|tx| json!({ "hex": hex::encode(&tx.payload), "allowhighfees": false, "dontcheckfee": false }))
            .collect();
        let value = self.call("sendrawtransactions", json!([batch])).await?;
        let reply: SendRawTxsReply = if value.is_null() {
            SendRawTxsReply::default()
        } else {
            serde_json::from_value(value)
                .map_err(|e| RpcError::Malformed(format!("sendrawtransactions: {e}")))?
        };
        Ok(submit_outcomes(txs, reply))
    }

    async fn get_best_block_hash(&self) -> RpcResult<Hash256> {
        let hash: String = self.call_as("getbestblockhash", json!([])).await?;
        parse_hash(&hash)
    }
}

/// Builds a [`JsonRpcPeer`] for each registered node.
pub struct JsonRpcConnector {
    client: Client,
}

impl JsonRpcConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PeerConnector for JsonRpcConnector {
    fn connect(&self, node: &Node) -> Arc<dyn PeerRpc> {
        Arc::new(JsonRpcPeer::from_node(self.client.clone(), node))
    }
}

// ---------------------------------------------------------------------------
// Callback transport
// ---------------------------------------------------------------------------

/// Posts callback envelopes as `application/json`. Any 2xx is success.
pub struct HttpCallbackTransport {
    client: Client,
}

impl HttpCallbackTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn deliver(&self, target: &CallbackTarget, body: &str) -> Result<(), CallbackError> {
        let url = Url::parse(&target.url)
            .map_err(|e| CallbackError::Transport(format!("{}: {e}", target.url)))?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_owned());
        if let Some(token) = &target.token {
            request = request.header(AUTHORIZATION, token);
        }
        if let Some(encryption) = &target.encryption {
            request = request.header("X-Callback-Encryption", encryption);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallbackError::Timeout
            } else {
                CallbackError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CallbackError::Status(status.as_u16()))
        }
    }
}
