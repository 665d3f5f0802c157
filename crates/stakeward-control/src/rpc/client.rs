//! HTTP JSON-RPC client for the bootstrap node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::NodeConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{KeystoreCredentials, NodeId, TxId};

use super::{
    AddValidatorOutcome, AddValidatorRequest, Method, NodeRpc, RpcErrorObject, RpcRequest,
    RpcResponse, TxStatus,
};

#[derive(Deserialize)]
struct BootstrappedReply {
    #[serde(rename = "isBootstrapped")]
    is_bootstrapped: bool,
}

#[derive(Deserialize)]
struct ImportKeyReply {
    address: String,
}

#[derive(Deserialize)]
struct AddValidatorReply {
    #[serde(rename = "txID", default)]
    tx_id: String,
}

/// Older nodes answer `getTxStatus` with a bare status string.
#[derive(Deserialize)]
#[serde(untagged)]
enum TxStatusReply {
    Detailed { status: TxStatus },
    Plain(TxStatus),
}

#[derive(Deserialize)]
struct ValidatorsReply {
    #[serde(default)]
    validators: Vec<ValidatorEntry>,
}

#[derive(Deserialize)]
struct ValidatorEntry {
    #[serde(rename = "nodeID")]
    node_id: NodeId,
}

#[derive(Serialize)]
struct ImportKeyParams<'a> {
    #[serde(flatten)]
    credentials: &'a KeystoreCredentials,
    #[serde(rename = "privateKey")]
    private_key: &'a str,
}

/// HTTP client for the node's JSON-RPC endpoints.
#[derive(Debug)]
pub struct HttpNodeClient {
    client: Client,
    base_url: String,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    /// Create a client for the node at `url` using the configured timeout.
    pub fn new(url: impl Into<String>, config: &NodeConfig) -> ControlResult<Self> {
        Self::with_timeout(url, config.request_timeout)
    }

    /// Create a client for the node at `url` with an explicit request timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: url.into().trim_end_matches('/').to_owned(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Send one JSON-RPC call and parse the envelope.
    async fn exchange<P, R>(&self, method: Method, params: &P) -> ControlResult<RpcResponse<R>>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, method.path());
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.name(),
            params,
        };

        tracing::trace!(method = method.name(), %url, "sending JSON-RPC request");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(ControlError::Http)?;

        let status = response.status();
        let body = response.bytes().await.map_err(ControlError::Http)?;

        match serde_json::from_slice(&body) {
            Ok(parsed) => Ok(parsed),
            Err(e) if status.is_success() => Err(ControlError::protocol(method.name(), e.to_string())),
            Err(_) => Err(ControlError::protocol(
                method.name(),
                format!("HTTP {status}"),
            )),
        }
    }

    /// Send one JSON-RPC call, returning the node's error object as `Err` inside `Ok`.
    async fn call<P, R>(
        &self,
        method: Method,
        params: &P,
    ) -> ControlResult<Result<R, RpcErrorObject>>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let parsed: RpcResponse<R> = self.exchange(method, params).await?;
        match (parsed.result, parsed.error) {
            (_, Some(error)) => Ok(Err(error)),
            (Some(result), None) => Ok(Ok(result)),
            (None, None) => Err(ControlError::protocol(
                method.name(),
                "response has neither result nor error",
            )),
        }
    }

    /// Send one JSON-RPC call, turning the node's error object into [`ControlError::Rpc`].
    async fn call_ok<P, R>(&self, method: Method, params: &P) -> ControlResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.call(method, params).await?.map_err(|e| ControlError::Rpc {
            method: method.name(),
            code: e.code,
            message: e.message,
        })
    }

    async fn validators(&self, method: Method) -> ControlResult<Vec<NodeId>> {
        let params = json!({ "subnetID": null, "nodeIDs": [] });
        let reply: ValidatorsReply = self.call_ok(method, &params).await?;
        Ok(reply.validators.into_iter().map(|v| v.node_id).collect())
    }
}

#[async_trait]
impl NodeRpc for HttpNodeClient {
    async fn is_bootstrapped(&self, chain: &str) -> ControlResult<bool> {
        let params = json!({ "chain": chain });
        let reply: BootstrappedReply = self.call_ok(Method::IsBootstrapped, &params).await?;
        Ok(reply.is_bootstrapped)
    }

    async fn create_user(&self, credentials: &KeystoreCredentials) -> ControlResult<()> {
        let _: serde_json::Value = self.call_ok(Method::CreateUser, credentials).await?;
        Ok(())
    }

    async fn import_key(
        &self,
        credentials: &KeystoreCredentials,
        private_key: &str,
    ) -> ControlResult<String> {
        let params = ImportKeyParams {
            credentials,
            private_key,
        };
        let reply: ImportKeyReply = self.call_ok(Method::ImportKey, &params).await?;
        Ok(reply.address)
    }

    async fn add_validator(
        &self,
        request: &AddValidatorRequest,
    ) -> ControlResult<AddValidatorOutcome> {
        // Anything without a transaction ID is a refusal, not a protocol fault.
        let reply: RpcResponse<AddValidatorReply> =
            self.exchange(Method::AddValidator, request).await?;
        let outcome = match (reply.result, reply.error) {
            (_, Some(error)) => AddValidatorOutcome::Refused(error.message),
            (Some(reply), None) if !reply.tx_id.is_empty() => {
                AddValidatorOutcome::Accepted(TxId::new(reply.tx_id))
            }
            (_, None) => AddValidatorOutcome::Refused("response carried no txID".to_owned()),
        };
        Ok(outcome)
    }

    async fn tx_status(&self, tx: &TxId) -> ControlResult<TxStatus> {
        let params = json!({ "txID": tx, "includeReason": true });
        let reply: TxStatusReply = self.call_ok(Method::GetTxStatus, &params).await?;
        Ok(match reply {
            TxStatusReply::Detailed { status } | TxStatusReply::Plain(status) => status,
        })
    }

    async fn current_validators(&self) -> ControlResult<Vec<NodeId>> {
        self.validators(Method::GetCurrentValidators).await
    }

    async fn pending_validators(&self) -> ControlResult<Vec<NodeId>> {
        self.validators(Method::GetPendingValidators).await
    }
}
