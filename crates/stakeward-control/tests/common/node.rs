//! Wiremock-backed bootstrap node.

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ok(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

fn rpc_error(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": -32000, "message": message }
    }))
}

fn rpc(rpc_path: &str, rpc_method: &str) -> wiremock::MockBuilder {
    Mock::given(method("POST"))
        .and(path(rpc_path))
        .and(body_partial_json(json!({ "method": rpc_method })))
}

fn validators(ids: &[&str]) -> Value {
    let entries: Vec<Value> = ids
        .iter()
        .map(|id| json!({ "nodeID": format!("NodeID-{id}"), "stakeAmount": "2000000000000" }))
        .collect();
    json!({ "validators": entries })
}

/// Answers bootstrap and keystore calls the way a healthy node does.
pub async fn mount_healthy_node(server: &MockServer) {
    rpc("/ext/info", "info.isBootstrapped")
        .respond_with(ok(json!({ "isBootstrapped": true })))
        .mount(server)
        .await;
    rpc("/ext/keystore", "keystore.createUser")
        .respond_with(ok(json!({ "success": true })))
        .mount(server)
        .await;
    rpc("/ext/bc/P", "platform.importKey")
        .respond_with(ok(json!({ "address": "P-imported" })))
        .mount(server)
        .await;
}

/// Accept add-validator calls, handing out `tx_ids` in order. Expects exactly that many calls.
pub async fn mount_add_validator(server: &MockServer, tx_ids: &[&str]) {
    for tx in tx_ids {
        rpc("/ext/bc/P", "platform.addValidator")
            .respond_with(ok(json!({ "txID": tx, "changeAddr": "P-change" })))
            .up_to_n_times(1)
            .expect(1)
            .mount(server)
            .await;
    }
}

/// Refuse every add-validator call with `message`.
pub async fn mount_add_validator_refusal(server: &MockServer, message: &str) {
    rpc("/ext/bc/P", "platform.addValidator")
        .respond_with(rpc_error(message))
        .mount(server)
        .await;
}

/// Report `status` for transaction `tx`.
pub async fn mount_tx_status(server: &MockServer, tx: &str, status: &str) {
    Mock::given(method("POST"))
        .and(path("/ext/bc/P"))
        .and(body_partial_json(json!({
            "method": "platform.getTxStatus",
            "params": { "txID": tx }
        })))
        .respond_with(ok(json!({ "status": status })))
        .mount(server)
        .await;
}

/// Report an empty set `empty_for` times for `rpc_method`, then `ids`.
pub async fn mount_validator_set(server: &MockServer, rpc_method: &str, empty_for: u64, ids: &[&str]) {
    if empty_for > 0 {
        rpc("/ext/bc/P", rpc_method)
            .respond_with(ok(validators(&[])))
            .up_to_n_times(empty_for)
            .mount(server)
            .await;
    }
    rpc("/ext/bc/P", rpc_method)
        .respond_with(ok(validators(ids)))
        .mount(server)
        .await;
}
