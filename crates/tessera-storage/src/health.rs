//! Storage health check

use opendal::Operator;

use tessera_core::{TesseraError, TesseraResult};

/// Verify a node is reachable by listing its root
pub async fn check_health(op: &Operator) -> TesseraResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| TesseraError::Storage(format!("storage health check failed: {e}")))
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}

/// Reachability of one configured location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub label: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Check every operator concurrently, preserving order.
pub async fn check_all(ops: &[(String, Operator)]) -> Vec<NodeHealth> {
    let checks = ops.iter().map(|(label, op)| async move {
        let result = check_health(op).await;
        NodeHealth {
            label: label.clone(),
            healthy: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    });
    futures::future::join_all(checks).await
}
