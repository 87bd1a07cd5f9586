//! OpenDAL Operator factory for shard nodes and the catalog

use opendal::Operator;

use tessera_core::config::NodeConfig;
use tessera_core::{TesseraError, TesseraResult};

fn with_layers(op: Operator) -> Operator {
    op.layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
}

fn storage_err(node: &NodeConfig, e: opendal::Error) -> TesseraError {
    TesseraError::Storage(format!("creating operator for {}: {e}", node.describe()))
}

/// Build an OpenDAL Operator for one configured node.
///
/// S3 nodes use path-style addressing (default in opendal 0.55), which
/// SeaweedFS and MinIO require. Credentials come from `AWS_ACCESS_KEY_ID` /
/// `AWS_SECRET_ACCESS_KEY` when set.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_node_operator(node: &NodeConfig, enforce_tls: bool) -> TesseraResult<Operator> {
    match node {
        NodeConfig::Fs { root } => {
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            let op = Operator::new(builder).map_err(|e| storage_err(node, e))?.finish();
            Ok(with_layers(op))
        }
        NodeConfig::Memory => {
            let builder = opendal::services::Memory::default();
            let op = Operator::new(builder).map_err(|e| storage_err(node, e))?.finish();
            Ok(with_layers(op))
        }
        NodeConfig::S3 {
            endpoint,
            region,
            bucket,
            root,
        } => {
            if endpoint.starts_with("http://") {
                if enforce_tls {
                    return Err(TesseraError::Config(format!(
                        "S3 endpoint uses plaintext HTTP ({endpoint}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development."
                    )));
                }
                tracing::warn!(
                    endpoint = %endpoint,
                    "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
                );
            }

            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let mut builder = opendal::services::S3::default()
                .endpoint(endpoint)
                .region(region)
                .bucket(bucket);
            if let Some(root) = root {
                builder = builder.root(root);
            }
            if let (Ok(access), Ok(secret)) = (
                std::env::var("AWS_ACCESS_KEY_ID"),
                std::env::var("AWS_SECRET_ACCESS_KEY"),
            ) {
                builder = builder.access_key_id(&access).secret_access_key(&secret);
            }

            let op = Operator::new(builder).map_err(|e| storage_err(node, e))?.finish();
            Ok(with_layers(op))
        }
    }
}

/// Build every shard node in placement order.
pub fn build_node_operators(nodes: &[NodeConfig], enforce_tls: bool) -> TesseraResult<Vec<Operator>> {
    nodes
        .iter()
        .map(|node| build_node_operator(node, enforce_tls))
        .collect()
}
