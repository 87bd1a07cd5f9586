//! Batch protect/recover through the bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use opendal::Operator;
use secrecy::SecretString;

use tessera_core::config::PipelineConfig;
use tessera_core::{CipherSuite, TesseraError};
use tessera_crypto::KdfParams;
use tessera_pipeline::{ProtectJob, ProtectOptions, Vault};
use tessera_secrets::MasterKeyManager;
use tessera_storage::ShardStore;

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

async fn vault(dir: &tempfile::TempDir, batch_concurrency: usize) -> Vault {
    let params = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    let master = MasterKeyManager::open(
        &dir.path().join("keys.json"),
        &SecretString::from("batch"),
        &params,
    )
    .await
    .unwrap();
    master.initialize().await.unwrap();

    let nodes = (0..3).map(|_| memory_operator()).collect();
    Vault::new(
        ShardStore::new(nodes, Duration::from_secs(5)).unwrap(),
        memory_operator(),
        Arc::new(master),
        PipelineConfig {
            batch_concurrency,
            ..PipelineConfig::default()
        },
    )
}

fn job(i: usize) -> ProtectJob {
    ProtectJob {
        label: format!("file-{i}.bin"),
        data: vec![i as u8; 1000 + i * 37],
        options: ProtectOptions {
            file_id: Some(format!("batch-{i}")),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn protect_then_recover_many() {
    let dir = tempfile::tempdir().unwrap();
    let v = vault(&dir, 5).await;

    let jobs: Vec<ProtectJob> = (0..12).map(job).collect();
    let protected = v.protect_batch(jobs).await;
    assert_eq!(protected.len(), 12);
    for (i, outcome) in protected.iter().enumerate() {
        assert_eq!(outcome.label, format!("file-{i}.bin"));
        let meta = outcome.result.as_ref().unwrap();
        assert_eq!(meta.file_id, format!("batch-{i}"));
    }
    assert_eq!(v.list_files().await.unwrap().len(), 12);

    let ids = (0..12).map(|i| format!("batch-{i}")).collect();
    let recovered = v.recover_batch(ids, None).await;
    for (i, outcome) in recovered.into_iter().enumerate() {
        assert_eq!(outcome.label, format!("batch-{i}"));
        assert_eq!(outcome.result.unwrap(), vec![i as u8; 1000 + i * 37]);
    }
}

#[tokio::test]
async fn one_bad_file_does_not_sink_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let v = vault(&dir, 2).await;

    let mut jobs: Vec<ProtectJob> = (0..4).map(job).collect();
    jobs[1].options.cipher = Some(CipherSuite::XChaCha20Poly1305);

    let outcomes = v.protect_batch(jobs).await;
    assert!(matches!(outcomes[1].result, Err(TesseraError::Validation(_))));
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 3);

    let ids = vec!["batch-0".to_string(), "batch-1".to_string(), "batch-2".to_string()];
    let recovered = v.recover_batch(ids, None).await;
    assert!(recovered[0].is_ok());
    assert!(matches!(
        recovered[1].result,
        Err(TesseraError::FileNotFound(_))
    ));
    assert!(recovered[2].is_ok());
}

fn job_for(label: &str, file_id: &str, fill: u8) -> ProtectJob {
    ProtectJob {
        label: label.to_string(),
        data: vec![fill; 50_000],
        options: ProtectOptions {
            file_id: Some(file_id.to_string()),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn repeated_file_id_in_a_batch_is_protected_once() {
    let dir = tempfile::tempdir().unwrap();
    let v = vault(&dir, 4).await;

    let outcomes = v
        .protect_batch(vec![
            job_for("first", "same", 1),
            job_for("other", "distinct", 3),
            job_for("second", "same", 2),
        ])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].label, "first");
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    assert_eq!(outcomes[2].label, "second");
    assert!(matches!(outcomes[2].result, Err(TesseraError::Validation(_))));

    assert_eq!(v.recover("same", None).await.unwrap(), vec![1u8; 50_000]);
    assert_eq!(v.list_files().await.unwrap(), vec!["distinct", "same"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_protects_of_one_id_commit_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let v = vault(&dir, 4).await;

    for trial in 0..10 {
        let file_id = format!("race-{trial}");
        let first = job_for("a", &file_id, 1);
        let second = job_for("b", &file_id, 2);
        let (a, b) = tokio::join!(
            v.protect(&first.data, &first.options),
            v.protect(&second.data, &second.options),
        );

        let winner = match (&a, &b) {
            (Ok(_), Err(TesseraError::Validation(_))) => 1u8,
            (Err(TesseraError::Validation(_)), Ok(_)) => 2u8,
            other => panic!("trial {trial}: expected exactly one commit, got {other:?}"),
        };
        assert_eq!(
            v.recover(&file_id, None).await.unwrap(),
            vec![winner; 50_000],
            "trial {trial}"
        );
    }
}
