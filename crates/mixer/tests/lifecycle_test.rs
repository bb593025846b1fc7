use std::str::FromStr;
use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use mixer::chain::ProofSubmission;
use mixer::clock::Clock;
use mixer::config::GRACE_PERIOD_DAYS;
use mixer::custodian::KeyCustodian;
use mixer::master_keys::MasterKeyBundle;
use mixer::model::{ClaimStatus, DisputeStatus, MixTxStatus, RequestStatus};
use mixer::store::{MemoryStore, Store};
use mixer::testing::{create_body, Harness, MockChain, ACCOUNT};
use mixer::{ContractEvent, Mixer, MixerError};
use mixer_sdk::api::TargetSpec;
use mixer_sdk::client::verify_completion_proof;
use mixer_sdk::crypto::seal_targets;
use mixer_sdk::merkle::{completion_digest, decode_node};

#[tokio::test]
async fn test_claim_only_after_deadline_and_only_once() {
    let h = Harness::new().await;
    let request = h.mixing_request("1000", &[("target-a", "995")]).await;

    let err = h
        .service
        .create_withdrawal_claim(ACCOUNT, &request.id, "refund-addr")
        .await
        .unwrap_err();
    assert!(matches!(err, MixerError::NotWithdrawable(deadline) if deadline == request.deadline));

    h.clock.set(request.deadline);
    let claim = h
        .service
        .create_withdrawal_claim(ACCOUNT, &request.id, "refund-addr")
        .await
        .unwrap();
    assert_eq!(claim.amount, 1000);
    assert_eq!(claim.status, ClaimStatus::Pending);

    let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Withdrawable);
    let scheduled = h
        .store
        .list_transactions_for_request(&request.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.status == MixTxStatus::Scheduled)
        .count();
    assert_eq!(scheduled, 0);

    let again = h
        .service
        .create_withdrawal_claim(ACCOUNT, &request.id, "refund-addr")
        .await
        .unwrap_err();
    assert!(matches!(again, MixerError::Conflict(_)));
}

#[tokio::test]
async fn test_refund_pays_claim_from_bond() {
    let h = Harness::new().await;
    let request = h.mixing_request("1000", &[("target-a", "995")]).await;
    h.clock.advance(chrono::Duration::days(GRACE_PERIOD_DAYS) + chrono::Duration::hours(2));

    let report = h.monitor.scan().await.unwrap();
    assert_eq!(report.refund_eligible, vec![request.id.clone()]);

    // the user claims on chain; the contract reports it
    h.service
        .handle_contract_event(ContractEvent::RefundClaimed {
            request_id: request.id.clone(),
            claim_address: "refund-addr".into(),
            refund_tx: "refund-tx-1".into(),
        })
        .await
        .unwrap();

    let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Refunded);
    assert_eq!(stored.refund.as_ref().unwrap().refund_tx, "refund-tx-1");

    let claim = h.store.get_claim_for_request(&request.id).await.unwrap().unwrap();
    assert_eq!(claim.status, ClaimStatus::Paid);

    let reg = h.store.get_registration().await.unwrap().unwrap();
    assert_eq!(reg.bond_amount, h.config.bond_amount - 1000);
    assert_eq!(reg.outstanding_amount, 0);

    // refunded is terminal
    assert!(h.service.process_refund(&request.id, "refund-tx-2").await.is_err());
}

#[tokio::test]
async fn test_claim_rejected_for_completed_request() {
    let h = Harness::new().await;
    let request = h.mixing_request("1000", &[("target-a", "995")]).await;
    h.run_until(&request.id, RequestStatus::Completed, 40).await;

    h.clock.set(request.deadline + chrono::Duration::days(1));
    let err = h
        .service
        .create_withdrawal_claim(ACCOUNT, &request.id, "refund-addr")
        .await
        .unwrap_err();
    assert!(matches!(err, MixerError::Conflict(_)));
}

#[tokio::test]
async fn test_completion_proof_verifies() {
    let h = Harness::new().await;
    let request = h
        .mixing_request("100000", &[("target-a", "60000"), ("target-b", "39000"), ("target-c", "500")])
        .await;
    assert_eq!(request.split_count, 3);

    let done = h.run_until(&request.id, RequestStatus::Completed, 40).await;
    assert_eq!(done.status, RequestStatus::Completed);
    // three parts per target
    assert!(done.targets.iter().all(|t| t.delivery_txs.len() == 3));

    let proof = h.service.get_completion_proof(ACCOUNT, &request.id).await.unwrap();
    assert_eq!(proof.output_count, 3);
    verify_completion_proof(&proof).unwrap();

    let root = decode_node(&proof.merkle_root).unwrap();
    let digest = completion_digest(&root, &proof.request_id, &proof.service_id, proof.timestamp);
    let signer = Pubkey::from_str(&proof.signer).unwrap();
    let signature = Signature::from_str(&proof.signature).unwrap();
    assert!(signature.verify(signer.as_ref(), &digest));
    assert_eq!(proof.signer, h.custodian.public_key());
}

#[tokio::test]
async fn test_dispute_submits_proofs_and_resolves() {
    let h = Harness::new().await;
    let request = h.mixing_request("1000", &[("target-a", "995")]).await;

    // disputes need a completed request
    assert!(matches!(
        h.service.dispute_request(ACCOUNT, &request.id).await,
        Err(MixerError::InvalidState { .. })
    ));

    h.run_until(&request.id, RequestStatus::Completed, 40).await;
    let dispute = h.service.dispute_request(ACCOUNT, &request.id).await.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);
    assert!(dispute.submission_tx.is_some());

    let submissions = h.chain.proof_submissions();
    assert!(matches!(submissions[0], ProofSubmission::Mix { .. }));
    assert!(matches!(submissions[1], ProofSubmission::Completion { output_count: 1, .. }));

    assert!(matches!(
        h.service.dispute_request(ACCOUNT, &request.id).await,
        Err(MixerError::InvalidState { .. })
    ));

    h.service
        .handle_contract_event(ContractEvent::DisputeResolved {
            request_id: request.id.clone(),
            service_at_fault: false,
        })
        .await
        .unwrap();
    let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Resolved);
    assert!(stored.completion_proof.unwrap().submission_tx.is_some());

    let record = h.store.get_dispute(&request.id).await.unwrap().unwrap();
    assert_eq!(record.status, DisputeStatus::Rejected);
    let reg = h.store.get_registration().await.unwrap().unwrap();
    assert_eq!(reg.bond_amount, h.config.bond_amount);
}

#[tokio::test]
async fn test_resume_reschedules_failed_transactions() {
    let h = Harness::new().await;
    let request = h.mixing_request("1000", &[("target-a", "995")]).await;
    h.chain.fail_next_sends(h.config.max_tx_attempts);

    h.run_until(&request.id, RequestStatus::Completed, 12).await;
    let failed = h.store.list_transactions_by_status(MixTxStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 1);

    let resumed = h.service.resume_request(ACCOUNT, &request.id).await.unwrap();
    assert!(resumed.error.is_none());
    assert!(h
        .store
        .list_transactions_by_status(MixTxStatus::Failed)
        .await
        .unwrap()
        .is_empty());

    let done = h.run_until(&request.id, RequestStatus::Completed, 40).await;
    assert_eq!(done.status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_sealed_targets() {
    let h = Harness::new().await;
    let targets = vec![
        TargetSpec {
            address: "hidden-a".into(),
            amount: "600".into(),
        },
        TargetSpec {
            address: "hidden-b".into(),
            amount: "395".into(),
        },
    ];
    let mut body = create_body("1000", &[]);
    body.encrypted_targets = Some(seal_targets(&targets, &h.custodian.encryption_public_key()).unwrap());

    let request = h.service.create_mix_request(ACCOUNT, body).await.unwrap();
    let addresses: Vec<_> = request.targets.iter().map(|t| t.address.as_str()).collect();
    assert_eq!(addresses, vec!["hidden-a", "hidden-b"]);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let config = Harness::test_config();
    let master_keys = || Arc::new(MasterKeyBundle::derive_from_cold_seed(&[7u8; 32], 0, 64).unwrap());
    let custodian = || {
        Arc::new(mixer::custodian::SealedSeedCustodian::new(config.tee_seed.clone()).unwrap())
    };
    let clock = Arc::new(mixer::clock::ManualClock::new(chrono::Utc::now()));

    let first = Mixer::assemble(
        config.clone(),
        Arc::new(MemoryStore::open(&path).unwrap()),
        Arc::new(MockChain::default()),
        custodian(),
        master_keys(),
        clock.clone(),
    )
    .await
    .unwrap();
    let request = first
        .service
        .create_mix_request(ACCOUNT, create_body("1000", &[("target-a", "995")]))
        .await
        .unwrap();
    let pools_before = first.store.list_pools(None).await.unwrap();
    drop(first);

    let second = Mixer::assemble(
        config.clone(),
        Arc::new(MemoryStore::open(&path).unwrap()),
        Arc::new(MockChain::default()),
        custodian(),
        master_keys(),
        clock.clone(),
    )
    .await
    .unwrap();

    let restored = second.service.get_request(ACCOUNT, &request.id).await.unwrap();
    assert_eq!(restored.status, RequestStatus::Pending);
    assert_eq!(restored.deadline, request.deadline);
    assert_eq!(second.store.list_pools(None).await.unwrap().len(), pools_before.len());

    // new pools never reuse an index
    let fresh = second.registry.create_pool_account().await.unwrap();
    assert!(pools_before.iter().all(|p| p.pool_index < fresh.pool_index));

    let reg = second.store.get_registration().await.unwrap().unwrap();
    assert_eq!(reg.outstanding_amount, 1000);
    assert!(clock.now() < restored.deadline);
}
