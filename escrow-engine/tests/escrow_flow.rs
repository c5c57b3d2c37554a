mod common;

use common::Harness;
use escrow_engine::{
    models::{
        Currency, DisputeResolution, DisputeStatus, EscrowStatus, OfferStatus, TaskStatus,
        UserClaims,
    },
    store::{EscrowSettlement, LedgerStore, SettlementTrigger},
};
use rust_decimal_macros::dec;

const CLIENT: i64 = 1;
const FREELANCER: i64 = 2;
const ADMIN: i64 = 90;

struct Accepted {
    task_id: i64,
    escrow_id: i64,
}

async fn accepted_task(h: &Harness) -> Accepted {
    h.funded_wallet(CLIENT, Currency::Btc, "1.0").await;
    let task = h.store.insert_task(CLIENT, "Logo design", Currency::Btc).await;
    let offer = h.store.insert_offer(task.id, FREELANCER, dec!(0.1)).await;
    let escrow = h
        .node
        .escrow()
        .accept_offer(Some(&UserClaims::user(CLIENT)), offer.id)
        .await
        .unwrap();
    Accepted {
        task_id: task.id,
        escrow_id: escrow.id,
    }
}

#[tokio::test]
async fn test_happy_path_release() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;

    let escrow = h.store.escrow(accepted.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Pending);
    assert_eq!(escrow.amount, dec!(0.1));
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(0.9));
    assert_eq!(
        h.store.task(accepted.task_id).await.unwrap().unwrap().status,
        TaskStatus::InProgress
    );

    let released = h
        .node
        .escrow()
        .complete_task(Some(&UserClaims::user(CLIENT)), accepted.task_id)
        .await
        .unwrap();

    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0.1));
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(0.9));
    assert_eq!(
        h.store.task(accepted.task_id).await.unwrap().unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(h.store.completed_tasks(FREELANCER).await.unwrap(), 1);
}

#[tokio::test]
async fn test_accepting_rejects_other_offers() {
    let h = Harness::new();
    h.funded_wallet(CLIENT, Currency::Btc, "1.0").await;
    let task = h.store.insert_task(CLIENT, "Translation", Currency::Btc).await;
    let chosen = h.store.insert_offer(task.id, FREELANCER, dec!(0.2)).await;
    let other = h.store.insert_offer(task.id, 3, dec!(0.15)).await;

    h.node
        .escrow()
        .accept_offer(Some(&UserClaims::user(CLIENT)), chosen.id)
        .await
        .unwrap();

    let chosen = h.store.offer(chosen.id).await.unwrap().unwrap();
    let other = h.store.offer(other.id).await.unwrap().unwrap();
    assert_eq!(chosen.status, OfferStatus::Accepted);
    assert_eq!(other.status, OfferStatus::Rejected);

    let err = h
        .node
        .escrow()
        .accept_offer(Some(&UserClaims::user(CLIENT)), other.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(0.8));
}

#[tokio::test]
async fn test_insufficient_balance_leaves_task_open() {
    let h = Harness::new();
    h.funded_wallet(CLIENT, Currency::Btc, "0.05").await;
    let task = h.store.insert_task(CLIENT, "Website", Currency::Btc).await;
    let offer = h.store.insert_offer(task.id, FREELANCER, dec!(0.1)).await;

    let err = h
        .node
        .escrow()
        .accept_offer(Some(&UserClaims::user(CLIENT)), offer.id)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "insufficient_funds");
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(0.05));
    assert_eq!(
        h.store.task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Open
    );
    assert_eq!(
        h.store.offer(offer.id).await.unwrap().unwrap().status,
        OfferStatus::Pending
    );
    assert!(h.store.escrow_for_task(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dispute_refund_restores_client() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();

    let dispute = ledger
        .open_dispute(Some(&UserClaims::user(FREELANCER)), accepted.task_id)
        .await
        .unwrap();
    assert_eq!(
        h.store.task(accepted.task_id).await.unwrap().unwrap().status,
        TaskStatus::Disputed
    );

    ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN)), dispute.id)
        .await
        .unwrap();
    let refunded = ledger
        .resolve_dispute(
            Some(&UserClaims::admin(ADMIN)),
            dispute.id,
            DisputeResolution::ClientWon,
        )
        .await
        .unwrap();

    assert_eq!(refunded.status, EscrowStatus::Refunded);
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(1.0));
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0));
    assert_eq!(h.store.completed_tasks(FREELANCER).await.unwrap(), 0);

    let dispute = h.store.dispute(dispute.id).await.unwrap().unwrap();
    assert_eq!(dispute.status, DisputeStatus::Resolved);
    assert_eq!(dispute.resolution, Some(DisputeResolution::ClientWon));

    let err = ledger
        .resolve_dispute(
            Some(&UserClaims::admin(ADMIN)),
            dispute.id,
            DisputeResolution::FreelancerWon,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0));
}

#[tokio::test]
async fn test_dispute_won_by_freelancer_releases() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();

    let dispute = ledger
        .open_dispute(Some(&UserClaims::user(CLIENT)), accepted.task_id)
        .await
        .unwrap();
    ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN)), dispute.id)
        .await
        .unwrap();
    let released = ledger
        .resolve_dispute(
            Some(&UserClaims::admin(ADMIN)),
            dispute.id,
            DisputeResolution::FreelancerWon,
        )
        .await
        .unwrap();

    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0.1));
    assert_eq!(h.store.completed_tasks(FREELANCER).await.unwrap(), 1);
}

#[tokio::test]
async fn test_second_completion_is_rejected() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();
    let client = UserClaims::user(CLIENT);

    ledger
        .complete_task(Some(&client), accepted.task_id)
        .await
        .unwrap();
    let client_after = h.balance(CLIENT, Currency::Btc).await;
    let freelancer_after = h.balance(FREELANCER, Currency::Btc).await;

    let err = ledger
        .complete_task(Some(&client), accepted.task_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    let err = ledger
        .open_dispute(Some(&client), accepted.task_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    assert_eq!(h.balance(CLIENT, Currency::Btc).await, client_after);
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, freelancer_after);
}

#[tokio::test]
async fn test_open_dispute_blocks_completion() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();

    let dispute = ledger
        .open_dispute(Some(&UserClaims::user(FREELANCER)), accepted.task_id)
        .await
        .unwrap();
    let err = ledger
        .complete_task(Some(&UserClaims::user(CLIENT)), accepted.task_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    assert_eq!(
        h.store.escrow(accepted.escrow_id).await.unwrap().unwrap().status,
        EscrowStatus::Pending
    );
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0));
    assert_eq!(
        h.store.dispute(dispute.id).await.unwrap().unwrap().status,
        DisputeStatus::Open
    );
}

#[tokio::test]
async fn test_completion_rechecks_task_at_settlement() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let freelancer_wallet = h.funded_wallet(FREELANCER, Currency::Btc, "0").await;

    // A dispute lands after the client's completion request passed its checks
    h.node
        .escrow()
        .open_dispute(Some(&UserClaims::user(FREELANCER)), accepted.task_id)
        .await
        .unwrap();
    let err = h
        .store
        .settle_escrow(&EscrowSettlement {
            escrow_id: accepted.escrow_id,
            beneficiary_wallet_id: freelancer_wallet.id,
            trigger: SettlementTrigger::Completion,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    assert_eq!(
        h.store.escrow(accepted.escrow_id).await.unwrap().unwrap().status,
        EscrowStatus::Pending
    );
    assert_eq!(
        h.store.task(accepted.task_id).await.unwrap().unwrap().status,
        TaskStatus::Disputed
    );
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0));
}

#[tokio::test]
async fn test_completion_racing_dispute_settles_one_way() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();
    let client = UserClaims::user(CLIENT);
    let freelancer = UserClaims::user(FREELANCER);

    let (completed, disputed) = tokio::join!(
        ledger.complete_task(Some(&client), accepted.task_id),
        ledger.open_dispute(Some(&freelancer), accepted.task_id),
    );

    let escrow = h.store.escrow(accepted.escrow_id).await.unwrap().unwrap();
    match (completed, disputed) {
        (Ok(released), Err(err)) => {
            assert_eq!(err.kind(), "invalid_state");
            assert_eq!(released.status, EscrowStatus::Released);
            assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0.1));
        }
        (Err(err), Ok(dispute)) => {
            assert_eq!(err.kind(), "invalid_state");
            assert_eq!(escrow.status, EscrowStatus::Pending);
            assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0));
            assert_eq!(
                h.store.dispute(dispute.id).await.unwrap().unwrap().status,
                DisputeStatus::Open
            );
        }
        other => panic!("Expected exactly one side to win, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dispute_settlement_requires_assigned_resolver() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let client_wallet = h.funded_wallet(CLIENT, Currency::Btc, "0").await;
    let ledger = h.node.escrow();

    let dispute = ledger
        .open_dispute(Some(&UserClaims::user(CLIENT)), accepted.task_id)
        .await
        .unwrap();
    ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN)), dispute.id)
        .await
        .unwrap();

    let err = h
        .store
        .settle_escrow(&EscrowSettlement {
            escrow_id: accepted.escrow_id,
            beneficiary_wallet_id: client_wallet.id,
            trigger: SettlementTrigger::Dispute {
                dispute_id: dispute.id,
                resolution: DisputeResolution::ClientWon,
                resolver_id: ADMIN + 1,
            },
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let err = h
        .store
        .settle_escrow(&EscrowSettlement {
            escrow_id: accepted.escrow_id,
            beneficiary_wallet_id: client_wallet.id,
            trigger: SettlementTrigger::Completion,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    assert_eq!(
        h.store.escrow(accepted.escrow_id).await.unwrap().unwrap().status,
        EscrowStatus::Pending
    );
    assert_eq!(h.balance(CLIENT, Currency::Btc).await, dec!(0.9));
}

#[tokio::test]
async fn test_escrow_conserves_totals() {
    let h = Harness::new();
    h.funded_wallet(CLIENT, Currency::Btc, "1.0").await;
    h.funded_wallet(FREELANCER, Currency::Btc, "0.3").await;
    let before = h.store.ledger_totals(Currency::Btc).await.unwrap();
    assert_eq!(before.total(), dec!(1.3));

    let task = h.store.insert_task(CLIENT, "Audit", Currency::Btc).await;
    let offer = h.store.insert_offer(task.id, FREELANCER, dec!(0.25)).await;
    h.node
        .escrow()
        .accept_offer(Some(&UserClaims::user(CLIENT)), offer.id)
        .await
        .unwrap();

    let held = h.store.ledger_totals(Currency::Btc).await.unwrap();
    assert_eq!(held.escrow_held, dec!(0.25));
    assert_eq!(held.total(), before.total());

    h.node
        .escrow()
        .complete_task(Some(&UserClaims::user(CLIENT)), task.id)
        .await
        .unwrap();

    let after = h.store.ledger_totals(Currency::Btc).await.unwrap();
    assert_eq!(after.escrow_held, dec!(0));
    assert_eq!(after.total(), before.total());
    assert_eq!(h.balance(FREELANCER, Currency::Btc).await, dec!(0.55));
}

#[tokio::test]
async fn test_only_assigned_admin_resolves() {
    let h = Harness::new();
    let accepted = accepted_task(&h).await;
    let ledger = h.node.escrow();

    let dispute = ledger
        .open_dispute(Some(&UserClaims::user(CLIENT)), accepted.task_id)
        .await
        .unwrap();

    let err = ledger
        .assign_dispute(Some(&UserClaims::user(CLIENT)), dispute.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN)), dispute.id)
        .await
        .unwrap();
    let err = ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN + 1)), dispute.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    let kept = ledger
        .assign_dispute(Some(&UserClaims::admin(ADMIN)), dispute.id)
        .await
        .unwrap();
    assert_eq!(kept.assigned_admin, Some(ADMIN));

    let err = ledger
        .resolve_dispute(
            Some(&UserClaims::admin(ADMIN + 1)),
            dispute.id,
            DisputeResolution::ClientWon,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    assert_eq!(
        h.store.escrow(accepted.escrow_id).await.unwrap().unwrap().status,
        EscrowStatus::Pending
    );
}

#[tokio::test]
async fn test_callers_are_authorized() {
    let h = Harness::new();
    h.funded_wallet(CLIENT, Currency::Btc, "1.0").await;
    let task = h.store.insert_task(CLIENT, "Video edit", Currency::Btc).await;
    let offer = h.store.insert_offer(task.id, FREELANCER, dec!(0.1)).await;
    let ledger = h.node.escrow();

    let err = ledger.accept_offer(None, offer.id).await.unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    let err = ledger
        .accept_offer(Some(&UserClaims::user(FREELANCER)), offer.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    ledger
        .accept_offer(Some(&UserClaims::user(CLIENT)), offer.id)
        .await
        .unwrap();

    let err = ledger
        .complete_task(Some(&UserClaims::user(FREELANCER)), task.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let err = ledger
        .open_dispute(Some(&UserClaims::user(77)), task.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    ledger
        .open_dispute(Some(&UserClaims::user(CLIENT)), task.id)
        .await
        .unwrap();
    let err = ledger
        .open_dispute(Some(&UserClaims::user(FREELANCER)), task.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    let err = ledger
        .complete_task(Some(&UserClaims::user(CLIENT)), task.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    let escrows = ledger
        .escrows_for_user(Some(&UserClaims::user(FREELANCER)))
        .await
        .unwrap();
    assert_eq!(escrows.len(), 1);
    assert_eq!(escrows[0].status, EscrowStatus::Pending);
}
