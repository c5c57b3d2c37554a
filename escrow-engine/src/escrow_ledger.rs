//! Escrow ledger
//!
//! Drives the `pending -> released | refunded` state machine from the
//! marketplace actions that trigger it: accepting an offer, confirming
//! completion, and resolving a dispute. Authorization is checked here;
//! the balance effects of each transition are one store call so they
//! commit or roll back together.

use crate::{
    error::EscrowError,
    ledger::Amount,
    models::{
        require_claims, Dispute, DisputeResolution, DisputeStatus, EscrowBalance, EscrowStatus,
        TaskStatus, UserClaims,
    },
    store::{EscrowHold, EscrowSettlement, LedgerStore, SettlementTrigger},
    wallet_store::WalletStore,
    EscrowResult,
};
use std::sync::Arc;
use tracing::info;

pub struct EscrowLedger {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletStore>,
}

impl EscrowLedger {
    pub fn new(store: Arc<dyn LedgerStore>, wallets: Arc<WalletStore>) -> Self {
        Self { store, wallets }
    }

    /// Accept an offer: hold its price in escrow and start the task
    pub async fn accept_offer(
        &self,
        claims: Option<&UserClaims>,
        offer_id: i64,
    ) -> EscrowResult<EscrowBalance> {
        let claims = require_claims(claims)?;
        let offer = self
            .store
            .offer(offer_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("offer {}", offer_id)))?;
        let task = self
            .store
            .task(offer.task_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("task {}", offer.task_id)))?;

        if task.client_id != claims.user_id {
            return Err(EscrowError::forbidden("only the task's client can accept offers"));
        }
        if !task.status.can_accept_offer() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                TaskStatus::InProgress.as_str(),
                "task is not open",
            ));
        }

        let amount = Amount::new(offer.price, task.currency)?;
        let client_wallet = self
            .wallets
            .get_or_create_wallet(task.client_id, task.currency)
            .await?;
        if client_wallet.balance < amount.value() {
            return Err(EscrowError::insufficient_funds(
                amount.value(),
                client_wallet.balance,
            ));
        }

        let escrow = self
            .store
            .open_escrow(&EscrowHold {
                task_id: task.id,
                offer_id: offer.id,
                client_id: task.client_id,
                freelancer_id: offer.freelancer_id,
                client_wallet_id: client_wallet.id,
                amount,
            })
            .await?;

        info!(
            "Escrow {} opened for task {}: {} {} held from client {}",
            escrow.id, task.id, amount, amount.currency(), task.client_id
        );
        Ok(escrow)
    }

    /// Client confirms the work: release escrow to the freelancer
    pub async fn complete_task(
        &self,
        claims: Option<&UserClaims>,
        task_id: i64,
    ) -> EscrowResult<EscrowBalance> {
        let claims = require_claims(claims)?;
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("task {}", task_id)))?;

        if task.client_id != claims.user_id {
            return Err(EscrowError::forbidden("only the task's client can complete it"));
        }
        if !task.status.can_complete() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                TaskStatus::Completed.as_str(),
                "task is not in progress",
            ));
        }
        if self.store.accepted_offer(task_id).await?.is_none() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                TaskStatus::Completed.as_str(),
                "task has no accepted offer",
            ));
        }

        let escrow = self.escrow_for_task(task_id).await?;
        self.settle(escrow.id, SettlementTrigger::Completion).await
    }

    /// Client or accepted freelancer disputes an in-progress task
    pub async fn open_dispute(
        &self,
        claims: Option<&UserClaims>,
        task_id: i64,
    ) -> EscrowResult<Dispute> {
        let claims = require_claims(claims)?;
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("task {}", task_id)))?;

        let is_client = task.client_id == claims.user_id;
        let is_freelancer = self
            .store
            .accepted_offer(task_id)
            .await?
            .map_or(false, |offer| offer.freelancer_id == claims.user_id);
        if !is_client && !is_freelancer {
            return Err(EscrowError::forbidden(
                "only the client or the accepted freelancer can open a dispute",
            ));
        }

        let dispute = self.store.open_dispute(task_id, claims.user_id).await?;
        info!(
            "Dispute {} opened on task {} by user {}",
            dispute.id, task_id, claims.user_id
        );
        Ok(dispute)
    }

    /// An admin takes ownership of an open dispute
    pub async fn assign_dispute(
        &self,
        claims: Option<&UserClaims>,
        dispute_id: i64,
    ) -> EscrowResult<Dispute> {
        let claims = require_claims(claims)?;
        if !claims.is_admin {
            return Err(EscrowError::forbidden("only admins can take disputes"));
        }
        let dispute = self.store.assign_dispute(dispute_id, claims.user_id).await?;
        info!("Dispute {} assigned to admin {}", dispute_id, claims.user_id);
        Ok(dispute)
    }

    /// The assigned admin settles the escrow in favour of one party
    pub async fn resolve_dispute(
        &self,
        claims: Option<&UserClaims>,
        dispute_id: i64,
        resolution: DisputeResolution,
    ) -> EscrowResult<EscrowBalance> {
        let claims = require_claims(claims)?;
        let dispute = self
            .store
            .dispute(dispute_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("dispute {}", dispute_id)))?;

        if !claims.is_admin || dispute.assigned_admin != Some(claims.user_id) {
            return Err(EscrowError::forbidden(
                "only the assigned admin can resolve this dispute",
            ));
        }
        if dispute.status != DisputeStatus::Open {
            return Err(EscrowError::invalid_state(
                dispute.status.as_str(),
                DisputeStatus::Resolved.as_str(),
                "dispute is not open",
            ));
        }

        let escrow = self.escrow_for_task(dispute.task_id).await?;
        let settled = self
            .settle(
                escrow.id,
                SettlementTrigger::Dispute {
                    dispute_id: dispute.id,
                    resolution,
                    resolver_id: claims.user_id,
                },
            )
            .await?;
        info!(
            "Dispute {} resolved as {} by admin {}",
            dispute_id,
            resolution.as_str(),
            claims.user_id
        );
        Ok(settled)
    }

    pub async fn escrows_for_user(
        &self,
        claims: Option<&UserClaims>,
    ) -> EscrowResult<Vec<EscrowBalance>> {
        let claims = require_claims(claims)?;
        self.store.escrows_for_user(claims.user_id).await
    }

    async fn escrow_for_task(&self, task_id: i64) -> EscrowResult<EscrowBalance> {
        self.store
            .escrow_for_task(task_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("escrow for task {}", task_id)))
    }

    /// Only reachable through `complete_task` and `resolve_dispute`; the
    /// store re-checks the trigger against the locked task row
    async fn settle(
        &self,
        escrow_id: i64,
        trigger: SettlementTrigger,
    ) -> EscrowResult<EscrowBalance> {
        let outcome = trigger.outcome();
        let escrow = self
            .store
            .escrow(escrow_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("escrow {}", escrow_id)))?;
        escrow.status.validate_transition(outcome)?;

        let beneficiary = match outcome {
            EscrowStatus::Released => escrow.freelancer_id,
            _ => escrow.client_id,
        };
        let wallet = self
            .wallets
            .get_or_create_wallet(beneficiary, escrow.currency)
            .await?;

        let settled = self
            .store
            .settle_escrow(&EscrowSettlement {
                escrow_id,
                beneficiary_wallet_id: wallet.id,
                trigger,
            })
            .await?;

        info!(
            "Escrow {} for task {} {}: {} {} to user {}",
            escrow_id,
            escrow.task_id,
            outcome.as_str(),
            escrow.amount,
            escrow.currency,
            beneficiary
        );
        Ok(settled)
    }
}
