use crate::error::{AppError, AppResult};
use crate::models::{
    AuditDraft, AuditRecord, BetSettlementRecord, JurisdictionRule, LedgerEntry, Settlement,
    GENESIS_CHECKSUM,
};
use crate::repositories::{LedgerStore, UnitOfWork};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Result of a successful chain walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub records_checked: usize,
    pub head_checksum: String,
}

/// Audit trail service: appends standalone records and verifies the chain
pub struct AuditService {
    store: Arc<dyn LedgerStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append a record that has no financial mutation attached
    pub async fn record(&self, draft: AuditDraft) -> AppResult<AuditRecord> {
        let mut uow = UnitOfWork::new(draft.action.clone());
        uow.audit.push(draft);
        let receipt = self.store.commit(uow).await?;
        receipt
            .audit_records
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Store("audit append returned no record".to_string()))
    }

    /// Recompute every checksum and link from the genesis marker onward.
    ///
    /// Read-only: a break is reported, never repaired, and does not stop new
    /// writes.
    pub async fn verify_chain(&self) -> AppResult<ChainReport> {
        let records = self.store.audit_records().await?;
        match verify_records(&records) {
            Ok(report) => {
                info!(records = report.records_checked, "Audit chain verified");
                Ok(report)
            }
            Err(e) => {
                error!("Audit chain verification failed: {}", e);
                Err(e)
            }
        }
    }

    /// All records sharing a correlation id, for support lookups
    pub async fn records_for_correlation(&self, correlation_id: Uuid) -> AppResult<Vec<AuditRecord>> {
        Ok(self
            .store
            .audit_records()
            .await?
            .into_iter()
            .filter(|r| r.correlation_id == correlation_id)
            .collect())
    }
}

/// Walk records in sequence order and return the first break
pub fn verify_records(records: &[AuditRecord]) -> AppResult<ChainReport> {
    let mut previous = GENESIS_CHECKSUM.to_string();

    for (index, record) in records.iter().enumerate() {
        let expected_sequence = index as i64 + 1;
        if record.sequence != expected_sequence {
            return Err(AppError::AuditChainBroken {
                sequence: record.sequence,
                reason: format!("expected sequence {}", expected_sequence),
            });
        }
        if record.previous_checksum != previous {
            return Err(AppError::AuditChainBroken {
                sequence: record.sequence,
                reason: "previous checksum does not match the preceding record".to_string(),
            });
        }
        if record.compute_checksum() != record.checksum {
            return Err(AppError::AuditChainBroken {
                sequence: record.sequence,
                reason: "stored checksum does not match record content".to_string(),
            });
        }
        previous = record.checksum.clone();
    }

    Ok(ChainReport {
        records_checked: records.len(),
        head_checksum: previous,
    })
}

// ===== DRAFT BUILDERS =====

/// Audit draft for a batch of ledger movements
pub fn ledger_batch_draft(
    action: &str,
    actor: &str,
    reference: &str,
    entries: &[LedgerEntry],
) -> AuditDraft {
    let items: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "entry_id": e.id.to_string(),
                "type": e.transaction_type.as_str(),
                "debit": e.debit_account.to_string(),
                "credit": e.credit_account.to_string(),
                "amount": e.amount.to_string(),
                "currency": e.currency,
            })
        })
        .collect();

    AuditDraft::new(
        action,
        actor,
        "ledger_batch",
        reference,
        serde_json::json!({ "entries": items }),
    )
}

pub fn rule_version_draft(
    actor: &str,
    rule: &JurisdictionRule,
    previous: Option<&JurisdictionRule>,
) -> AuditDraft {
    AuditDraft::new(
        "rule.version_created",
        actor,
        "jurisdiction_rule",
        rule.id,
        serde_json::json!({
            "country_code": rule.country_code,
            "profile_name": rule.profile_name,
            "version": rule.version,
            "previous_version_id": previous.map(|p| p.id.to_string()),
            "previous_version": previous.map(|p| p.version),
            "change_reason": rule.change_reason,
            "effective_from": rule.effective_from.to_rfc3339(),
        }),
    )
}

pub fn settlement_draft(actor: &str, settlement: &Settlement) -> AuditDraft {
    AuditDraft::new(
        "settlement.completed",
        actor,
        "settlement",
        settlement.id,
        serde_json::json!({
            "beneficiary_id": settlement.beneficiary_id.to_string(),
            "period_start": settlement.period_start.to_rfc3339(),
            "period_end": settlement.period_end.to_rfc3339(),
            "ggr": settlement.ggr.to_string(),
            "gross_amount": settlement.gross_amount.to_string(),
            "net_amount": settlement.net_amount.to_string(),
            "rule_version": settlement.rule_version,
        }),
    )
}

pub fn bet_settlement_draft(actor: &str, record: &BetSettlementRecord) -> AuditDraft {
    AuditDraft::new(
        "bet.settled",
        actor,
        "bet",
        record.bet_id,
        serde_json::json!({
            "result": record.result.as_str(),
            "stake": record.stake.to_string(),
            "payout": record.payout.to_string(),
            "net_win": record.net_win.to_string(),
            "total_deducted": record.total_deducted.to_string(),
            "rule_id": record.rule_id.map(|id| id.to_string()),
            "rule_version": record.rule_version,
        }),
    )
}
