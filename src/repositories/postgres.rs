//! Postgres-backed `LedgerStore`.
//!
//! One database transaction per `UnitOfWork`. Wallet and system-account rows
//! are updated with a version predicate, and audit appends take a
//! transaction-scoped advisory lock so the chain has a single writer.

use super::{CommitReceipt, LedgerStore, UnitOfWork};
use crate::error::StoreError;
use crate::models::{
    AccountRef, AuditRecord, BetResult, BetSettlementRecord, Direction, EntryStatus,
    JurisdictionRule, LedgerEntry, LedgerTotals, OwnerType, RuleStatus, Settlement,
    SettlementKey, SettlementPeriod, SettlementStatus, SettlementType, SystemAccount,
    SystemAccountCode, TransactionLog, TransactionType, Wager, WagerKind, Wallet, WalletStatus,
    GENESIS_CHECKSUM,
};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

/// Advisory lock key that serialises audit-log appends
const AUDIT_APPEND_LOCK: i64 = 0x4c45_4447_4155_4454;

const WALLET_COLUMNS: &str = "w.id, w.tenant_id, w.currency, w.available_balance, \
     w.locked_balance, w.status, w.version, w.created_at, w.updated_at";

const LEDGER_COLUMNS: &str = "id, sequence, tenant_id, debit_kind, debit_id, credit_kind, \
     credit_id, amount, currency, transaction_type, reference, description, \
     debit_balance_before, debit_balance_after, credit_balance_before, credit_balance_after, \
     status, reverses_entry_id, fiscal_year, fiscal_period, created_by, created_at";

const RULE_COLUMNS: &str = "id, country_code, profile_name, version, status, \
     player_deductions, operator_deductions, limits, features, commission, effective_from, \
     effective_to, previous_version_id, created_by, change_reason, created_at";

const SETTLEMENT_COLUMNS: &str = "id, tenant_id, beneficiary_id, settlement_type, \
     period_start, period_end, currency, total_stake, total_payout, ggr, commission_rate, \
     gross_amount, deductions, net_amount, status, rule_id, rule_version, ledger_entry_ids, \
     created_by, approved_by, approved_at, processed_at, completed_at, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // Commit steps
    // =========================================================================

    async fn write_wallets(
        tx: &mut Transaction<'_, Postgres>,
        uow: &UnitOfWork,
    ) -> Result<(), StoreError> {
        for write in &uow.wallet_writes {
            let wallet = &write.wallet;
            let result = sqlx::query(
                r#"
                UPDATE wallets
                SET available_balance = $1, locked_balance = $2, status = $3,
                    version = version + 1, updated_at = NOW()
                WHERE id = $4 AND version = $5
                "#,
            )
            .bind(wallet.available_balance)
            .bind(wallet.locked_balance)
            .bind(wallet.status.as_str())
            .bind(wallet.id)
            .bind(write.expected_version)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "wallet {} changed since version {}",
                    wallet.id, write.expected_version
                )));
            }
        }

        for write in &uow.system_account_writes {
            let result = sqlx::query(
                r#"
                UPDATE system_accounts
                SET balance = $1, version = version + 1, updated_at = NOW()
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(write.account.balance)
            .bind(write.account.id)
            .bind(write.expected_version)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "system account {} changed since version {}",
                    write.account.id, write.expected_version
                )));
            }
        }
        Ok(())
    }

    async fn write_rules(
        tx: &mut Transaction<'_, Postgres>,
        uow: &UnitOfWork,
    ) -> Result<(), StoreError> {
        for archive in &uow.rule_archives {
            let result = sqlx::query(
                r#"
                UPDATE jurisdiction_rules
                SET status = 'archived', effective_to = $1
                WHERE id = $2 AND status = 'active'
                "#,
            )
            .bind(archive.effective_to)
            .bind(archive.rule_id)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "rule {} is no longer active",
                    archive.rule_id
                )));
            }
        }

        for rule in &uow.rule_inserts {
            sqlx::query(
                r#"
                INSERT INTO jurisdiction_rules (
                    id, country_code, profile_name, version, status, player_deductions,
                    operator_deductions, limits, features, commission, effective_from,
                    effective_to, previous_version_id, created_by, change_reason, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(rule.id)
            .bind(&rule.country_code)
            .bind(&rule.profile_name)
            .bind(rule.version)
            .bind(rule.status.as_str())
            .bind(Json(&rule.player_deductions))
            .bind(Json(&rule.operator_deductions))
            .bind(Json(&rule.limits))
            .bind(Json(&rule.features))
            .bind(Json(&rule.commission))
            .bind(rule.effective_from)
            .bind(rule.effective_to)
            .bind(rule.previous_version_id)
            .bind(&rule.created_by)
            .bind(&rule.change_reason)
            .bind(rule.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_records(
        tx: &mut Transaction<'_, Postgres>,
        uow: &UnitOfWork,
    ) -> Result<(), StoreError> {
        for s in &uow.settlements {
            let result = sqlx::query(
                r#"
                INSERT INTO settlements (
                    id, tenant_id, beneficiary_id, settlement_type, period_start, period_end,
                    currency, total_stake, total_payout, ggr, commission_rate, gross_amount,
                    deductions, net_amount, status, rule_id, rule_version, ledger_entry_ids,
                    created_by, approved_by, approved_at, processed_at, completed_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                        $16, $17, $18, $19, $20, $21, $22, $23, $24)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    deductions = EXCLUDED.deductions,
                    net_amount = EXCLUDED.net_amount,
                    ledger_entry_ids = EXCLUDED.ledger_entry_ids,
                    approved_by = EXCLUDED.approved_by,
                    approved_at = EXCLUDED.approved_at,
                    processed_at = EXCLUDED.processed_at,
                    completed_at = EXCLUDED.completed_at
                WHERE settlements.status <> 'completed'
                "#,
            )
            .bind(s.id)
            .bind(s.tenant_id)
            .bind(s.beneficiary_id)
            .bind(s.settlement_type.as_str())
            .bind(s.period_start)
            .bind(s.period_end)
            .bind(&s.currency)
            .bind(s.total_stake)
            .bind(s.total_payout)
            .bind(s.ggr)
            .bind(s.commission_rate)
            .bind(s.gross_amount)
            .bind(Json(&s.deductions))
            .bind(s.net_amount)
            .bind(s.status.as_str())
            .bind(s.rule_id)
            .bind(s.rule_version)
            .bind(&s.ledger_entry_ids)
            .bind(&s.created_by)
            .bind(&s.approved_by)
            .bind(s.approved_at)
            .bind(s.processed_at)
            .bind(s.completed_at)
            .bind(s.created_at)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "settlement {} is completed and frozen",
                    s.id
                )));
            }
        }

        for b in &uow.bet_settlements {
            sqlx::query(
                r#"
                INSERT INTO bet_settlements (
                    bet_id, tenant_id, user_id, result, stake, payout, gross_win,
                    total_deducted, net_win, amount_credited, deductions, rule_id,
                    rule_version, ledger_entry_ids, settled_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(b.bet_id)
            .bind(b.tenant_id)
            .bind(b.user_id)
            .bind(b.result.as_str())
            .bind(b.stake)
            .bind(b.payout)
            .bind(b.gross_win)
            .bind(b.total_deducted)
            .bind(b.net_win)
            .bind(b.amount_credited)
            .bind(Json(&b.deductions))
            .bind(b.rule_id)
            .bind(b.rule_version)
            .bind(&b.ledger_entry_ids)
            .bind(b.settled_at)
            .execute(&mut **tx)
            .await?;
        }

        for w in &uow.wagers {
            sqlx::query(
                r#"
                INSERT INTO wagers (id, kind, tenant_id, player_id, currency, stake, payout, settled_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(w.id)
            .bind(w.kind.as_str())
            .bind(w.tenant_id)
            .bind(w.player_id)
            .bind(&w.currency)
            .bind(w.stake)
            .bind(w.payout)
            .bind(w.settled_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_ledger(
        tx: &mut Transaction<'_, Postgres>,
        uow: &UnitOfWork,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut committed = Vec::with_capacity(uow.ledger_entries.len());
        for entry in &uow.ledger_entries {
            let row = sqlx::query(
                r#"
                INSERT INTO ledger_entries (
                    id, tenant_id, debit_kind, debit_id, credit_kind, credit_id, amount,
                    currency, transaction_type, reference, description, debit_balance_before,
                    debit_balance_after, credit_balance_before, credit_balance_after, status,
                    reverses_entry_id, fiscal_year, fiscal_period, created_by, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                        $16, $17, $18, $19, $20, $21)
                RETURNING sequence
                "#,
            )
            .bind(entry.id)
            .bind(entry.tenant_id)
            .bind(entry.debit_account.kind())
            .bind(entry.debit_account.id())
            .bind(entry.credit_account.kind())
            .bind(entry.credit_account.id())
            .bind(entry.amount)
            .bind(&entry.currency)
            .bind(entry.transaction_type.as_str())
            .bind(&entry.reference)
            .bind(&entry.description)
            .bind(entry.debit_balance_before)
            .bind(entry.debit_balance_after)
            .bind(entry.credit_balance_before)
            .bind(entry.credit_balance_after)
            .bind(entry.status.as_str())
            .bind(entry.reverses_entry_id)
            .bind(entry.fiscal_year)
            .bind(entry.fiscal_period)
            .bind(&entry.created_by)
            .bind(entry.created_at)
            .fetch_one(&mut **tx)
            .await?;

            let mut stored = entry.clone();
            stored.sequence = row.try_get("sequence")?;
            committed.push(stored);
        }

        for t in &uow.transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (
                    id, ledger_entry_id, account_kind, account_id, direction,
                    transaction_type, amount, balance_before, balance_after, reference, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(t.id)
            .bind(t.ledger_entry_id)
            .bind(t.account.kind())
            .bind(t.account.id())
            .bind(t.direction.as_str())
            .bind(t.transaction_type.as_str())
            .bind(t.amount)
            .bind(t.balance_before)
            .bind(t.balance_after)
            .bind(&t.reference)
            .bind(t.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(committed)
    }

    async fn append_audit(
        tx: &mut Transaction<'_, Postgres>,
        uow: UnitOfWork,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        if uow.audit.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_APPEND_LOCK)
            .execute(&mut **tx)
            .await?;

        let last = sqlx::query(
            "SELECT sequence, checksum FROM audit_log ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut **tx)
        .await?;

        let (mut sequence, mut previous) = match last {
            Some(row) => (row.try_get::<i64, _>("sequence")?, row.try_get::<String, _>("checksum")?),
            None => (0, GENESIS_CHECKSUM.to_string()),
        };

        // Postgres keeps microseconds; seal with the value that will be read back
        let now = Utc::now();
        let now = now
            .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);

        let mut sealed = Vec::with_capacity(uow.audit.len());
        for draft in uow.audit {
            sequence += 1;
            let record = draft.seal(sequence, &previous, now);
            sqlx::query(
                r#"
                INSERT INTO audit_log (
                    sequence, action, actor, entity_type, entity_id, correlation_id,
                    payload, previous_checksum, checksum, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(record.sequence)
            .bind(&record.action)
            .bind(&record.actor)
            .bind(&record.entity_type)
            .bind(&record.entity_id)
            .bind(record.correlation_id)
            .bind(Json(&record.payload))
            .bind(&record.previous_checksum)
            .bind(&record.checksum)
            .bind(record.created_at)
            .execute(&mut **tx)
            .await?;

            previous = record.checksum.clone();
            sealed.push(record);
        }
        Ok(sealed)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn invalid(e: String) -> StoreError {
    StoreError::InvalidData(e)
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet, StoreError> {
    Ok(Wallet {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        currency: row.try_get("currency")?,
        available_balance: row.try_get("available_balance")?,
        locked_balance: row.try_get("locked_balance")?,
        status: WalletStatus::from_str(row.try_get("status")?).map_err(invalid)?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn system_account_from_row(row: &PgRow) -> Result<SystemAccount, StoreError> {
    Ok(SystemAccount {
        id: row.try_get("id")?,
        code: SystemAccountCode::from_str(row.try_get("code")?).map_err(invalid)?,
        tenant_id: row.try_get("tenant_id")?,
        country_code: row.try_get("country_code")?,
        currency: row.try_get("currency")?,
        balance: row.try_get("balance")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ledger_entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        sequence: row.try_get("sequence")?,
        tenant_id: row.try_get("tenant_id")?,
        debit_account: AccountRef::from_parts(row.try_get("debit_kind")?, row.try_get("debit_id")?)
            .map_err(invalid)?,
        credit_account: AccountRef::from_parts(
            row.try_get("credit_kind")?,
            row.try_get("credit_id")?,
        )
        .map_err(invalid)?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        transaction_type: TransactionType::from_str(row.try_get("transaction_type")?)
            .map_err(invalid)?,
        reference: row.try_get("reference")?,
        description: row.try_get("description")?,
        debit_balance_before: row.try_get("debit_balance_before")?,
        debit_balance_after: row.try_get("debit_balance_after")?,
        credit_balance_before: row.try_get("credit_balance_before")?,
        credit_balance_after: row.try_get("credit_balance_after")?,
        status: EntryStatus::from_str(row.try_get("status")?).map_err(invalid)?,
        reverses_entry_id: row.try_get("reverses_entry_id")?,
        fiscal_year: row.try_get("fiscal_year")?,
        fiscal_period: row.try_get("fiscal_period")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionLog, StoreError> {
    Ok(TransactionLog {
        id: row.try_get("id")?,
        ledger_entry_id: row.try_get("ledger_entry_id")?,
        account: AccountRef::from_parts(row.try_get("account_kind")?, row.try_get("account_id")?)
            .map_err(invalid)?,
        direction: Direction::from_str(row.try_get("direction")?).map_err(invalid)?,
        transaction_type: TransactionType::from_str(row.try_get("transaction_type")?)
            .map_err(invalid)?,
        amount: row.try_get("amount")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        reference: row.try_get("reference")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rule_from_row(row: &PgRow) -> Result<JurisdictionRule, StoreError> {
    Ok(JurisdictionRule {
        id: row.try_get("id")?,
        country_code: row.try_get("country_code")?,
        profile_name: row.try_get("profile_name")?,
        version: row.try_get("version")?,
        status: RuleStatus::from_str(row.try_get("status")?).map_err(invalid)?,
        player_deductions: row.try_get::<Json<_>, _>("player_deductions")?.0,
        operator_deductions: row.try_get::<Json<_>, _>("operator_deductions")?.0,
        limits: row.try_get::<Json<_>, _>("limits")?.0,
        features: row.try_get::<Json<_>, _>("features")?.0,
        commission: row.try_get::<Json<_>, _>("commission")?.0,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
        previous_version_id: row.try_get("previous_version_id")?,
        created_by: row.try_get("created_by")?,
        change_reason: row.try_get("change_reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn settlement_from_row(row: &PgRow) -> Result<Settlement, StoreError> {
    Ok(Settlement {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        beneficiary_id: row.try_get("beneficiary_id")?,
        settlement_type: SettlementType::from_str(row.try_get("settlement_type")?)
            .map_err(invalid)?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        currency: row.try_get("currency")?,
        total_stake: row.try_get("total_stake")?,
        total_payout: row.try_get("total_payout")?,
        ggr: row.try_get("ggr")?,
        commission_rate: row.try_get("commission_rate")?,
        gross_amount: row.try_get("gross_amount")?,
        deductions: row.try_get::<Json<_>, _>("deductions")?.0,
        net_amount: row.try_get("net_amount")?,
        status: SettlementStatus::from_str(row.try_get("status")?).map_err(invalid)?,
        rule_id: row.try_get("rule_id")?,
        rule_version: row.try_get("rule_version")?,
        ledger_entry_ids: row.try_get("ledger_entry_ids")?,
        created_by: row.try_get("created_by")?,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        processed_at: row.try_get("processed_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn bet_settlement_from_row(row: &PgRow) -> Result<BetSettlementRecord, StoreError> {
    Ok(BetSettlementRecord {
        bet_id: row.try_get("bet_id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        result: BetResult::from_str(row.try_get("result")?).map_err(invalid)?,
        stake: row.try_get("stake")?,
        payout: row.try_get("payout")?,
        gross_win: row.try_get("gross_win")?,
        total_deducted: row.try_get("total_deducted")?,
        net_win: row.try_get("net_win")?,
        amount_credited: row.try_get("amount_credited")?,
        deductions: row.try_get::<Json<_>, _>("deductions")?.0,
        rule_id: row.try_get("rule_id")?,
        rule_version: row.try_get("rule_version")?,
        ledger_entry_ids: row.try_get("ledger_entry_ids")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn wager_from_row(row: &PgRow) -> Result<Wager, StoreError> {
    Ok(Wager {
        id: row.try_get("id")?,
        kind: WagerKind::from_str(row.try_get("kind")?).map_err(invalid)?,
        tenant_id: row.try_get("tenant_id")?,
        player_id: row.try_get("player_id")?,
        currency: row.try_get("currency")?,
        stake: row.try_get("stake")?,
        payout: row.try_get("payout")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditRecord, StoreError> {
    Ok(AuditRecord {
        sequence: row.try_get("sequence")?,
        action: row.try_get("action")?,
        actor: row.try_get("actor")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        correlation_id: row.try_get("correlation_id")?,
        payload: row.try_get::<Json<serde_json::Value>, _>("payload")?.0,
        previous_checksum: row.try_get("previous_checksum")?,
        checksum: row.try_get("checksum")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_or_create_wallet(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        tenant_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, StoreError> {
        if let Some(wallet) = self.find_wallet_by_owner(owner_type, owner_id).await? {
            return Ok(wallet);
        }

        let wallet = Wallet::new(tenant_id, currency);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO wallets (id, tenant_id, currency, available_balance, locked_balance,
                                 status, version, created_at, updated_at)
            VALUES ($1, $2, $3, 0, 0, $4, 0, $5, $5)
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.tenant_id)
        .bind(&wallet.currency)
        .bind(wallet.status.as_str())
        .bind(wallet.created_at)
        .execute(&mut *tx)
        .await?;

        let mapped = sqlx::query(
            r#"
            INSERT INTO wallet_owners (owner_type, owner_id, wallet_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (owner_type, owner_id) DO NOTHING
            "#,
        )
        .bind(owner_type.as_str())
        .bind(owner_id)
        .bind(wallet.id)
        .bind(wallet.created_at)
        .execute(&mut *tx)
        .await?;

        if mapped.rows_affected() == 1 {
            tx.commit().await?;
            debug!(wallet_id = %wallet.id, owner_type = owner_type.as_str(), %owner_id, "Created wallet");
            return Ok(wallet);
        }

        // Lost the race: another caller mapped the owner first
        tx.rollback().await?;
        self.find_wallet_by_owner(owner_type, owner_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("wallet for {} {}", owner_type.as_str(), owner_id)))
    }

    async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM wallets w WHERE w.id = $1", WALLET_COLUMNS))
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn find_wallet_by_owner(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets w JOIN wallet_owners o ON o.wallet_id = w.id \
             WHERE o.owner_type = $1 AND o.owner_id = $2",
            WALLET_COLUMNS
        ))
        .bind(owner_type.as_str())
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn get_or_create_system_account(
        &self,
        code: SystemAccountCode,
        tenant_id: Option<Uuid>,
        country_code: Option<&str>,
        currency: &str,
    ) -> Result<SystemAccount, StoreError> {
        let candidate = SystemAccount::new(code, tenant_id, country_code, currency);

        sqlx::query(
            r#"
            INSERT INTO system_accounts (id, code, tenant_id, country_code, currency, balance,
                                         version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, 0, $6, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.code.as_str())
        .bind(candidate.tenant_id)
        .bind(&candidate.country_code)
        .bind(&candidate.currency)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM system_accounts
            WHERE code = $1
              AND tenant_id IS NOT DISTINCT FROM $2
              AND country_code IS NOT DISTINCT FROM $3
              AND currency = $4
            "#,
        )
        .bind(candidate.code.as_str())
        .bind(candidate.tenant_id)
        .bind(&candidate.country_code)
        .bind(&candidate.currency)
        .fetch_one(&self.pool)
        .await?;
        system_account_from_row(&row)
    }

    async fn get_system_account(&self, id: Uuid) -> Result<Option<SystemAccount>, StoreError> {
        let row = sqlx::query("SELECT * FROM system_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(system_account_from_row).transpose()
    }

    async fn list_system_accounts(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<SystemAccount>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM system_accounts WHERE tenant_id IS NOT DISTINCT FROM $1 \
             ORDER BY code, currency",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(system_account_from_row).collect()
    }

    async fn get_ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM ledger_entries WHERE id = $1", LEDGER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ledger_entry_from_row).transpose()
    }

    async fn ledger_entries_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries \
             WHERE (debit_kind = $1 AND debit_id = $2) OR (credit_kind = $1 AND credit_id = $2) \
             ORDER BY sequence",
            LEDGER_COLUMNS
        ))
        .bind(account.kind())
        .bind(account.id())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    async fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE reverses_entry_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ledger_entry_from_row).transpose()
    }

    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ledger_entries WHERE status <> 'failed') AS entry_count,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0) AS total_debits,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0) AS total_credits
            FROM transactions
            WHERE ledger_entry_id IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals {
            entry_count: row.try_get("entry_count")?,
            total_debits: row.try_get::<Decimal, _>("total_debits")?,
            total_credits: row.try_get::<Decimal, _>("total_credits")?,
        })
    }

    async fn transactions_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<TransactionLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE account_kind = $1 AND account_id = $2 \
             ORDER BY created_at",
        )
        .bind(account.kind())
        .bind(account.id())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<JurisdictionRule>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jurisdiction_rules WHERE id = $1", RULE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn find_active_rule(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Option<JurisdictionRule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jurisdiction_rules \
             WHERE country_code = $1 AND profile_name = $2 AND status = 'active'",
            RULE_COLUMNS
        ))
        .bind(country_code.to_uppercase())
        .bind(profile_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn rule_versions(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Vec<JurisdictionRule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jurisdiction_rules \
             WHERE country_code = $1 AND profile_name = $2 ORDER BY version",
            RULE_COLUMNS
        ))
        .bind(country_code.to_uppercase())
        .bind(profile_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn get_settlement(&self, id: Uuid) -> Result<Option<Settlement>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM settlements WHERE id = $1", SETTLEMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    async fn find_settlement(
        &self,
        key: &SettlementKey,
    ) -> Result<Option<Settlement>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlements \
             WHERE beneficiary_id = $1 AND settlement_type = $2 \
               AND period_start = $3 AND period_end = $4",
            SETTLEMENT_COLUMNS
        ))
        .bind(key.beneficiary_id)
        .bind(key.settlement_type.as_str())
        .bind(key.period.start)
        .bind(key.period.end)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    async fn list_settlements(
        &self,
        tenant_id: Uuid,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<Settlement>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM settlements \
             WHERE tenant_id = $1 AND ($2::timestamptz IS NULL OR period_start = $2) \
             ORDER BY created_at",
            SETTLEMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(period_start)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(settlement_from_row).collect()
    }

    async fn find_bet_settlement(
        &self,
        bet_id: Uuid,
    ) -> Result<Option<BetSettlementRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM bet_settlements WHERE bet_id = $1")
            .bind(bet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bet_settlement_from_row).transpose()
    }

    async fn wagers_for_players(
        &self,
        tenant_id: Uuid,
        player_ids: &[Uuid],
        period: &SettlementPeriod,
    ) -> Result<Vec<Wager>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wagers
            WHERE tenant_id = $1 AND player_id = ANY($2)
              AND settled_at >= $3 AND settled_at < $4
            ORDER BY settled_at
            "#,
        )
        .bind(tenant_id)
        .bind(player_ids)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(wager_from_row).collect()
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM audit_log ORDER BY sequence")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;

        Self::write_wallets(&mut tx, &uow).await?;
        Self::write_rules(&mut tx, &uow).await?;
        Self::write_records(&mut tx, &uow).await?;
        let ledger_entries = Self::write_ledger(&mut tx, &uow).await?;
        let label = uow.label.clone();
        let audit_records = Self::append_audit(&mut tx, uow).await?;

        tx.commit().await?;
        debug!(label = %label, entries = ledger_entries.len(), "Committed unit of work");

        Ok(CommitReceipt {
            ledger_entries,
            audit_records,
        })
    }
}
