pub mod audit;
pub mod enforcement;
pub mod locks;
pub mod rule_engine;
pub mod settlement;
pub mod wallet_service;

pub use audit::{verify_records, AuditService, ChainReport};
pub use enforcement::{
    BetSettlementOutcome, CasinoRoundOutcome, EnforcementEngine, PlacementOutcome,
};
pub use locks::{LockKey, LockManager, LockSet};
pub use rule_engine::{DeductionInputs, PlacementValidation, RuleEngine};
pub use settlement::{
    AgentFailure, AgentGgr, CommissionPreview, SettlementOutcome, SettlementRunReport,
    SettlementService, SkipReason,
};
pub use wallet_service::{
    float_shortfall, BatchOutcome, Funds, Leg, LockRelease, Movement, PreparedBatch,
    TransferBatch, UnlockOutcome, WalletReconciliation, WalletService,
};
