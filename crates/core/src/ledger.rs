//! Ledger records consumed by the auditors
//!
//! The ledger is produced by the wallet/commission business logic. Auditors
//! only read it; the single write they may perform is `Wallet.balance`
//! during a guarded auto-correction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub type WalletId = i64;
pub type UserId = i64;
pub type TransactionId = i64;

/// Smallest drift that counts as a real mismatch (one cent)
pub fn rounding_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Direction of a transaction relative to its wallet
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    In,
    Out,
}

/// Whether money stays inside the platform or crosses its boundary
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Nature {
    /// Movement between platform wallets (commissions, purchases)
    Internal,
    /// Deposit or withdrawal through a payment gateway
    External,
}

/// Lifecycle status of a ledger transaction
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// `+amount` for inflows, `-amount` for outflows
pub fn signed_amount(amount: Decimal, flow: Flow) -> Decimal {
    match flow {
        Flow::In => amount,
        Flow::Out => -amount,
    }
}

/// A user wallet transaction
///
/// Immutable once `status == Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub flow: Flow,
    pub nature: Nature,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn signed_amount(&self) -> Decimal {
        signed_amount(self.amount, self.flow)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TxStatus::Completed
    }

    /// Completed internal transactions are the ones a wallet balance must equal
    pub fn counts_toward_balance(&self) -> bool {
        self.is_completed() && self.nature == Nature::Internal
    }
}

/// A transaction on the singleton system (merchant) wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemTransaction {
    pub id: TransactionId,
    pub amount: Decimal,
    pub flow: Flow,
    pub nature: Nature,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
}

impl SystemTransaction {
    pub fn signed_amount(&self) -> Decimal {
        signed_amount(self.amount, self.flow)
    }
}

/// Per-user wallet with a cached balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Singleton merchant wallet holding the platform float
///
/// Accounting equation: `solde_marchand == engagement_users + plateforme_benefices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemWallet {
    /// Merchant float held by the platform
    pub solde_marchand: Decimal,
    /// Money owed to users (sum of wallet balances)
    pub engagement_users: Decimal,
    /// Platform profit
    pub plateforme_benefices: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl SystemWallet {
    /// Right-hand side of the accounting equation
    pub fn theoretical_merchant_balance(&self) -> Decimal {
        self.engagement_users + self.plateforme_benefices
    }
}

/// Inbound event: a business transaction was durably committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCompleted {
    pub transaction_id: TransactionId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub flow: Flow,
    pub nature: Nature,
    pub status: TxStatus,
}

impl From<&Transaction> for TransactionCompleted {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            wallet_id: tx.wallet_id,
            amount: tx.amount,
            flow: tx.flow,
            nature: tx.nature,
            status: tx.status,
        }
    }
}
