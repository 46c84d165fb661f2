//! Transaction isolation levels.

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other concurrent transactions.
/// The server default for InnoDB is `RepeatableRead`, which is also what a
/// new session is initialised to when no level is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads, non-repeatable reads and phantoms possible.
    ReadUncommitted,

    /// Read committed: only committed changes from others are visible.
    ReadCommitted,

    /// Repeatable read: consistent snapshot for the whole transaction.
    #[default]
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Value form accepted by the `transaction_isolation` / `tx_isolation`
    /// session variables (`REPEATABLE-READ`).
    #[must_use]
    pub fn as_variable_value(&self) -> String {
        self.as_sql().replace(' ', "-")
    }
}
