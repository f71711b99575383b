//! In-memory application state for the estate back office: the document store, its typed
//! record collections, the snapshot history used for undo/redo, and the audit trail.
//!
//! Everything in this crate is synchronous. Durable storage lives in
//! `estate-state-store-sqlite`; orchestration lives in `estate-state-api`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod audit;
pub mod collection;
pub mod document;
pub mod history;
pub mod records;

pub use audit::{AuditQuery, AuditTrail, AuditView};
pub use collection::Collection;
pub use document::{DocumentStore, Settings, SettingsPatch};
pub use history::{History, DEFAULT_HISTORY_CAPACITY};
pub use records::{
    AuditRecord, Broker, BrokerDue, Contract, Customer, Entity, Installment, Partner,
    PartnerDebt, PartnerGroup, Record, Safe, Transfer, Unit, UnitPartner, Voucher,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate record id {id} in {collection}")]
    DuplicateId { collection: CollectionName, id: RecordId },
    #[error("record {id} not found in {collection}")]
    NotFound { collection: CollectionName, id: RecordId },
    #[error("mutation rejected: {0}")]
    Rejected(String),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("failed to decode {key}: {message}")]
    Decode { key: String, message: String },
}

/// Stable string identifier carried by every record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Mint a fresh identifier of the form `<PREFIX>_<ULID>`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Ulid::new()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CollectionName {
    Customers,
    Units,
    Partners,
    UnitPartners,
    Contracts,
    Installments,
    PartnerDebts,
    Safes,
    Transfers,
    AuditLog,
    Vouchers,
    BrokerDues,
    Brokers,
    PartnerGroups,
}

impl CollectionName {
    pub const ALL: [Self; 14] = [
        Self::Customers,
        Self::Units,
        Self::Partners,
        Self::UnitPartners,
        Self::Contracts,
        Self::Installments,
        Self::PartnerDebts,
        Self::Safes,
        Self::Transfers,
        Self::AuditLog,
        Self::Vouchers,
        Self::BrokerDues,
        Self::Brokers,
        Self::PartnerGroups,
    ];

    /// Key used in exported objects and legacy blobs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Units => "units",
            Self::Partners => "partners",
            Self::UnitPartners => "unitPartners",
            Self::Contracts => "contracts",
            Self::Installments => "installments",
            Self::PartnerDebts => "partnerDebts",
            Self::Safes => "safes",
            Self::Transfers => "transfers",
            Self::AuditLog => "auditLog",
            Self::Vouchers => "vouchers",
            Self::BrokerDues => "brokerDues",
            Self::Brokers => "brokers",
            Self::PartnerGroups => "partnerGroups",
        }
    }

    /// Durable table name for this collection.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Units => "units",
            Self::Partners => "partners",
            Self::UnitPartners => "unit_partners",
            Self::Contracts => "contracts",
            Self::Installments => "installments",
            Self::PartnerDebts => "partner_debts",
            Self::Safes => "safes",
            Self::Transfers => "transfers",
            Self::AuditLog => "audit_log",
            Self::Vouchers => "vouchers",
            Self::BrokerDues => "broker_dues",
            Self::Brokers => "brokers",
            Self::PartnerGroups => "partner_groups",
        }
    }

    #[must_use]
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Customers => "C",
            Self::Units => "U",
            Self::Partners => "P",
            Self::UnitPartners => "UP",
            Self::Contracts => "CO",
            Self::Installments => "I",
            Self::PartnerDebts => "PD",
            Self::Safes => "S",
            Self::Transfers => "T",
            Self::AuditLog => "LOG",
            Self::Vouchers => "V",
            Self::BrokerDues => "BD",
            Self::Brokers => "B",
            Self::PartnerGroups => "PG",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == value || name.table_name() == value)
    }
}

impl Display for CollectionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CollectionName {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| StateError::UnknownCollection(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_parse_from_wire_and_table_spellings() {
        for name in CollectionName::ALL {
            assert_eq!(CollectionName::parse(name.as_str()), Some(name));
            assert_eq!(CollectionName::parse(name.table_name()), Some(name));
        }
        assert_eq!(CollectionName::parse("unit_partners"), Some(CollectionName::UnitPartners));
        assert!("settings".parse::<CollectionName>().is_err());
    }

    #[test]
    fn generated_ids_carry_prefix_and_are_distinct() {
        let a = RecordId::generate("C");
        let b = RecordId::generate("C");
        assert!(a.as_str().starts_with("C_"));
        assert_ne!(a, b);
        assert!(!a.is_blank());
        assert!(RecordId::from("  ").is_blank());
    }
}
