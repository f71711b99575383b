//! Typed record schemas, one per collection.
//!
//! Known fields are typed and use the camelCase spelling found in exported and legacy data.
//! Anything else a record carries is kept in `extra` so older data survives a
//! load/persist cycle untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::collection::{Collection, ErasedCollection};
use crate::document::DocumentStore;
use crate::{CollectionName, RecordId, StateError};

pub trait Entity: Clone + std::fmt::Debug + PartialEq + Serialize + DeserializeOwned {
    const COLLECTION: CollectionName;

    fn id(&self) -> &RecordId;

    fn collection(store: &DocumentStore) -> &Collection<Self>;

    fn collection_mut(store: &mut DocumentStore) -> &mut Collection<Self>;

    fn into_record(self) -> Record;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Customer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(CollectionName::Customers.id_prefix()),
            name: name.into(),
            phone: None,
            national_id: None,
            address: None,
            status: None,
            notes: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub unit_type: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub area: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Unit {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(CollectionName::Units.id_prefix()),
            name: name.into(),
            code: None,
            building: None,
            floor: None,
            unit_type: None,
            area: None,
            price: None,
            status: None,
            notes: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub share_percentage: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPartner {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<RecordId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub percent: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<RecordId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<RecordId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerDebt {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<RecordId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Safe {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::number_or_zero")]
    pub balance: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_safe_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_safe_id: Option<RecordId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One immutable entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub description: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: RecordId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub voucher_type: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<RecordId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerDue {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<RecordId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broker {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::number"
    )]
    pub commission_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerGroup {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! entities {
    ($($variant:ident => $field:ident, $collection:ident;)+) => {
        /// Any record of any collection.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        pub enum Record {
            $($variant($variant),)+
        }

        impl Record {
            #[must_use]
            pub fn collection(&self) -> CollectionName {
                match self {
                    $(Self::$variant(_) => CollectionName::$collection,)+
                }
            }

            #[must_use]
            pub fn id(&self) -> &RecordId {
                match self {
                    $(Self::$variant(record) => &record.id,)+
                }
            }

            /// Decode a plain JSON value as a record of `collection`.
            ///
            /// # Errors
            /// Returns [`StateError::Decode`] when the value does not match the collection schema.
            pub fn from_value(collection: CollectionName, value: Value) -> Result<Self, StateError> {
                match collection {
                    $(CollectionName::$collection => decode::<$variant>(value).map(Self::$variant),)+
                }
            }

            /// # Errors
            /// Returns [`StateError::Decode`] when serialization fails.
            pub fn to_value(&self) -> Result<Value, StateError> {
                serde_json::to_value(self).map_err(|err| StateError::Decode {
                    key: self.collection().as_str().to_string(),
                    message: err.to_string(),
                })
            }
        }

        $(
            impl Entity for $variant {
                const COLLECTION: CollectionName = CollectionName::$collection;

                fn id(&self) -> &RecordId {
                    &self.id
                }

                fn collection(store: &DocumentStore) -> &Collection<Self> {
                    &store.$field
                }

                fn collection_mut(store: &mut DocumentStore) -> &mut Collection<Self> {
                    &mut store.$field
                }

                fn into_record(self) -> Record {
                    Record::$variant(self)
                }
            }
        )+

        impl DocumentStore {
            pub(crate) fn erased(&self, name: CollectionName) -> &dyn ErasedCollection {
                match name {
                    $(CollectionName::$collection => &self.$field,)+
                }
            }

            pub(crate) fn erased_mut(&mut self, name: CollectionName) -> &mut dyn ErasedCollection {
                match name {
                    $(CollectionName::$collection => &mut self.$field,)+
                }
            }
        }
    };
}

entities! {
    Customer => customers, Customers;
    Unit => units, Units;
    Partner => partners, Partners;
    UnitPartner => unit_partners, UnitPartners;
    Contract => contracts, Contracts;
    Installment => installments, Installments;
    PartnerDebt => partner_debts, PartnerDebts;
    Safe => safes, Safes;
    Transfer => transfers, Transfers;
    AuditRecord => audit_log, AuditLog;
    Voucher => vouchers, Vouchers;
    BrokerDue => broker_dues, BrokerDues;
    Broker => brokers, Brokers;
    PartnerGroup => partner_groups, PartnerGroups;
}

pub(crate) fn decode<T: Entity>(value: Value) -> Result<T, StateError> {
    serde_json::from_value(value).map_err(|err| StateError::Decode {
        key: T::COLLECTION.as_str().to_string(),
        message: err.to_string(),
    })
}

/// Amounts typed into forms were historically stored as strings ("1,500", "", "250.5").
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.and_then(|value| parse(&value)))
    }

    pub fn number_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        number(deserializer).map(|value| value.unwrap_or(0.0))
    }

    fn parse(value: &Value) -> Option<f64> {
        match value {
            Value::Number(number) => number.as_f64(),
            Value::String(raw) => {
                let digits =
                    raw.chars().filter(|ch| ch.is_ascii_digit() || *ch == '.').collect::<String>();
                if digits.is_empty() {
                    None
                } else {
                    digits.parse::<f64>().ok()
                }
            }
            _ => None,
        }
    }
}
