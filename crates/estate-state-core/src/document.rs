use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::audit::{AuditTrail, AuditView};
use crate::collection::Collection;
use crate::records::{
    AuditRecord, Broker, BrokerDue, Contract, Customer, Entity, Installment, Partner,
    PartnerDebt, PartnerGroup, Record, Safe, Transfer, Unit, UnitPartner, Voucher,
};
use crate::{CollectionName, RecordId, StateError};

pub const DEFAULT_THEME: &str = "dark";
pub const DEFAULT_FONT_SIZE: u32 = 16;

/// Global display and lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub theme: String,
    pub font_size: u32,
    pub password_hash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: DEFAULT_THEME.to_string(),
            font_size: DEFAULT_FONT_SIZE,
            password_hash: None,
            extra: Map::new(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn hash_password(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }

    #[must_use]
    pub fn verify_password(&self, candidate: &str) -> bool {
        match &self.password_hash {
            Some(hash) => *hash == Self::hash_password(candidate),
            None => true,
        }
    }

    /// Merge a loaded settings object field by field; loaded values win.
    ///
    /// Older blobs stored `font` instead of `fontSize` and kept the plain password in
    /// `pass`; the latter is hashed on the way in.
    fn merge_loaded(&mut self, loaded: &Map<String, Value>) -> Result<(), StateError> {
        for (key, value) in loaded {
            match key.as_str() {
                "theme" => {
                    if let Some(theme) = value.as_str() {
                        self.theme = theme.to_string();
                    }
                }
                "fontSize" | "font" => {
                    if let Some(size) = parse_font_size(value) {
                        self.font_size = size;
                    }
                }
                "passwordHash" => {
                    self.password_hash = match value {
                        Value::Null => None,
                        Value::String(hash) => Some(hash.clone()),
                        other => {
                            return Err(StateError::Decode {
                                key: "settings.passwordHash".to_string(),
                                message: format!("expected string or null, got {other}"),
                            })
                        }
                    };
                }
                "pass" => {
                    self.password_hash = value
                        .as_str()
                        .filter(|pass| !pass.is_empty())
                        .map(Self::hash_password);
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

fn parse_font_size(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|size| u32::try_from(size).ok()),
        Value::String(raw) => raw.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Partial settings update applied through [`DocumentStore::update_settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub theme: Option<String>,
    pub font_size: Option<u32>,
    /// `Some(None)` removes the password, `Some(Some(plain))` sets a new one.
    pub password: Option<Option<String>>,
}

/// The single in-memory state tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentStore {
    settings: Settings,
    locked: bool,
    pub(crate) customers: Collection<Customer>,
    pub(crate) units: Collection<Unit>,
    pub(crate) partners: Collection<Partner>,
    pub(crate) unit_partners: Collection<UnitPartner>,
    pub(crate) contracts: Collection<Contract>,
    pub(crate) installments: Collection<Installment>,
    pub(crate) partner_debts: Collection<PartnerDebt>,
    pub(crate) safes: Collection<Safe>,
    pub(crate) transfers: Collection<Transfer>,
    pub(crate) audit_log: Collection<AuditRecord>,
    pub(crate) vouchers: Collection<Voucher>,
    pub(crate) broker_dues: Collection<BrokerDue>,
    pub(crate) brokers: Collection<Broker>,
    pub(crate) partner_groups: Collection<PartnerGroup>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::initialize_default()
    }
}

impl DocumentStore {
    /// Zero state: default settings, unlocked, every collection present and empty.
    #[must_use]
    pub fn initialize_default() -> Self {
        Self {
            settings: Settings::default(),
            locked: false,
            customers: Collection::new(),
            units: Collection::new(),
            partners: Collection::new(),
            unit_partners: Collection::new(),
            contracts: Collection::new(),
            installments: Collection::new(),
            partner_debts: Collection::new(),
            safes: Collection::new(),
            transfers: Collection::new(),
            audit_log: Collection::new(),
            vouchers: Collection::new(),
            broker_dues: Collection::new(),
            brokers: Collection::new(),
            partner_groups: Collection::new(),
        }
    }

    /// Default store with `loaded` merged on top of it.
    ///
    /// # Errors
    /// Returns an error when a present collection or setting cannot be decoded.
    pub fn from_loaded(loaded: &Map<String, Value>) -> Result<Self, StateError> {
        let mut store = Self::initialize_default();
        store.merge_loaded(loaded)?;
        Ok(store)
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn update_settings(&mut self, patch: SettingsPatch) {
        if let Some(theme) = patch.theme {
            self.settings.theme = theme;
        }
        if let Some(font_size) = patch.font_size {
            self.settings.font_size = font_size;
        }
        if let Some(password) = patch.password {
            self.settings.password_hash = password.as_deref().map(Settings::hash_password);
        }
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    #[must_use]
    pub fn collection<T: Entity>(&self) -> &Collection<T> {
        T::collection(self)
    }

    pub fn collection_mut<T: Entity>(&mut self) -> &mut Collection<T> {
        T::collection_mut(self)
    }

    /// Read-only copy of one collection, in insertion order.
    #[must_use]
    pub fn get_collection(&self, name: CollectionName) -> Vec<Record> {
        self.erased(name).records()
    }

    #[must_use]
    pub fn len_of(&self, name: CollectionName) -> usize {
        self.erased(name).count()
    }

    #[must_use]
    pub fn total_records(&self) -> usize {
        CollectionName::ALL.into_iter().map(|name| self.len_of(name)).sum()
    }

    #[must_use]
    pub fn get<T: Entity>(&self, id: &RecordId) -> Option<&T> {
        T::collection(self).get(id)
    }

    /// Insert a new record, enforcing id uniqueness across every collection.
    ///
    /// # Errors
    /// Returns an error when the id is blank or already used anywhere in the store.
    pub fn insert<T: Entity>(&mut self, record: T) -> Result<RecordId, StateError> {
        let id = record.id().clone();
        if let Some(owner) = self.owner_of(&id) {
            return Err(StateError::DuplicateId { collection: owner, id });
        }
        T::collection_mut(self).insert(record)?;
        Ok(id)
    }

    /// Replace a record in place, or insert it when absent.
    ///
    /// # Errors
    /// Returns an error when the id is blank or belongs to a different collection.
    pub fn upsert<T: Entity>(&mut self, record: T) -> Result<RecordId, StateError> {
        let id = record.id().clone();
        if let Some(owner) = self.owner_of(&id).filter(|owner| *owner != T::COLLECTION) {
            return Err(StateError::DuplicateId { collection: owner, id });
        }
        T::collection_mut(self).upsert(record)?;
        Ok(id)
    }

    /// # Errors
    /// Returns [`StateError::NotFound`] when no record of type `T` has this id.
    pub fn remove<T: Entity>(&mut self, id: &RecordId) -> Result<T, StateError> {
        T::collection_mut(self)
            .remove(id)
            .ok_or_else(|| StateError::NotFound { collection: T::COLLECTION, id: id.clone() })
    }

    #[must_use]
    pub fn audit(&self) -> AuditView<'_> {
        AuditView::new(&self.audit_log)
    }

    pub fn audit_mut(&mut self) -> AuditTrail<'_> {
        AuditTrail::new(&mut self.audit_log)
    }

    fn owner_of(&self, id: &RecordId) -> Option<CollectionName> {
        CollectionName::ALL
            .into_iter()
            .find(|name| self.erased(*name).ids().into_iter().any(|existing| existing == id))
    }

    /// Check that every record carries a non-empty id that is unique across the store.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), StateError> {
        let mut seen = BTreeSet::new();
        for name in CollectionName::ALL {
            for id in self.erased(name).ids() {
                if id.is_blank() {
                    return Err(StateError::Validation(format!(
                        "record in {name} must carry a non-empty id"
                    )));
                }
                if !seen.insert(id) {
                    return Err(StateError::DuplicateId { collection: name, id: id.clone() });
                }
            }
        }
        Ok(())
    }

    /// Plain values of one collection, in insertion order.
    ///
    /// # Errors
    /// Returns an error when a record cannot be serialized.
    pub fn collection_values(&self, name: CollectionName) -> Result<Vec<Value>, StateError> {
        self.erased(name).to_values()
    }

    /// Plain JSON object mirroring the whole store.
    ///
    /// # Errors
    /// Returns an error when a record cannot be serialized.
    pub fn to_value(&self) -> Result<Value, StateError> {
        let mut object = Map::new();
        object.insert("settings".to_string(), settings_value(&self.settings)?);
        object.insert("locked".to_string(), Value::Bool(self.locked));
        for name in CollectionName::ALL {
            object.insert(name.as_str().to_string(), Value::Array(self.collection_values(name)?));
        }
        Ok(Value::Object(object))
    }

    /// Merge loaded data over this store.
    ///
    /// `settings` merges field by field; `locked` and every known collection replace the
    /// current value unless the loaded value is `null`; unknown keys are ignored. The store
    /// is left untouched when any part fails to decode.
    ///
    /// # Errors
    /// Returns an error when a present value has the wrong shape or breaks id uniqueness.
    pub fn merge_loaded(&mut self, loaded: &Map<String, Value>) -> Result<(), StateError> {
        let mut next = self.clone();
        for (key, value) in loaded {
            if value.is_null() {
                continue;
            }
            if key == "settings" {
                if let Value::Object(settings) = value {
                    next.settings.merge_loaded(settings)?;
                }
                continue;
            }
            if key == "locked" {
                next.locked = value.as_bool().ok_or_else(|| StateError::Decode {
                    key: key.clone(),
                    message: format!("expected boolean, got {value}"),
                })?;
                continue;
            }
            let Some(name) = CollectionName::parse(key) else {
                continue;
            };
            let Value::Array(items) = value else {
                return Err(StateError::Decode {
                    key: key.clone(),
                    message: "expected an array of records".to_string(),
                });
            };
            next.erased_mut(name).replace_from_values(items.clone())?;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Drop every record from every collection; settings and lock flag are kept.
    pub fn clear_collections(&mut self) {
        for name in CollectionName::ALL {
            self.erased_mut(name).clear();
        }
    }
}

/// Settings as persisted and exported.
///
/// # Errors
/// Returns an error when serialization fails.
pub fn settings_value(settings: &Settings) -> Result<Value, StateError> {
    serde_json::to_value(settings).map_err(|err| StateError::Decode {
        key: "settings".to_string(),
        message: err.to_string(),
    })
}
