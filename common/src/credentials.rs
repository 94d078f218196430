use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{config::IrHardwareConfig, error::StoreError};

pub const KEY_NETWORK: &str = "net";
pub const KEY_LABEL: &str = "label";
pub const KEY_PENDING: &str = "pending";
pub const KEY_IR: &str = "ir";

/// Flat string storage. A single `set` or `remove` must be atomic on its own.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &mut T {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default, rename = "label")]
    pub device_label: String,
}

impl NetworkCredentials {
    pub fn has_network(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkRecord {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    passphrase: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LabelRecord {
    #[serde(default)]
    label: String,
}

/// Owns the persisted network credentials and device label.
///
/// `save` journals the whole triple under [`KEY_PENDING`] before touching the
/// two records, so an interrupted save is rolled forward by the next read and
/// a reader never observes a mix of old and new fields.
pub struct CredentialStore<S> {
    backend: S,
}

impl<S: KeyValueStore> CredentialStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Never fails: backend errors read the same as "never configured".
    pub fn load(&mut self) -> NetworkCredentials {
        self.try_load().unwrap_or_default()
    }

    pub fn try_load(&mut self) -> Result<NetworkCredentials, StoreError> {
        if let Some(pending) = self.read_pending()? {
            // Best effort; the journal stays authoritative until removed.
            let _ = self.commit(&pending);
            return Ok(pending);
        }

        let network: NetworkRecord = self.read_record(KEY_NETWORK)?;
        let label: LabelRecord = self.read_record(KEY_LABEL)?;
        Ok(NetworkCredentials {
            ssid: network.ssid,
            passphrase: network.passphrase,
            device_label: label.label,
        })
    }

    pub fn save(&mut self, ssid: &str, passphrase: &str, label: &str) -> Result<(), StoreError> {
        let pending = NetworkCredentials {
            ssid: ssid.to_string(),
            passphrase: passphrase.to_string(),
            device_label: label.to_string(),
        };
        let journal = encode(KEY_PENDING, &pending)?;
        self.backend.set(KEY_PENDING, &journal)?;
        self.commit(&pending)
    }

    /// Drops ssid and passphrase; the device label survives.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        if let Some(pending) = self.read_pending()? {
            self.commit(&pending)?;
        }
        self.backend.remove(KEY_NETWORK)
    }

    pub fn load_ir_config(&self) -> Result<IrHardwareConfig, StoreError> {
        let mut ir: IrHardwareConfig = self.read_record(KEY_IR)?;
        ir.sanitize();
        Ok(ir)
    }

    fn commit(&mut self, credentials: &NetworkCredentials) -> Result<(), StoreError> {
        let network = encode(
            KEY_NETWORK,
            &NetworkRecord {
                ssid: credentials.ssid.clone(),
                passphrase: credentials.passphrase.clone(),
            },
        )?;
        let label = encode(
            KEY_LABEL,
            &LabelRecord {
                label: credentials.device_label.clone(),
            },
        )?;

        self.backend.set(KEY_NETWORK, &network)?;
        self.backend.set(KEY_LABEL, &label)?;
        self.backend.remove(KEY_PENDING)
    }

    fn read_pending(&self) -> Result<Option<NetworkCredentials>, StoreError> {
        Ok(self
            .backend
            .get(KEY_PENDING)?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    fn read_record<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        Ok(self
            .backend
            .get(key)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }
}

fn encode<T: Serialize>(key: &'static str, record: &T) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|source| StoreError::Encode { key, source })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{CrashingStore, MemoryStore};

    fn credentials(ssid: &str, passphrase: &str, label: &str) -> NetworkCredentials {
        NetworkCredentials {
            ssid: ssid.to_string(),
            passphrase: passphrase.to_string(),
            device_label: label.to_string(),
        }
    }

    #[test]
    fn empty_store_reads_as_never_configured() {
        let mut store = CredentialStore::new(MemoryStore::default());
        let loaded = store.load();
        assert_eq!(loaded, NetworkCredentials::default());
        assert!(!loaded.has_network());
    }

    #[test]
    fn save_then_load_returns_all_fields() {
        let mut store = CredentialStore::new(MemoryStore::default());
        store.save("Home", "x", "den").unwrap();

        assert_eq!(store.load(), credentials("Home", "x", "den"));
        assert!(store.backend().get(KEY_PENDING).unwrap().is_none());
    }

    #[test]
    fn clear_keeps_label() {
        let mut store = CredentialStore::new(MemoryStore::default());
        store.save("Home", "x", "den").unwrap();
        store.clear().unwrap();

        assert_eq!(store.load(), credentials("", "", "den"));
    }

    #[test]
    fn missing_fields_and_corrupt_records_read_as_empty() {
        let mut backend = MemoryStore::default();
        backend.set(KEY_NETWORK, r#"{"ssid":"Home"}"#).unwrap();
        backend.set(KEY_LABEL, "not json").unwrap();
        let mut store = CredentialStore::new(backend);

        assert_eq!(store.load(), credentials("Home", "", ""));
    }

    #[test]
    fn interrupted_save_yields_old_or_new_never_a_mix() {
        // A save is four writes: journal, network, label, journal removal.
        for writes_before_crash in 0..4 {
            let mut backend = MemoryStore::default();
            {
                let mut store = CredentialStore::new(&mut backend);
                store.save("Old", "old-pass", "attic").unwrap();
            }

            let crashing = CrashingStore::new(backend.clone(), writes_before_crash);
            let mut store = CredentialStore::new(crashing);
            assert!(store.save("New", "new-pass", "den").is_err());

            let survivor = store.backend().inner().clone();
            let mut reopened = CredentialStore::new(survivor);
            let loaded = reopened.load();

            let old = credentials("Old", "old-pass", "attic");
            let new = credentials("New", "new-pass", "den");
            assert!(
                loaded == old || loaded == new,
                "crash after {writes_before_crash} writes produced {loaded:?}"
            );
            if writes_before_crash > 0 {
                assert_eq!(loaded, new);
            }
        }
    }

    #[test]
    fn rolled_forward_journal_is_cleared() {
        let mut backend = MemoryStore::default();
        backend
            .set(
                KEY_PENDING,
                r#"{"ssid":"Home","passphrase":"x","label":"den"}"#,
            )
            .unwrap();
        backend.set(KEY_LABEL, r#"{"label":"attic"}"#).unwrap();

        let mut store = CredentialStore::new(backend);
        assert_eq!(store.load(), credentials("Home", "x", "den"));
        assert!(store.backend().get(KEY_PENDING).unwrap().is_none());
        assert_eq!(store.load(), credentials("Home", "x", "den"));
    }

    #[test]
    fn clear_does_not_resurrect_interrupted_save() {
        let mut backend = MemoryStore::default();
        backend
            .set(
                KEY_PENDING,
                r#"{"ssid":"Home","passphrase":"x","label":"den"}"#,
            )
            .unwrap();

        let mut store = CredentialStore::new(backend);
        store.clear().unwrap();
        assert_eq!(store.load(), credentials("", "", "den"));
    }

    #[test]
    fn ir_config_defaults_when_absent_and_is_sanitized() {
        let mut backend = MemoryStore::default();
        let store = CredentialStore::new(&mut backend);
        assert_eq!(store.load_ir_config().unwrap(), IrHardwareConfig::default());

        backend
            .set(KEY_IR, r#"{"tx_pin":5,"rx_pin":5,"tx_rmt_channel":1,"rx_rmt_channel":2,"carrier_khz":5,"override_pin":0}"#)
            .unwrap();
        let ir = CredentialStore::new(backend).load_ir_config().unwrap();
        assert_eq!(ir.tx_pin, 5);
        assert_eq!(ir.rx_pin, 15);
        assert_eq!(ir.carrier_khz, 10);
    }
}
