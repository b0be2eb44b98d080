use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::HalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    Str(String),
    Blob(Vec<u8>),
}

/// An open namespace. Writes are buffered on the handle and become durable
/// only at `commit`, which applies them atomically; a partially-written
/// value is never observable from another handle. Dropping the handle
/// without committing discards pending writes. Close is the drop, and is
/// idempotent by construction.
pub trait StoreHandle: Send {
    fn get_str(&self, key: &str) -> Result<String, HalError>;
    fn get_blob(&self, key: &str) -> Result<Vec<u8>, HalError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), HalError>;
    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), HalError>;
    fn erase_key(&mut self, key: &str) -> Result<(), HalError>;
    fn commit(&mut self) -> Result<(), HalError>;
}

/// Typed key/value namespaces over non-volatile storage.
pub trait Store: Send + Sync {
    fn open(&self, namespace: &str, mode: StoreMode) -> Result<Box<dyn StoreHandle>, HalError>;

    /// Erase-and-reformat recovery for a corrupt backing store.
    fn wipe(&self) -> Result<(), HalError>;
}

type Namespaces = HashMap<String, HashMap<String, StoreValue>>;

/// Volatile reference implementation backing the unit tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    namespaces: Arc<Mutex<Namespaces>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn open(&self, namespace: &str, mode: StoreMode) -> Result<Box<dyn StoreHandle>, HalError> {
        Ok(Box::new(MemoryHandle {
            namespaces: self.namespaces.clone(),
            namespace: namespace.to_string(),
            mode,
            pending: HashMap::new(),
        }))
    }

    fn wipe(&self) -> Result<(), HalError> {
        self.namespaces
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?
            .clear();
        Ok(())
    }
}

struct MemoryHandle {
    namespaces: Arc<Mutex<Namespaces>>,
    namespace: String,
    mode: StoreMode,
    /// key -> Some(value) for writes, None for erases.
    pending: HashMap<String, Option<StoreValue>>,
}

impl MemoryHandle {
    fn read(&self, key: &str) -> Result<StoreValue, HalError> {
        if let Some(pending) = self.pending.get(key) {
            return pending
                .clone()
                .ok_or_else(|| HalError::not_found(format!("key `{key}` erased")));
        }

        let namespaces = self
            .namespaces
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?;
        namespaces
            .get(&self.namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("key `{key}` not set")))
    }

    fn write(&mut self, key: &str, value: Option<StoreValue>) -> Result<(), HalError> {
        if self.mode == StoreMode::ReadOnly {
            return Err(HalError::invalid(format!(
                "namespace `{}` opened read-only",
                self.namespace
            )));
        }
        let _ = self.pending.insert(key.to_string(), value);
        Ok(())
    }
}

impl StoreHandle for MemoryHandle {
    fn get_str(&self, key: &str) -> Result<String, HalError> {
        match self.read(key)? {
            StoreValue::Str(value) => Ok(value),
            StoreValue::Blob(_) => Err(HalError::invalid(format!("key `{key}` is a blob"))),
        }
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, HalError> {
        match self.read(key)? {
            StoreValue::Blob(value) => Ok(value),
            StoreValue::Str(_) => Err(HalError::invalid(format!("key `{key}` is a string"))),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), HalError> {
        self.write(key, Some(StoreValue::Str(value.to_string())))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), HalError> {
        self.write(key, Some(StoreValue::Blob(value.to_vec())))
    }

    fn erase_key(&mut self, key: &str) -> Result<(), HalError> {
        self.write(key, None)
    }

    fn commit(&mut self) -> Result<(), HalError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut namespaces = self
            .namespaces
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?;
        let ns = namespaces.entry(self.namespace.clone()).or_default();
        for (key, value) in self.pending.drain() {
            match value {
                Some(value) => {
                    let _ = ns.insert(key, value);
                }
                None => {
                    let _ = ns.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_key_reads_not_found() {
        let store = MemoryStore::new();
        let handle = store.open("wifi_config", StoreMode::ReadOnly).unwrap();
        assert!(matches!(
            handle.get_str("wifi_ssid"),
            Err(HalError::NotFound(_))
        ));
    }

    #[test]
    fn writes_become_visible_only_after_commit() {
        let store = MemoryStore::new();
        let mut writer = store.open("wifi_config", StoreMode::ReadWrite).unwrap();
        writer.set_str("wifi_ssid", "home").unwrap();

        let reader = store.open("wifi_config", StoreMode::ReadOnly).unwrap();
        assert!(reader.get_str("wifi_ssid").is_err());
        // The writing handle sees its own pending value.
        assert_eq!(writer.get_str("wifi_ssid").unwrap(), "home");

        writer.commit().unwrap();
        assert_eq!(reader.get_str("wifi_ssid").unwrap(), "home");
    }

    #[test]
    fn dropped_handle_discards_pending_writes() {
        let store = MemoryStore::new();
        {
            let mut writer = store.open("wifi_config", StoreMode::ReadWrite).unwrap();
            writer.set_str("wifi_ssid", "lost").unwrap();
        }
        let reader = store.open("wifi_config", StoreMode::ReadOnly).unwrap();
        assert!(reader.get_str("wifi_ssid").is_err());
    }

    #[test]
    fn namespaces_have_distinct_key_spaces() {
        let store = MemoryStore::new();
        let mut wifi = store.open("wifi_config", StoreMode::ReadWrite).unwrap();
        wifi.set_str("base_address", "not-a-server").unwrap();
        wifi.commit().unwrap();

        let server = store.open("server_config", StoreMode::ReadOnly).unwrap();
        assert!(server.get_str("base_address").is_err());
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let store = MemoryStore::new();
        let mut handle = store.open("wifi_config", StoreMode::ReadOnly).unwrap();
        assert!(handle.set_str("wifi_ssid", "x").is_err());
        assert!(handle.erase_key("wifi_ssid").is_err());
    }

    #[test]
    fn erase_key_round_trips() {
        let store = MemoryStore::new();
        let mut handle = store.open("wifi_config", StoreMode::ReadWrite).unwrap();
        handle.set_blob("force_config", &[1]).unwrap();
        handle.commit().unwrap();
        assert_eq!(handle.get_blob("force_config").unwrap(), vec![1]);

        handle.erase_key("force_config").unwrap();
        handle.commit().unwrap();
        assert!(handle.get_blob("force_config").is_err());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let store = MemoryStore::new();
        let mut handle = store.open("wifi_config", StoreMode::ReadWrite).unwrap();
        handle.set_blob("configured", &[1]).unwrap();
        handle.commit().unwrap();
        assert!(matches!(
            handle.get_str("configured"),
            Err(HalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn wipe_clears_all_namespaces() {
        let store = MemoryStore::new();
        let mut handle = store.open("server_config", StoreMode::ReadWrite).unwrap();
        handle.set_str("base_address", "http://srv").unwrap();
        handle.commit().unwrap();

        store.wipe().unwrap();
        let handle = store.open("server_config", StoreMode::ReadOnly).unwrap();
        assert!(handle.get_str("base_address").is_err());
    }
}
