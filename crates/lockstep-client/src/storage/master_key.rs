//! Device master key.
//!
//! The key that seals epoch secrets at rest lives in the OS keychain
//! (Keychain on macOS/iOS, Credential Manager on Windows, the kernel keyring
//! on Linux). These stores are local to the device; the key is generated on
//! first use and never leaves it.

use keyring::Entry;
use lockstep_core::storage::StorageError;
use lockstep_crypto::MasterKey;
use zeroize::Zeroizing;

/// Keychain service name.
pub const DEFAULT_SERVICE: &str = "lockstep";

/// Keychain account holding the master key.
pub const DEFAULT_ACCOUNT: &str = "device-master-key";

/// Where the master key comes from.
pub trait MasterKeySource {
    /// Load the master key, creating it on first use.
    fn load_or_create(&self) -> Result<MasterKey, StorageError>;
}

/// Master key held in the OS keychain, hex-encoded.
#[derive(Debug, Clone)]
pub struct KeychainMasterKey {
    service: String,
    account: String,
}

impl KeychainMasterKey {
    /// Key stored under `service` / `account`.
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self { service: service.into(), account: account.into() }
    }

    fn entry(&self) -> Result<Entry, StorageError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| StorageError::Io(format!("keychain unavailable: {e}")))
    }
}

impl Default for KeychainMasterKey {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE, DEFAULT_ACCOUNT)
    }
}

impl MasterKeySource for KeychainMasterKey {
    fn load_or_create(&self) -> Result<MasterKey, StorageError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => {
                let encoded = Zeroizing::new(encoded);
                let bytes = Zeroizing::new(hex::decode(encoded.as_str()).map_err(|e| {
                    StorageError::Sealing(format!("master key in keychain is not hex: {e}"))
                })?);
                Ok(MasterKey::from_slice(&bytes)?)
            },
            Err(keyring::Error::NoEntry) => {
                let mut bytes = Zeroizing::new([0u8; 32]);
                getrandom::fill(bytes.as_mut_slice())
                    .map_err(|e| StorageError::Io(format!("OS RNG failed: {e}")))?;
                let encoded = Zeroizing::new(hex::encode(bytes.as_slice()));
                entry
                    .set_password(&encoded)
                    .map_err(|e| StorageError::Io(format!("failed to store master key: {e}")))?;
                tracing::info!(service = %self.service, "generated device master key");
                Ok(MasterKey::new(*bytes))
            },
            Err(e) => Err(StorageError::Io(format!("keychain read failed: {e}"))),
        }
    }
}

/// Fixed master key, for tests and tooling that brings its own key.
#[derive(Debug, Clone)]
pub struct StaticMasterKey(MasterKey);

impl StaticMasterKey {
    /// Wrap `key`.
    pub fn new(key: MasterKey) -> Self {
        Self(key)
    }
}

impl MasterKeySource for StaticMasterKey {
    fn load_or_create(&self) -> Result<MasterKey, StorageError> {
        Ok(self.0.clone())
    }
}
