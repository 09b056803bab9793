//! Device and account identity
//!
//! The device identifier is generated once per installation and reused
//! for every mutation this device submits. The current account is the
//! one whose data the engine synchronizes.

use uuid::Uuid;

use crate::storage::{LocalStore, StorageResult};

const DEVICE_ID_KEY: &str = "device_id";
const ACCOUNT_ID_KEY: &str = "account_id";

/// Identity of this installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable per-installation identifier
    pub device_id: String,
    /// Account signed in on this device, if any
    pub account_id: Option<String>,
}

impl Identity {
    /// Load the identity, generating the device id on first use
    pub fn load_or_create(store: &LocalStore) -> StorageResult<Self> {
        let device_id = store.get_or_insert_meta(DEVICE_ID_KEY, generate_device_id)?;
        let account_id = store.get_meta(ACCOUNT_ID_KEY)?;
        Ok(Self {
            device_id,
            account_id,
        })
    }

    /// Remember the signed-in account
    pub fn set_account(&mut self, store: &LocalStore, account_id: &str) -> StorageResult<()> {
        store.set_meta(ACCOUNT_ID_KEY, account_id)?;
        self.account_id = Some(account_id.to_string());
        Ok(())
    }
}

fn generate_device_id() -> String {
    format!("device-{}", Uuid::new_v4())
}
