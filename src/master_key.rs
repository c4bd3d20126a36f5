use std::sync::RwLock;

use rand::Rng;
use tracing::info;

use crate::error::ProxyError;
use crate::store::{KeyStore, SETTING_MASTER_KEY};

const MASTER_KEY_LEN: usize = 48;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Owner of the process-wide master key. The value lives in a `settings`
/// row and is cached behind a reader/writer lock; reads never touch the
/// database.
#[derive(Debug)]
pub struct MasterKey {
    store: KeyStore,
    cached: RwLock<String>,
}

impl MasterKey {
    /// Load the persisted key, generating and storing one on first start.
    pub async fn load_or_create(store: KeyStore) -> Result<Self, ProxyError> {
        let key = match store.get_setting(SETTING_MASTER_KEY).await? {
            Some(existing) => existing,
            None => {
                let fresh = random_secret(MASTER_KEY_LEN);
                store.set_setting(SETTING_MASTER_KEY, &fresh).await?;
                info!(master_key = %fresh, "generated master key");
                fresh
            }
        };

        Ok(Self {
            store,
            cached: RwLock::new(key),
        })
    }

    pub fn get(&self) -> String {
        self.cached.read().expect("master key lock poisoned").clone()
    }

    /// Constant-time token check.
    pub fn authenticate(&self, token: &str) -> bool {
        let current = self.cached.read().expect("master key lock poisoned");
        if current.is_empty() || token.is_empty() {
            return false;
        }
        constant_time_eq(current.as_bytes(), token.as_bytes())
    }

    /// Rotate the master key and return the new value.
    pub async fn reset(&self) -> Result<String, ProxyError> {
        let fresh = random_secret(MASTER_KEY_LEN);
        self.store.set_setting(SETTING_MASTER_KEY, &fresh).await?;
        let mut cached = self.cached.write().expect("master key lock poisoned");
        *cached = fresh.clone();
        Ok(fresh)
    }
}

fn random_secret(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
