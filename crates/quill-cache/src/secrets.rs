// Copyright 2025 The Quill Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The secret vault.
//!
//! External secrets live in the OS keychain behind the [`SecretBackend`]
//! trait, mirrored in memory for synchronous reads. Internal secrets never
//! leave the cache: they are sealed with ChaCha20-Poly1305 under a key
//! derived from the pickle secret, which is itself a bootstrapped external
//! secret.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{
    db::{self, tables},
    encode::EncodeKey,
    error::{CacheError, Result},
    signals::CacheSignal,
    Cache,
};

/// The secret every login bootstraps: the symmetric key crypto sessions are
/// pickled under.
pub const PICKLE_SECRET: &str = "pickle_secret";

const KEYCHAIN_SERVICE: &str = "im.quill.quill";
const SEAL_INFO: &[u8] = b"quill.cache.internal-secrets.v1";

/// Storage for external secrets. The OS keychain in production; tests plug
/// in an in-memory map.
pub trait SecretBackend: Send + Sync + 'static {
    fn read(&self, account: &str) -> Result<Option<String>>;
    fn write(&self, account: &str, value: &str) -> Result<()>;
    fn delete(&self, account: &str) -> Result<()>;
}

/// [`SecretBackend`] backed by the platform keychain.
#[derive(Debug, Default)]
pub struct OsKeychain;

impl OsKeychain {
    fn entry(&self, account: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYCHAIN_SERVICE, account)
            .map_err(|e| CacheError::Keychain(e.to_string()))
    }
}

impl SecretBackend for OsKeychain {
    fn read(&self, account: &str) -> Result<Option<String>> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CacheError::Keychain(e.to_string())),
        }
    }

    fn write(&self, account: &str, value: &str) -> Result<()> {
        self.entry(account)?.set_password(value).map_err(|e| CacheError::Keychain(e.to_string()))
    }

    fn delete(&self, account: &str) -> Result<()> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CacheError::Keychain(e.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SealedSecret {
    nonce: String,
    ciphertext: String,
}

impl Cache {
    fn keychain_account(&self, name: &str) -> String {
        format!("{}/{name}", self.local_user)
    }

    /// The key used to pickle Olm material; available once the bootstrapped
    /// secrets are loaded.
    pub fn pickle_secret(&self) -> Option<String> {
        self.secret_mirror
            .lock()
            .expect("secret mirror poisoned")
            .get(PICKLE_SECRET)
            .map(|v| v.to_string())
    }

    fn seal_cipher(&self) -> Result<ChaCha20Poly1305> {
        let pickle = self.pickle_secret().ok_or(CacheError::SecretSeal)?;
        let hk = Hkdf::<Sha256>::new(None, pickle.as_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(SEAL_INFO, &mut okm[..]).map_err(|_| CacheError::SecretSeal)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&okm[..])))
    }

    fn seal(&self, plaintext: &str) -> Result<SealedSecret> {
        let cipher = self.seal_cipher()?;
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CacheError::SecretSeal)?;
        Ok(SealedSecret { nonce: BASE64.encode(nonce), ciphertext: BASE64.encode(ciphertext) })
    }

    fn open_sealed(&self, sealed: &SealedSecret) -> Result<String> {
        let cipher = self.seal_cipher()?;
        let nonce = BASE64.decode(&sealed.nonce).map_err(|_| CacheError::SecretSeal)?;
        let ciphertext = BASE64.decode(&sealed.ciphertext).map_err(|_| CacheError::SecretSeal)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CacheError::SecretSeal)?;
        String::from_utf8(plaintext).map_err(|_| CacheError::SecretSeal)
    }

    /// Store a named secret, writing through to the keychain or to the
    /// sealed internal store.
    pub fn store_secret(&self, name: &str, value: &str, internal: bool) -> Result<()> {
        if internal {
            let sealed = self.seal(value)?;
            self.write_with(|ctx| {
                let mut table = db::open_table(ctx, tables::SECRETS_INTERNAL)?;
                table.insert(name.encode().as_slice(), db::encode_value(&sealed)?.as_slice())?;
                Ok(())
            })?;
        } else {
            self.backend.write(&self.keychain_account(name), value)?;
        }
        self.secret_mirror
            .lock()
            .expect("secret mirror poisoned")
            .insert(name.to_owned(), Zeroizing::new(value.to_owned()));
        let _ = self.signals.send(CacheSignal::SecretChanged { name: name.to_owned() });
        Ok(())
    }

    pub fn delete_secret(&self, name: &str, internal: bool) -> Result<()> {
        if internal {
            self.write_with(|ctx| {
                let mut table = db::open_table(ctx, tables::SECRETS_INTERNAL)?;
                table.remove(name.encode().as_slice())?;
                Ok(())
            })?;
        } else {
            self.backend.delete(&self.keychain_account(name))?;
        }
        self.secret_mirror.lock().expect("secret mirror poisoned").remove(name);
        let _ = self.signals.send(CacheSignal::SecretChanged { name: name.to_owned() });
        Ok(())
    }

    /// Synchronous secret read from the in-memory mirror, falling back to
    /// the sealed store for internal secrets.
    pub fn secret(&self, name: &str, internal: bool) -> Result<Option<String>> {
        if let Some(value) = self
            .secret_mirror
            .lock()
            .expect("secret mirror poisoned")
            .get(name)
            .map(|v| v.to_string())
        {
            return Ok(Some(value));
        }
        if !internal {
            return Ok(None);
        }
        let value = self.internal_secret(name)?;
        if let Some(value) = &value {
            self.secret_mirror
                .lock()
                .expect("secret mirror poisoned")
                .insert(name.to_owned(), Zeroizing::new(value.clone()));
        }
        Ok(value)
    }

    fn internal_secret(&self, name: &str) -> Result<Option<String>> {
        let sealed: Option<SealedSecret> = self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::SECRETS_INTERNAL)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &name.encode())?.and_then(|b| db::decode_value(&b)))
        })?;
        match sealed {
            Some(sealed) => Ok(Some(self.open_sealed(&sealed)?)),
            None => Ok(None),
        }
    }

    /// Load a list of secrets in the background, invoking `callback(name,
    /// internal, value)` per secret as it completes.
    ///
    /// A missing pickle secret is generated and written through, so first
    /// runs bootstrap themselves. With `ready_after` the cache flips to
    /// ready and emits `DatabaseReady` once after the last callback. The
    /// returned handle can be joined to wait for the loader; dropping it
    /// detaches the thread.
    pub fn load_secrets_from_store(
        self: Arc<Self>,
        to_load: Vec<(String, bool)>,
        callback: impl Fn(&str, bool, Option<String>) + Send + 'static,
        ready_after: bool,
    ) -> std::thread::JoinHandle<()> {
        let cache = self;
        std::thread::spawn(move || {
            for (name, internal) in to_load {
                let value = if internal {
                    match cache.internal_secret(&name) {
                        Ok(value) => value,
                        Err(error) => {
                            warn!(name, %error, "failed to read internal secret");
                            None
                        }
                    }
                } else {
                    match cache.read_or_bootstrap_external(&name) {
                        Ok(value) => value,
                        Err(error) => {
                            warn!(name, %error, "keychain read failed");
                            None
                        }
                    }
                };
                if let Some(value) = &value {
                    cache
                        .secret_mirror
                        .lock()
                        .expect("secret mirror poisoned")
                        .insert(name.clone(), Zeroizing::new(value.clone()));
                }
                callback(&name, internal, value);
            }
            if ready_after {
                cache.database_ready.store(true, std::sync::atomic::Ordering::SeqCst);
                let _ = cache.signals.send(CacheSignal::DatabaseReady);
            }
        })
    }

    fn read_or_bootstrap_external(&self, name: &str) -> Result<Option<String>> {
        let account = self.keychain_account(name);
        if let Some(value) = self.backend.read(&account)? {
            return Ok(Some(value));
        }
        if name != PICKLE_SECRET {
            return Ok(None);
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        let value = BASE64.encode(&bytes[..]);
        self.backend.write(&account, &value)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::HashMap, sync::Mutex};

    use super::SecretBackend;
    use crate::error::Result;

    /// An in-memory keychain that survives "restarts" by being shared
    /// between cache instances.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryKeychain {
        entries: Mutex<HashMap<String, String>>,
    }

    impl SecretBackend for MemoryKeychain {
        fn read(&self, account: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().unwrap().get(account).cloned())
        }

        fn write(&self, account: &str, value: &str) -> Result<()> {
            self.entries.lock().unwrap().insert(account.to_owned(), value.to_owned());
            Ok(())
        }

        fn delete(&self, account: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(account);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        mpsc,
        Arc,
    };

    use ruma::user_id;

    use super::{testing::MemoryKeychain, SecretBackend, PICKLE_SECRET};
    use crate::{signals::CacheSignal, Cache};

    fn cache_with_backend(
        dir: &tempfile::TempDir,
        backend: Arc<MemoryKeychain>,
    ) -> Arc<Cache> {
        Arc::new(
            Cache::open_with_backend(dir.path(), user_id!("@self:example.org"), backend).unwrap(),
        )
    }

    fn load_and_wait(
        cache: &Arc<Cache>,
        names: Vec<(String, bool)>,
        ready_after: bool,
    ) -> Vec<(String, bool, Option<String>)> {
        let (tx, rx) = mpsc::channel();
        let handle = cache.clone().load_secrets_from_store(
            names,
            move |name, internal, value| {
                tx.send((name.to_owned(), internal, value)).unwrap();
            },
            ready_after,
        );
        handle.join().unwrap();
        rx.into_iter().collect()
    }

    #[test]
    fn pickle_secret_bootstraps_on_first_load() {
        let backend = Arc::new(MemoryKeychain::default());

        let generated = {
            let dir = tempfile::tempdir().unwrap();
            let cache = cache_with_backend(&dir, backend.clone());
            assert!(cache.pickle_secret().is_none());
            let loaded = load_and_wait(&cache, vec![(PICKLE_SECRET.to_owned(), false)], false);
            assert_eq!(loaded.len(), 1);
            let generated = loaded[0].2.clone().unwrap();
            assert_eq!(cache.pickle_secret().as_deref(), Some(generated.as_str()));
            generated
        };

        // A fresh login against the same keychain sees the same secret.
        let dir = tempfile::tempdir().unwrap();
        let other = cache_with_backend(&dir, backend);
        let loaded = load_and_wait(&other, vec![(PICKLE_SECRET.to_owned(), false)], false);
        assert_eq!(loaded[0].2.as_deref(), Some(generated.as_str()));
    }

    #[test]
    fn secrets_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryKeychain::default());

        {
            let cache = cache_with_backend(&dir, backend.clone());
            load_and_wait(&cache, vec![(PICKLE_SECRET.to_owned(), false)], false);
            cache.store_secret("x", "v", false).unwrap();
        }

        let cache = cache_with_backend(&dir, backend);
        let mut rx = cache.subscribe();
        let loaded = load_and_wait(
            &cache,
            vec![(PICKLE_SECRET.to_owned(), false), ("x".to_owned(), false)],
            true,
        );
        assert_eq!(loaded[1].0, "x");
        assert_eq!(loaded[1].2.as_deref(), Some("v"));

        // `databaseReady` fires exactly once, after the last callback; the
        // loader was joined, so the signal is already buffered.
        let mut ready = 0;
        while let Ok(signal) = rx.try_recv() {
            if matches!(signal, CacheSignal::DatabaseReady) {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);
        assert!(cache.database_ready());
    }

    #[test]
    fn internal_secrets_are_sealed_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryKeychain::default());

        {
            let cache = cache_with_backend(&dir, backend.clone());
            load_and_wait(&cache, vec![(PICKLE_SECRET.to_owned(), false)], false);
            cache.store_secret("token", "hunter2", true).unwrap();
            assert_eq!(cache.secret("token", true).unwrap().as_deref(), Some("hunter2"));
            // The keychain never saw it.
            assert!(backend.read("@self:example.org/token").unwrap().is_none());
        }

        // After a restart the sealed store decrypts with the keychain pickle.
        let cache = cache_with_backend(&dir, backend);
        load_and_wait(&cache, vec![(PICKLE_SECRET.to_owned(), false)], false);
        assert_eq!(cache.secret("token", true).unwrap().as_deref(), Some("hunter2"));
    }

    #[test]
    fn deleting_a_secret_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryKeychain::default());
        let cache = cache_with_backend(&dir, backend);
        load_and_wait(&cache, vec![(PICKLE_SECRET.to_owned(), false)], false);

        cache.store_secret("x", "v", false).unwrap();
        let mut rx = cache.subscribe();
        cache.delete_secret("x", false).unwrap();
        assert!(cache.secret("x", false).unwrap().is_none());

        let mut saw_change = false;
        while let Ok(signal) = rx.try_recv() {
            if matches!(&signal, CacheSignal::SecretChanged { name } if name == "x") {
                saw_change = true;
            }
        }
        assert!(saw_change);
    }
}
