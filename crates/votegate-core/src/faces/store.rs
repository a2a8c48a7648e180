use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::identity::Identity;
use crate::secret_service::EmbeddingKey;

const STORE_VERSION: u32 = 1;
const STORE_ALGORITHM: &str = "AES-256-GCM";
const STORE_NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentRecord {
    pub identity: Identity,
    pub embedding: Vec<f64>,
    pub enrollment_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

impl EnrollmentRecord {
    pub fn new(identity: Identity, embedding: Vec<f64>, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            embedding,
            enrollment_count: 1,
            created_at: now,
            updated_at: now,
            active: true,
        }
    }

    /// Replaces the template in place; the first enrollment date survives.
    pub fn reenroll(&mut self, embedding: Vec<f64>, now: DateTime<Utc>) {
        self.embedding = embedding;
        self.enrollment_count = self.enrollment_count.saturating_add(1);
        self.updated_at = now;
        self.active = true;
    }

    pub fn is_usable(&self) -> bool {
        self.active && !self.embedding.is_empty()
    }
}

pub trait EnrollmentStore: Send + Sync {
    fn get(&self, identity: &Identity) -> AppResult<Option<EnrollmentRecord>>;
    fn put(&self, record: &EnrollmentRecord) -> AppResult<()>;
    /// Returns whether a record existed.
    fn delete(&self, identity: &Identity) -> AppResult<bool>;

    fn upsert(&self, identity: &Identity, embedding: Vec<f64>) -> AppResult<EnrollmentRecord> {
        let now = Utc::now();
        let record = match self.get(identity)? {
            Some(mut existing) => {
                existing.reenroll(embedding, now);
                existing
            }
            None => EnrollmentRecord::new(identity.clone(), embedding, now),
        };
        self.put(&record)?;
        Ok(record)
    }
}

/// One encrypted JSON file per identity under `dir`.
pub struct FilesystemEnrollmentStore {
    dir: PathBuf,
    key: EmbeddingKey,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FilesystemEnrollmentStore {
    pub fn new(dir: impl Into<PathBuf>, key: EmbeddingKey) -> Self {
        Self {
            dir: dir.into(),
            key,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{}.json", identity.storage_key()))
    }

    /// Runs `op` while holding the writer lock for `identity`. The lock entry
    /// is dropped again once no other writer holds or waits on it.
    fn with_identity_lock<T>(
        &self,
        identity: &Identity,
        op: impl FnOnce() -> AppResult<T>,
    ) -> AppResult<T> {
        let key = identity.storage_key();
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| lock_poisoned(&self.dir))?;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = match lock.lock() {
            Ok(_guard) => op(),
            Err(_) => Err(lock_poisoned(&self.dir)),
        };

        let mut locks = self
            .locks
            .lock()
            .map_err(|_| lock_poisoned(&self.dir))?;
        // One reference in the map, one here: nobody else is queued.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn read_record(&self, identity: &Identity) -> AppResult<Option<EnrollmentRecord>> {
        let path = self.record_path(identity);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(AppError::StoreRead { path, source }),
        };

        let wrapper: EncryptedRecord =
            serde_json::from_slice(&data).map_err(|err| AppError::InvalidStoreFile {
                path: path.clone(),
                message: format!("invalid record wrapper: {err}"),
            })?;
        let record = decrypt_record(&path, wrapper, self.key.as_bytes(), identity)?;
        if &record.identity != identity {
            return Err(AppError::InvalidStoreFile {
                path,
                message: "record belongs to a different identity".into(),
            });
        }
        Ok(Some(record))
    }

    fn write_record(&self, record: &EnrollmentRecord) -> AppResult<()> {
        let path = self.record_path(&record.identity);
        let serialized = serialize_encrypted_record(record, self.key.as_bytes())?;
        write_atomically(&path, &serialized)?;
        debug!(
            identity = %record.identity.redacted(),
            count = record.enrollment_count,
            "enrollment record written"
        );
        Ok(())
    }
}

impl EnrollmentStore for FilesystemEnrollmentStore {
    fn get(&self, identity: &Identity) -> AppResult<Option<EnrollmentRecord>> {
        self.read_record(identity)
    }

    fn put(&self, record: &EnrollmentRecord) -> AppResult<()> {
        self.with_identity_lock(&record.identity, || self.write_record(record))
    }

    fn delete(&self, identity: &Identity) -> AppResult<bool> {
        self.with_identity_lock(identity, || {
            let path = self.record_path(identity);
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                Err(source) => Err(AppError::StoreWrite { path, source }),
            }
        })
    }

    fn upsert(&self, identity: &Identity, embedding: Vec<f64>) -> AppResult<EnrollmentRecord> {
        self.with_identity_lock(identity, || {
            let now = Utc::now();
            let record = match self.read_record(identity)? {
                Some(mut existing) => {
                    existing.reenroll(embedding, now);
                    existing
                }
                None => EnrollmentRecord::new(identity.clone(), embedding, now),
            };
            self.write_record(&record)?;
            Ok(record)
        })
    }
}

fn lock_poisoned(dir: &Path) -> AppError {
    AppError::StoreWrite {
        path: dir.to_path_buf(),
        source: io::Error::new(ErrorKind::Other, "enrollment lock poisoned"),
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> AppResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AppError::StoreWrite {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|source| AppError::StoreWrite {
        path: path.to_path_buf(),
        source,
    })?;

    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            writer
                .write_all(contents)
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush())
                .map_err(|source| AppError::StoreWrite {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        file.sync_all().map_err(|source| AppError::StoreWrite {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let file = tmp.persist(path).map_err(|err| AppError::StoreWrite {
        path: path.to_path_buf(),
        source: err.error,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file
            .metadata()
            .map_err(|source| AppError::StoreWrite {
                path: path.to_path_buf(),
                source,
            })?
            .permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)
            .map_err(|source| AppError::StoreWrite {
                path: path.to_path_buf(),
                source,
            })?;
    }

    Ok(())
}

fn serialize_encrypted_record(record: &EnrollmentRecord, key: &[u8]) -> AppResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(record)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    let mut nonce = [0u8; STORE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: record.identity.as_str().as_bytes(),
            },
        )
        .map_err(|err| AppError::Encryption(format!("failed to encrypt enrollment: {err}")))?;
    let wrapper = EncryptedRecord {
        version: STORE_VERSION,
        algorithm: STORE_ALGORITHM.to_string(),
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    };
    serde_json::to_vec_pretty(&wrapper).map_err(AppError::from)
}

fn decrypt_record(
    path: &Path,
    wrapper: EncryptedRecord,
    key: &[u8],
    identity: &Identity,
) -> AppResult<EnrollmentRecord> {
    if wrapper.algorithm != STORE_ALGORITHM {
        return Err(AppError::Encryption(format!(
            "unsupported enrollment store algorithm '{}'",
            wrapper.algorithm
        )));
    }
    if wrapper.version != STORE_VERSION {
        return Err(AppError::Encryption(format!(
            "unsupported enrollment store version {}",
            wrapper.version
        )));
    }

    let nonce_bytes = general_purpose::STANDARD
        .decode(wrapper.nonce.trim())
        .map_err(|err| AppError::Encryption(format!("invalid nonce encoding: {err}")))?;
    if nonce_bytes.len() != STORE_NONCE_LEN {
        return Err(AppError::Encryption(format!(
            "expected nonce of {} bytes but found {}",
            STORE_NONCE_LEN,
            nonce_bytes.len()
        )));
    }

    let ciphertext = general_purpose::STANDARD
        .decode(wrapper.ciphertext.trim())
        .map_err(|err| AppError::Encryption(format!("invalid ciphertext encoding: {err}")))?;

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: identity.as_str().as_bytes(),
            },
        )
        .map_err(|err| AppError::Encryption(format!("failed to decrypt enrollment: {err}")))?;

    serde_json::from_slice(&plaintext).map_err(|err| AppError::InvalidStoreFile {
        path: path.to_path_buf(),
        message: format!("invalid decrypted record: {err}"),
    })
}

#[derive(Serialize, Deserialize)]
struct EncryptedRecord {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}
