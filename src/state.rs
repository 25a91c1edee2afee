//! Persistent identity store.
//!
//! Holds the two server identities presented to clients and the mapping from
//! each client's public key to the substitute identity used toward upstream.
//! The mapping only grows; every new entry is written to disk before it is
//! handed out.

use crate::error::StoreError;
use crate::key::{MachinePrivate, MachinePublic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// On-disk layout of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateJson {
    legacy: String,
    noise: String,
    #[serde(default)]
    machines_mitm_keys: BTreeMap<String, String>,
}

pub struct IdentityStore {
    path: PathBuf,
    legacy_key: MachinePrivate,
    noise_key: MachinePrivate,
    /// Client public key -> substitute private key used with the control plane.
    peers: Mutex<HashMap<MachinePublic, MachinePrivate>>,
}

impl IdentityStore {
    /// Load the store from `path`, generating fresh server identities when the
    /// file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            info!("state file {} does not exist, creating new", path.display());

            let store = Self {
                path,
                legacy_key: MachinePrivate::generate(),
                noise_key: MachinePrivate::generate(),
                peers: Mutex::new(HashMap::new()),
            };
            let data = store.encode(&HashMap::new())?;
            write_state_sync(&store.path, &data)?;
            return Ok(store);
        }

        let raw = std::fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let state: StateJson =
            serde_json::from_slice(&raw).map_err(|e| StoreError::corrupt("state json", e))?;

        let legacy_key = state
            .legacy
            .parse()
            .map_err(|e| StoreError::corrupt("Legacy", e))?;
        let noise_key = state
            .noise
            .parse()
            .map_err(|e| StoreError::corrupt("Noise", e))?;

        let mut peers = HashMap::with_capacity(state.machines_mitm_keys.len());
        for (public, private) in &state.machines_mitm_keys {
            let public: MachinePublic = public.parse()?;
            let private: MachinePrivate = private.parse()?;
            peers.insert(public, private);
        }
        info!("loaded {} keys from state", peers.len());

        Ok(Self {
            path,
            legacy_key,
            noise_key,
            peers: Mutex::new(peers),
        })
    }

    pub fn legacy_key(&self) -> &MachinePrivate {
        &self.legacy_key
    }

    pub fn noise_key(&self) -> &MachinePrivate {
        &self.noise_key
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Return the substitute identity for `peer`, provisioning and persisting
    /// a new one on first contact.
    ///
    /// The lock is held across the lookup, generation and file write, so
    /// concurrent first contacts from one peer share a single identity.
    pub async fn lookup_or_provision(
        &self,
        peer: &MachinePublic,
    ) -> Result<MachinePrivate, StoreError> {
        let mut peers = self.peers.lock().await;

        if let Some(existing) = peers.get(peer) {
            return Ok(existing.clone());
        }

        info!("got new machine {}, generating MITM key", peer.short_string());
        let substitute = MachinePrivate::generate();
        peers.insert(*peer, substitute.clone());

        let persisted = match self.encode(&peers) {
            Ok(data) => write_state(&self.path, &data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            // Never disclosed, so dropping it keeps memory and disk in agreement.
            peers.remove(peer);
            return Err(e);
        }

        Ok(substitute)
    }

    fn encode(
        &self,
        peers: &HashMap<MachinePublic, MachinePrivate>,
    ) -> Result<Vec<u8>, StoreError> {
        let state = StateJson {
            legacy: self.legacy_key.to_string(),
            noise: self.noise_key.to_string(),
            machines_mitm_keys: peers
                .iter()
                .map(|(public, private)| (public.to_string(), private.to_string()))
                .collect(),
        };
        let mut data =
            serde_json::to_vec(&state).map_err(|e| StoreError::corrupt("encode state", e))?;
        data.push(b'\n');
        Ok(data)
    }
}

fn write_state_sync(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(data).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))
}

async fn write_state(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(|e| StoreError::io(path, e))?;
    file.write_all(data).await.map_err(|e| StoreError::io(path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    fn read_state(path: &Path) -> StateJson {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_load_creates_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);

        let store = IdentityStore::load(&path).unwrap();
        assert!(path.exists());

        let on_disk = read_state(&path);
        assert_eq!(on_disk.legacy, store.legacy_key().to_string());
        assert_eq!(on_disk.noise, store.noise_key().to_string());
        assert_ne!(on_disk.legacy, on_disk.noise);
        assert!(on_disk.machines_mitm_keys.is_empty());

        let reloaded = IdentityStore::load(&path).unwrap();
        assert_eq!(
            reloaded.legacy_key().to_string(),
            store.legacy_key().to_string()
        );
        assert_eq!(
            reloaded.noise_key().to_string(),
            store.noise_key().to_string()
        );
    }

    #[tokio::test]
    async fn test_lookup_is_idempotent_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let store = IdentityStore::load(&path).unwrap();
        let peer = MachinePrivate::generate().public();

        let first = store.lookup_or_provision(&peer).await.unwrap();
        let second = store.lookup_or_provision(&peer).await.unwrap();
        assert_eq!(first, second);

        // A fresh process sees the same substitute without any further write.
        let reloaded = IdentityStore::load(&path).unwrap();
        assert_eq!(reloaded.peer_count().await, 1);
        assert_eq!(reloaded.lookup_or_provision(&peer).await.unwrap(), first);

        let on_disk = read_state(&path);
        assert_eq!(
            on_disk.machines_mitm_keys.get(&peer.to_string()),
            Some(&first.to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_contact_provisions_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IdentityStore::load(state_path(&dir)).unwrap());
        let peer = MachinePrivate::generate().public();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.lookup_or_provision(&peer).await.unwrap() })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }

        assert!(keys.iter().all(|k| *k == keys[0]));
        assert_eq!(store.peer_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_peers_get_distinct_identities() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        let store = Arc::new(IdentityStore::load(&path).unwrap());
        let peers: Vec<_> = (0..8).map(|_| MachinePrivate::generate().public()).collect();

        let handles: Vec<_> = peers
            .iter()
            .copied()
            .map(|peer| {
                let store = store.clone();
                tokio::spawn(async move { store.lookup_or_provision(&peer).await.unwrap() })
            })
            .collect();
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().to_string());
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), peers.len());

        assert_eq!(read_state(&path).machines_mitm_keys.len(), peers.len());
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_disclosed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let store = IdentityStore::load(sub.join("state.json")).unwrap();
        std::fs::remove_dir_all(&sub).unwrap();

        let peer = MachinePrivate::generate().public();
        let err = store.lookup_or_provision(&peer).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(store.peer_count().await, 0);
    }

    #[test]
    fn test_corrupt_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);

        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(StoreError::CorruptState(_))
        ));

        let good = MachinePrivate::generate().to_string();
        let state = serde_json::json!({
            "Legacy": good,
            "Noise": good,
            "MachinesMitmKeys": { "mkey:1234": good },
        });
        std::fs::write(&path, state.to_string()).unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(StoreError::CorruptState(_))
        ));

        let state = serde_json::json!({ "Legacy": "privkey:00", "Noise": good });
        std::fs::write(&path, state.to_string()).unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(StoreError::CorruptState(_))
        ));
    }
}
