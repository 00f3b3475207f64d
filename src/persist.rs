//! Persistence of the routing table across restarts.

use crate::{bencode, compact, id::NodeId};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::{sync::mpsc, task};

/// One node of a routing table snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContact {
    #[serde(with = "compact::addr")]
    pub addr: SocketAddr,
    pub id: NodeId,
    /// Last time we heard from the node, in seconds since the unix epoch.
    pub last_action_ts: u64,
}

impl StoredContact {
    /// Convert the monotonic timestamp of the routing table into wall clock time.
    pub(crate) fn new(addr: SocketAddr, id: NodeId, last_action: Instant, now: Instant) -> Self {
        let age = now.saturating_duration_since(last_action);
        let last_action_ts = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .map(|ts| ts.as_secs())
            .unwrap_or(0);

        Self {
            addr,
            id,
            last_action_ts,
        }
    }

    /// Time since the node was last heard from. A timestamp in the future counts as fresh.
    pub(crate) fn age(&self) -> Duration {
        let ts = UNIX_EPOCH + Duration::from_secs(self.last_action_ts);
        SystemTime::now().duration_since(ts).unwrap_or_default()
    }
}

/// Where the routing table is saved to and loaded from.
///
/// `save` must be crash safe: a failure must leave the previously saved snapshot intact.
pub trait RoutingStore: Send + 'static {
    fn load(&mut self) -> io::Result<Vec<StoredContact>>;
    fn save(&mut self, contacts: &[StoredContact]) -> io::Result<()>;
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    contacts: Vec<StoredContact>,
}

/// Stores the snapshot as a bencoded file. A new snapshot is written next to the file and then
/// renamed over it.
#[derive(Debug)]
pub struct FileRoutingStore {
    path: PathBuf,
}

impl FileRoutingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".tmp");
        path.into()
    }
}

impl RoutingStore for FileRoutingStore {
    fn load(&mut self) -> io::Result<Vec<StoredContact>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        bencode::decode(&bytes, bencode::MAX_DEPTH_LOCAL)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

        let snapshot: Snapshot = serde_bencode::from_bytes(&bytes)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

        Ok(snapshot.contacts)
    }

    fn save(&mut self, contacts: &[StoredContact]) -> io::Result<()> {
        let snapshot = Snapshot {
            contacts: contacts.to_vec(),
        };
        let bytes = serde_bencode::to_bytes(&snapshot)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;

        let tmp_path = self.tmp_path();
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path)
    }
}

/// Keeps the snapshot in memory. Used when no store is configured.
#[derive(Clone, Debug, Default)]
pub struct MemoryRoutingStore {
    contacts: Vec<StoredContact>,
}

impl MemoryRoutingStore {
    pub fn new(contacts: Vec<StoredContact>) -> Self {
        Self { contacts }
    }

    pub fn contacts(&self) -> &[StoredContact] {
        &self.contacts
    }
}

impl RoutingStore for MemoryRoutingStore {
    fn load(&mut self) -> io::Result<Vec<StoredContact>> {
        Ok(self.contacts.clone())
    }

    fn save(&mut self, contacts: &[StoredContact]) -> io::Result<()> {
        self.contacts = contacts.to_vec();
        Ok(())
    }
}

/// Saves snapshots on the blocking thread pool so that file I/O never stalls the worker.
pub(crate) struct SnapshotWriter {
    tx: mpsc::UnboundedSender<Vec<StoredContact>>,
    task: task::JoinHandle<()>,
}

impl SnapshotWriter {
    pub fn spawn(mut store: Box<dyn RoutingStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<StoredContact>>();

        let task = task::spawn_blocking(move || {
            while let Some(contacts) = rx.blocking_recv() {
                match store.save(&contacts) {
                    Ok(()) => log::debug!("Saved {} contacts", contacts.len()),
                    Err(error) => log::warn!("Failed to save routing snapshot: {}", error),
                }
            }
        });

        Self { tx, task }
    }

    pub fn save(&self, contacts: Vec<StoredContact>) {
        if self.tx.send(contacts).is_err() {
            log::error!("Snapshot writer has terminated");
        }
    }

    /// Wait for all pending snapshots to be written.
    pub async fn close(self) {
        drop(self.tx);

        if let Err(error) = self.task.await {
            log::error!("Snapshot writer panicked: {}", error);
        }
    }
}

/// Contacts of a loaded snapshot that are recent enough to be contacted.
pub(crate) fn fresh_contacts(
    contacts: Vec<StoredContact>,
    max_age: Duration,
) -> Vec<StoredContact> {
    contacts
        .into_iter()
        .filter(|contact| contact.addr.is_ipv4() && contact.age() <= max_age)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn contacts(now: Instant) -> Vec<StoredContact> {
        test::dummy_block_node_handles(3)
            .into_iter()
            .map(|handle| StoredContact::new(handle.addr, handle.id, now, now))
            .collect()
    }

    #[test]
    fn positive_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.dat");
        let contacts = contacts(Instant::now());

        FileRoutingStore::new(&path).save(&contacts).unwrap();
        let loaded = FileRoutingStore::new(&path).load().unwrap();

        assert_eq!(loaded, contacts);
        assert!(!dir.path().join("routing.dat.tmp").exists());
    }

    #[test]
    fn positive_missing_file_is_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileRoutingStore::new(dir.path().join("nothing.dat"));

        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn positive_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileRoutingStore::new(dir.path().join("routing.dat"));
        let contacts = contacts(Instant::now());

        store.save(&contacts).unwrap();
        store.save(&contacts[..1]).unwrap();

        assert_eq!(store.load().unwrap(), &contacts[..1]);
    }

    #[test]
    fn negative_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.dat");
        fs::write(&path, b"d8:contactsli1eee").unwrap();

        let error = FileRoutingStore::new(&path).load().unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn negative_overly_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.dat");
        let depth = bencode::MAX_DEPTH_LOCAL + 1;
        let mut data = b"d8:contacts".to_vec();
        data.extend(std::iter::repeat(b'l').take(depth));
        data.extend(std::iter::repeat(b'e').take(depth + 1));
        fs::write(&path, data).unwrap();

        let error = FileRoutingStore::new(&path).load().unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert!(error.to_string().contains("depth"));
    }

    #[test]
    fn positive_memory_store_round_trip() {
        let contacts = contacts(Instant::now());
        let mut store = MemoryRoutingStore::default();

        store.save(&contacts).unwrap();

        assert_eq!(store.load().unwrap(), contacts);
        assert_eq!(store.contacts(), &contacts[..]);
    }

    #[test]
    fn negative_stale_contacts_ignored() {
        let now = Instant::now();
        let handles = test::dummy_block_node_handles(2);
        let fresh = StoredContact::new(handles[0].addr, handles[0].id, now, now);
        let mut stale = StoredContact::new(handles[1].addr, handles[1].id, now, now);
        stale.last_action_ts -= 2 * 60 * 60;

        let loaded = fresh_contacts(vec![fresh.clone(), stale], Duration::from_secs(60 * 60));

        assert_eq!(loaded, vec![fresh]);
    }
}
