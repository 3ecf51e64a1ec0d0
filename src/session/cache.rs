//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! The two-tier folder view snapshot cache.
//!
//! The *active* tier holds snapshots of sessions paged out by the eviction
//! task. These are expected to be read back soon. It lives on disk if a
//! cache directory is configured and in memory otherwise.
//!
//! The *inactive* tier holds snapshots written when a connection closes a
//! folder, which are only useful if some connection selects the folder again
//! before anything changes. It is a bounded in-memory LRU with idle expiry.
//!
//! Snapshots of views with expunges the connection has not yet been told
//! about are keyed with the owning session's id, so they can never be handed
//! to another connection.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::prelude::*;
use log::warn;
use serde::{Deserialize, Serialize};

use super::folder::{FolderView, SessionData};
use super::model::*;
use crate::support::compression::{compress_with, decompressor_for, Compression};
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::escape_file_name;
use crate::support::system_config::CacheConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Active,
    Inactive,
}

/// Identifies one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tier: CacheTier,
    pub mailbox: MailboxId,
    pub folder: FolderId,
    pub version: ChangeVersion,
    pub uid_validity: UidValidity,
    /// Set if the snapshot may only be read back by this session.
    pub private_to: Option<SessionId>,
}

impl CacheKey {
    /// The key any session may use for the given folder state.
    pub fn shared(
        tier: CacheTier,
        mailbox: MailboxId,
        folder: FolderId,
        version: ChangeVersion,
        uid_validity: UidValidity,
    ) -> Self {
        CacheKey {
            tier,
            mailbox,
            folder,
            version,
            uid_validity,
            private_to: None,
        }
    }

    /// The key for a snapshot of `view` owned by `session`.
    ///
    /// This is private to `session` if the view has unswept expunges.
    pub fn for_view(
        tier: CacheTier,
        view: &FolderView,
        version: ChangeVersion,
        session: SessionId,
    ) -> Self {
        CacheKey {
            private_to: if view.has_expunges() {
                Some(session)
            } else {
                None
            },
            ..CacheKey::shared(
                tier,
                view.mailbox().clone(),
                view.folder(),
                version,
                view.uid_validity(),
            )
        }
    }

    pub fn in_tier(&self, tier: CacheTier) -> Self {
        CacheKey {
            tier,
            ..self.clone()
        }
    }

    pub fn is_shared(&self) -> bool {
        self.private_to.is_none()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sep = match self.tier {
            CacheTier::Active => '_',
            CacheTier::Inactive => ':',
        };
        write!(
            f,
            "{mbox}{sep}{folder}{sep}{version}{sep}{uv}",
            mbox = self.mailbox,
            sep = sep,
            folder = self.folder.0,
            version = self.version.0,
            uv = self.uid_validity.0,
        )?;
        if let Some(session) = self.private_to {
            write!(f, "+{}", session.0)?;
        }
        Ok(())
    }
}

const SNAPSHOT_FORMAT: u32 = 1;

/// The serialised form of a folder view.
#[derive(Serialize, Deserialize, Debug)]
pub struct Snapshot {
    pub format: u32,
    pub created: DateTime<Utc>,
    pub version: ChangeVersion,
    pub folder: FolderView,
    pub session: Option<SessionData>,
}

impl Snapshot {
    pub fn new(view: &FolderView, version: ChangeVersion) -> Self {
        Snapshot {
            format: SNAPSHOT_FORMAT,
            created: Utc::now(),
            version,
            folder: view.clone(),
            session: view.capture_session(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut result = Ok(());
        let blob = compress_with(Compression::DEFAULT_FOR_SNAPSHOT, |w| {
            result = serde_cbor::to_writer(w, self);
            Ok(())
        })?;
        result?;
        Ok(blob)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, Error> {
        let snapshot: Snapshot =
            serde_cbor::from_reader(decompressor_for(blob)?)?;
        if SNAPSHOT_FORMAT != snapshot.format {
            return Err(Error::UnsupportedSnapshot(snapshot.format));
        }

        let mut folder = snapshot.folder;
        folder.restore_session(snapshot.session.clone());
        Ok(Snapshot { folder, ..snapshot })
    }
}

/// Storage for one cache tier.
pub trait SnapshotStore: Send + Sync {
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), Error>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Snapshots stored as files in a directory.
pub struct DiskSnapshots {
    dir: PathBuf,
    tmp: PathBuf,
}

impl DiskSnapshots {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        let tmp = dir.join("tmp");
        fs::create_dir_all(&tmp)?;
        Ok(DiskSnapshots { dir, tmp })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.snap", escape_file_name(key)))
    }
}

impl SnapshotStore for DiskSnapshots {
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), Error> {
        file_ops::spit(&self.tmp, self.path_for(key), 0o600, &blob)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.path_for(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        fs::remove_file(self.path_for(key)).ignore_not_found()?;
        Ok(())
    }
}

/// Snapshots held in memory.
pub struct MemorySnapshots {
    cache: moka::sync::Cache<String, Arc<Vec<u8>>>,
}

impl MemorySnapshots {
    /// An LRU holding about `capacity_bytes` of snapshots, discarding any
    /// not read for `idle` if given.
    pub fn bounded(capacity_bytes: u64, idle: Option<Duration>) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .weigher(|key: &String, blob: &Arc<Vec<u8>>| {
                (key.len() + blob.len()).min(u32::MAX as usize) as u32
            })
            .max_capacity(capacity_bytes);
        if let Some(idle) = idle {
            builder = builder.time_to_idle(idle);
        }

        MemorySnapshots {
            cache: builder.build(),
        }
    }

    pub fn unbounded() -> Self {
        MemorySnapshots {
            cache: moka::sync::Cache::builder().build(),
        }
    }
}

impl SnapshotStore for MemorySnapshots {
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), Error> {
        self.cache.insert(key.to_owned(), Arc::new(blob));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.cache.get(key).map(|blob| blob.as_ref().clone()))
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.cache.invalidate(key);
        Ok(())
    }
}

/// Both cache tiers.
///
/// Every active-tier snapshot is claimed by the paged sessions it was
/// written for, and is removed once the last of them lets go of it through
/// `release()`. This keeps at most one active-tier snapshot per paged
/// session, however many times each is reserialised.
pub struct TieredCache {
    active: Box<dyn SnapshotStore>,
    inactive: Box<dyn SnapshotStore>,
    active_claims: Mutex<HashMap<String, usize>>,
}

impl TieredCache {
    pub fn new(
        active: Box<dyn SnapshotStore>,
        inactive: Box<dyn SnapshotStore>,
    ) -> Self {
        TieredCache {
            active,
            inactive,
            active_claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, Error> {
        let active: Box<dyn SnapshotStore> = match config.directory {
            Some(ref dir) => Box::new(DiskSnapshots::new(dir)?),
            None => Box::new(MemorySnapshots::bounded(
                config.active_capacity_bytes,
                None,
            )),
        };
        let inactive = Box::new(MemorySnapshots::bounded(
            config.inactive_capacity_bytes,
            Some(Duration::from_secs(config.inactive_idle_secs)),
        ));
        Ok(TieredCache::new(active, inactive))
    }

    /// Both tiers in memory, unbounded.
    pub fn in_memory() -> Self {
        TieredCache::new(
            Box::new(MemorySnapshots::unbounded()),
            Box::new(MemorySnapshots::unbounded()),
        )
    }

    fn tier(&self, tier: CacheTier) -> &dyn SnapshotStore {
        match tier {
            CacheTier::Active => &*self.active,
            CacheTier::Inactive => &*self.inactive,
        }
    }

    /// Write a snapshot of `view` at `key`.
    ///
    /// For the active tier, this also claims the snapshot for the caller,
    /// who must eventually `release()` it.
    pub fn put(
        &self,
        key: &CacheKey,
        view: &FolderView,
    ) -> Result<(), Error> {
        let name = key.to_string();
        let blob = Snapshot::new(view, key.version).encode()?;
        match key.tier {
            CacheTier::Active => {
                let mut claims = self.active_claims.lock().unwrap();
                self.active.put(&name, blob)?;
                *claims.entry(name).or_insert(0) += 1;
                Ok(())
            }
            CacheTier::Inactive => self.inactive.put(&name, blob),
        }
    }

    /// The number of paged sessions still relying on the active-tier
    /// snapshot at `key`.
    pub fn claims(&self, key: &CacheKey) -> usize {
        self.active_claims
            .lock()
            .unwrap()
            .get(&key.in_tier(CacheTier::Active).to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Give up one claim on the snapshot at `key`.
    ///
    /// An active-tier snapshot is removed when its last claim goes.
    /// Inactive-tier snapshots are never claimed and are left for the LRU to
    /// expire. Returns whether anything was removed.
    pub fn release(&self, key: &CacheKey) -> Result<bool, Error> {
        if CacheTier::Inactive == key.tier {
            return Ok(false);
        }

        let name = key.to_string();
        let mut claims = self.active_claims.lock().unwrap();
        if let Some(count) = claims.get_mut(&name) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return Ok(false);
            }
        }

        claims.remove(&name);
        self.active.remove(&name)?;
        Ok(true)
    }

    /// Read the snapshot at `key`.
    ///
    /// A snapshot which cannot be decoded is logged and discarded, and
    /// treated as a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Snapshot>, Error> {
        let name = key.to_string();
        let store = self.tier(key.tier);
        let blob = match store.get(&name)? {
            Some(blob) => blob,
            None => return Ok(None),
        };

        match Snapshot::decode(&blob) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Discarding unreadable snapshot {}: {}", name, e);
                store.remove(&name)?;
                Ok(None)
            }
        }
    }

    /// Find a snapshot any session may use for the given shared key,
    /// checking the inactive tier first.
    pub fn lookup_shared(
        &self,
        key: &CacheKey,
    ) -> Result<Option<Snapshot>, Error> {
        if !key.is_shared() {
            return Ok(None);
        }

        for &tier in &[CacheTier::Inactive, CacheTier::Active] {
            if let Some(snapshot) = self.get(&key.in_tier(tier))? {
                return Ok(Some(snapshot));
            }
        }

        Ok(None)
    }

    /// Remove `key` from both tiers, regardless of any claims.
    pub fn clear(&self, key: &CacheKey) -> Result<(), Error> {
        let active = key.in_tier(CacheTier::Active).to_string();
        self.active_claims.lock().unwrap().remove(&active);
        self.active.remove(&active)?;
        self.inactive
            .remove(&key.in_tier(CacheTier::Inactive).to_string())
    }

    /// Remove a snapshot that has just been consumed.
    ///
    /// Active-tier snapshots are left alone, since other sessions paged out
    /// at the same folder state share them; those are removed through
    /// `release()` instead. Returns whether anything was removed.
    pub fn safe_remove(&self, key: &CacheKey) -> Result<bool, Error> {
        match key.tier {
            CacheTier::Active => Ok(false),
            CacheTier::Inactive => {
                self.inactive.remove(&key.to_string())?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::super::test_prelude::*;
    use super::*;

    fn key(tier: CacheTier) -> CacheKey {
        CacheKey::shared(
            tier,
            mailbox_id(),
            FolderId(3),
            ChangeVersion(17),
            UidValidity(42),
        )
    }

    #[test]
    fn key_formats() {
        assert_eq!("alice_3_17_42", key(CacheTier::Active).to_string());
        assert_eq!("alice:3:17:42", key(CacheTier::Inactive).to_string());

        let mut private = key(CacheTier::Inactive);
        private.private_to = Some(SessionId(9));
        assert_eq!("alice:3:17:42+9", private.to_string());
        assert_eq!(
            "alice_3_17_42+9",
            private.in_tier(CacheTier::Active).to_string()
        );
    }

    #[test]
    fn view_key_is_private_with_expunges() {
        let mut view = view_with_uids(&[1, 2]);
        view.begin_select(true, false);
        let k = CacheKey::for_view(
            CacheTier::Active,
            &view,
            ChangeVersion(1),
            SessionId(5),
        );
        assert!(k.is_shared());

        view.mark_expunged(Uid::u(1));
        let k = CacheKey::for_view(
            CacheTier::Active,
            &view,
            ChangeVersion(1),
            SessionId(5),
        );
        assert_eq!(Some(SessionId(5)), k.private_to);
    }

    #[test]
    fn snapshot_preserves_view_and_session() {
        let store = TestStore::new();
        store.define_tag(2, "Later");
        let mut view = view_with_uids(&[1, 2, 7]);
        view.begin_select(true, true);
        let mut tagged = message(9, 9);
        let mut tags = TagSet::EMPTY;
        tags.insert(TagId::of(2).unwrap());
        tagged.set_persistent(PersistentFlags::FLAGGED, tags);
        view.append(tagged, true, &store);
        view.mark_expunged(Uid::u(2));
        view.mark_dirty(Uid::u(7), ChangeVersion(3));
        view.save_search(vec![Uid::u(1), Uid::u(9)]);

        let blob = Snapshot::new(&view, ChangeVersion(4)).encode().unwrap();
        let snapshot = Snapshot::decode(&blob).unwrap();
        assert_eq!(ChangeVersion(4), snapshot.version);

        let mut restored = snapshot.folder;
        assert_eq!(view.entries(), restored.entries());
        assert_eq!(view.capture_session(), restored.capture_session());
        assert_eq!(view.tag_cache(), restored.tag_cache());
        assert_eq!(view.path(), restored.path());
        // The reverse index is rebuilt on demand
        assert_eq!(
            Some(Uid::u(9)),
            restored.lookup_by_item_id(ItemId(9)).map(MessageEntry::uid)
        );
    }

    #[test]
    fn corrupt_snapshot_is_a_miss() {
        let cache = TieredCache::in_memory();
        let k = key(CacheTier::Active);
        cache.active.put(&k.to_string(), vec![1, 2, 3]).unwrap();
        assert!(cache.get(&k).unwrap().is_none());
        assert!(cache.active.get(&k.to_string()).unwrap().is_none());
    }

    #[test]
    fn tiers_and_safe_remove() {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::from_config(&CacheConfig {
            directory: Some(dir.path().to_owned()),
            ..CacheConfig::default()
        })
        .unwrap();
        let view = view_with_uids(&[1, 2, 3]);

        cache.put(&key(CacheTier::Active), &view).unwrap();
        assert!(dir.path().join("alice_3_17_42.snap").is_file());
        assert!(cache.get(&key(CacheTier::Inactive)).unwrap().is_none());
        assert_eq!(
            3,
            cache
                .lookup_shared(&key(CacheTier::Inactive))
                .unwrap()
                .unwrap()
                .folder
                .len()
        );
        assert!(!cache.safe_remove(&key(CacheTier::Active)).unwrap());
        assert!(cache.get(&key(CacheTier::Active)).unwrap().is_some());

        cache.put(&key(CacheTier::Inactive), &view).unwrap();
        assert!(cache.safe_remove(&key(CacheTier::Inactive)).unwrap());
        assert!(cache.get(&key(CacheTier::Inactive)).unwrap().is_none());

        cache.clear(&key(CacheTier::Active)).unwrap();
        assert!(cache.lookup_shared(&key(CacheTier::Active)).unwrap().is_none());
    }

    #[test]
    fn active_snapshots_go_with_their_last_claim() {
        let cache = TieredCache::in_memory();
        let view = view_with_uids(&[1]);
        let k = key(CacheTier::Active);
        cache.put(&k, &view).unwrap();
        cache.put(&k, &view).unwrap();
        assert_eq!(2, cache.claims(&k));

        assert!(!cache.release(&k).unwrap());
        assert!(cache.get(&k).unwrap().is_some());
        assert!(cache.release(&k).unwrap());
        assert_eq!(0, cache.claims(&k));
        assert!(cache.get(&k).unwrap().is_none());

        // Inactive snapshots are left to the LRU
        let k = key(CacheTier::Inactive);
        cache.put(&k, &view).unwrap();
        assert_eq!(0, cache.claims(&k));
        assert!(!cache.release(&k).unwrap());
        assert!(cache.get(&k).unwrap().is_some());
    }

    #[test]
    fn private_keys_never_shared() {
        let cache = TieredCache::in_memory();
        let view = view_with_uids(&[1]);
        let mut k = key(CacheTier::Inactive);
        k.private_to = Some(SessionId(1));
        cache.put(&k, &view).unwrap();

        assert!(cache.lookup_shared(&k).unwrap().is_none());
        assert!(cache.lookup_shared(&key(CacheTier::Inactive)).unwrap().is_none());
        assert!(cache.get(&k).unwrap().is_some());
    }
}
