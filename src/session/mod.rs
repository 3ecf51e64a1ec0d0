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

//! Per-connection IMAP folder state and its lifecycle.
//!
//! The pieces, from the bottom up:
//!
//! - `range` parses and produces IMAP sequence sets.
//!
//! - `folder::FolderView` is one connection's view of one folder: the
//!   ordered entries with their UIDs, sequence numbers, and flags, plus
//!   whatever the connection has yet to be told about.
//!
//! - `lifecycle::Session` owns one `FolderView` and can swap it out for a
//!   serialised snapshot (`paged::PagedFolder`) while queueing changes that
//!   arrive in the meantime.
//!
//! - `manager::SessionManager` keeps track of every session, shares work
//!   between connections selecting the same folder, maintains the snapshot
//!   cache (`cache`), and runs the background eviction task (`eviction`)
//!   which keeps memory use bounded.
//!
//! The backing store is abstracted by `store::MailStore`. Everything which
//! touches both the store and a session does so while holding the
//! mailbox's lock, which is represented by `lifecycle::MailboxGuard`. A
//! session's own state can only be locked while holding that guard, so the
//! mailbox lock is always taken first.

pub mod cache;
pub mod eviction;
pub mod folder;
pub mod lifecycle;
pub mod manager;
pub mod model;
pub mod paged;
pub mod range;
pub mod store;

pub use self::cache::{CacheKey, CacheTier, TieredCache};
pub use self::folder::FolderView;
pub use self::lifecycle::{MailboxGuard, MailboxHandle, Reload, Session};
pub use self::manager::{InitialFolderValues, OpenedFolder, SessionManager};
pub use self::store::{ChangeBatch, MailStore};

#[cfg(test)]
pub(crate) mod test_prelude {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    pub(crate) use super::folder::FolderView;
    pub(crate) use super::lifecycle::MailboxHandle;
    pub(crate) use super::model::*;
    pub(crate) use super::store::*;
    use crate::support::error::Error;

    pub(crate) const MAILBOX: &str = "alice";

    /// An in-memory `MailStore`.
    pub(crate) struct TestStore {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        folders: BTreeMap<FolderId, TestFolder>,
        tags: BTreeMap<TagId, TagInfo>,
        version: u64,
        uid_validity: u32,
        assign_calls: usize,
        list_calls: usize,
    }

    struct TestFolder {
        info: FolderInfo,
        entries: Vec<StoreEntry>,
    }

    impl TestStore {
        /// Create a store with an empty `INBOX` as folder 1.
        pub(crate) fn new() -> Self {
            let this = TestStore {
                state: Mutex::new(State {
                    uid_validity: 1,
                    ..State::default()
                }),
            };
            this.add_folder(FolderId(1), "INBOX", None);
            this
        }

        pub(crate) fn add_folder(
            &self,
            folder: FolderId,
            path: &str,
            query: Option<&str>,
        ) {
            self.state.lock().unwrap().folders.insert(
                folder,
                TestFolder {
                    info: FolderInfo {
                        path: path.to_owned(),
                        uid_next: Uid::MIN,
                        recent_cutoff: 0,
                        query: query.map(str::to_owned),
                        selectable: true,
                    },
                    entries: Vec::new(),
                },
            );
        }

        /// Add an item to `folder`. If it has a UID, `uid_next` moves past
        /// it.
        pub(crate) fn add_item(
            &self,
            folder: FolderId,
            item: u32,
            uid: Option<u32>,
        ) -> StoreEntry {
            let entry = StoreEntry {
                item: ItemId(item),
                kind: ItemKind::Message,
                uid: uid.map(Uid::u),
                flags: PersistentFlags::empty(),
                tags: TagSet::EMPTY,
            };

            let mut state = self.state.lock().unwrap();
            let f = state.folders.get_mut(&folder).unwrap();
            if let Some(uid) = entry.uid {
                f.info.uid_next = f.info.uid_next.max(uid.saturating_next());
            }
            f.entries.push(entry.clone());
            entry
        }

        pub(crate) fn set_flags(
            &self,
            folder: FolderId,
            item: u32,
            flags: PersistentFlags,
        ) {
            let mut state = self.state.lock().unwrap();
            let f = state.folders.get_mut(&folder).unwrap();
            for entry in &mut f.entries {
                if ItemId(item) == entry.item {
                    entry.flags = flags;
                }
            }
        }

        /// Advance `uid_next` by `n` without adding anything.
        pub(crate) fn reserve_uids(&self, folder: FolderId, n: u32) {
            let mut state = self.state.lock().unwrap();
            let f = state.folders.get_mut(&folder).unwrap();
            f.info.uid_next = Uid::u(f.info.uid_next.get() + n);
        }

        pub(crate) fn define_tag(&self, bit: u8, name: &str) {
            let id = TagId::of(bit).unwrap();
            let mut state = self.state.lock().unwrap();
            let version = ChangeVersion(state.version);
            state.tags.insert(
                id,
                TagInfo {
                    id,
                    name: name.to_owned(),
                    version,
                },
            );
        }

        pub(crate) fn set_version(&self, version: u64) {
            self.state.lock().unwrap().version = version;
        }

        pub(crate) fn set_uid_validity(&self, uid_validity: u32) {
            self.state.lock().unwrap().uid_validity = uid_validity;
        }

        pub(crate) fn recent_cutoff(&self, folder: FolderId) -> u32 {
            self.state.lock().unwrap().folders[&folder].info.recent_cutoff
        }

        pub(crate) fn assign_calls(&self) -> usize {
            self.state.lock().unwrap().assign_calls
        }

        pub(crate) fn list_calls(&self) -> usize {
            self.state.lock().unwrap().list_calls
        }
    }

    impl MailStore for TestStore {
        fn folder_info(
            &self,
            _: &MailboxId,
            folder: FolderId,
        ) -> Result<FolderInfo, Error> {
            self.state
                .lock()
                .unwrap()
                .folders
                .get(&folder)
                .map(|f| f.info.clone())
                .ok_or(Error::NxFolder)
        }

        fn list_folder_entries(
            &self,
            _: &MailboxId,
            folder: FolderId,
        ) -> Result<Vec<StoreEntry>, Error> {
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            let f = state.folders.get(&folder).ok_or(Error::NxFolder)?;
            if f.info.query.is_none() {
                return Ok(f.entries.clone());
            }

            // Virtual folders match everything in the real ones
            Ok(state
                .folders
                .values()
                .filter(|f| f.info.query.is_none())
                .flat_map(|f| f.entries.iter().cloned())
                .collect())
        }

        fn assign_uids(
            &self,
            _: &MailboxId,
            folder: FolderId,
            items: &[ItemId],
        ) -> Result<Vec<Uid>, Error> {
            let mut state = self.state.lock().unwrap();
            state.assign_calls += 1;
            let f = state.folders.get_mut(&folder).ok_or(Error::NxFolder)?;

            let mut uids = Vec::with_capacity(items.len());
            for &item in items {
                let uid = f.info.uid_next;
                f.info.uid_next = uid.saturating_next();
                for entry in &mut f.entries {
                    if item == entry.item {
                        entry.uid = Some(uid);
                    }
                }
                uids.push(uid);
            }
            Ok(uids)
        }

        fn current_change_version(
            &self,
            _: &MailboxId,
            _: FolderId,
        ) -> Result<ChangeVersion, Error> {
            Ok(ChangeVersion(self.state.lock().unwrap().version))
        }

        fn current_uid_validity(
            &self,
            _: &MailboxId,
            _: FolderId,
        ) -> Result<UidValidity, Error> {
            Ok(UidValidity(self.state.lock().unwrap().uid_validity))
        }

        fn tag(
            &self,
            _: &MailboxId,
            tag: TagId,
        ) -> Result<Option<TagInfo>, Error> {
            Ok(self.state.lock().unwrap().tags.get(&tag).cloned())
        }

        fn record_recent_cutoff(
            &self,
            _: &MailboxId,
            folder: FolderId,
            uid: Uid,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            let f = state.folders.get_mut(&folder).ok_or(Error::NxFolder)?;
            f.info.recent_cutoff = f.info.recent_cutoff.max(uid.get());
            Ok(())
        }
    }

    pub(crate) fn mailbox_id() -> MailboxId {
        MailboxId(MAILBOX.to_owned())
    }

    pub(crate) fn handle(store: &Arc<TestStore>) -> Arc<MailboxHandle> {
        Arc::new(MailboxHandle::new(
            mailbox_id(),
            Arc::clone(store) as Arc<dyn MailStore>,
        ))
    }

    pub(crate) fn message(item: u32, uid: u32) -> MessageEntry {
        MessageEntry::new(
            ItemId(item),
            Uid::u(uid),
            ItemKind::Message,
            PersistentFlags::empty(),
            TagSet::EMPTY,
        )
    }

    /// A non-selected view of folder 1 containing plain messages with the
    /// given UIDs, each with an item id equal to its UID.
    pub(crate) fn view_with_uids(uids: &[u32]) -> FolderView {
        let store = TestStore::new();
        let mut view = FolderView::new(
            mailbox_id(),
            FolderId(1),
            UidValidity(1),
            "INBOX".to_owned(),
            None,
        );
        for &uid in uids {
            view.append(message(uid, uid), false, &store);
        }
        view
    }

    pub(crate) fn virtual_view() -> FolderView {
        FolderView::new(
            mailbox_id(),
            FolderId(50),
            UidValidity(1),
            "Search".to_owned(),
            Some("all".to_owned()),
        )
    }

    pub(crate) fn dirty_uids(view: &mut FolderView) -> Vec<Uid> {
        view.take_dirty().into_iter().map(|(uid, _)| uid).collect()
    }
}
