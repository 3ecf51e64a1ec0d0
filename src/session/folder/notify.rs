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

//! Applying backing store change batches to a view.

use log::warn;

use super::super::model::*;
use super::super::store::*;
use super::lookup::Appended;
use super::FolderView;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// The folder was deleted or became unselectable. The view is stale and
    /// the session using it must be torn down.
    FolderGone,
}

/// Whether `batch` deletes `folder` or makes it unselectable.
pub fn closes_folder(batch: &ChangeBatch, folder: FolderId) -> bool {
    batch
        .deleted
        .iter()
        .any(|d| matches!(*d, Deleted::Folder(f) if f == folder))
        || batch.modified.iter().any(|m| {
            matches!(
                *m,
                Modified::Folder {
                    folder: f,
                    selectable: false,
                    ..
                } if f == folder
            )
        })
}

/// Items seen during a batch which need to be added once everything else
/// in the batch has been applied.
#[derive(Default)]
struct Pending {
    entries: Vec<StoreEntry>,
}

impl Pending {
    fn contains(&self, item: ItemId) -> bool {
        self.entries.iter().any(|e| e.item == item)
    }

    fn remove(&mut self, item: ItemId) {
        self.entries.retain(|e| e.item != item);
    }

    /// Add `entry`, replacing anything already pending for the same item.
    fn put(&mut self, entry: &StoreEntry) {
        self.remove(entry.item);
        self.entries.push(entry.clone());
    }
}

impl FolderView {
    /// Apply every change in `batch`.
    ///
    /// Deletions are applied first, then creations, then modifications.
    /// Newly seen items are then added in UID order, with items lacking a
    /// usable UID getting one from `store`. Added entries are `ADDED` and
    /// dirty at the batch's version, and `\Recent` if `recent` is set.
    pub fn apply_batch(
        &mut self,
        batch: &ChangeBatch,
        store: &dyn MailStore,
        recent: bool,
    ) -> BatchOutcome {
        if closes_folder(batch, self.folder) {
            return BatchOutcome::FolderGone;
        }

        let mut pending = Pending::default();
        for deleted in &batch.deleted {
            self.on_deleted(deleted, batch.version, &mut pending);
        }
        for created in &batch.created {
            self.on_created(created, &mut pending);
        }
        for modified in &batch.modified {
            self.on_modified(modified, batch.version, store, &mut pending);
        }
        self.flush(pending, batch.version, store, recent);
        self.version = self.version.max(batch.version);

        BatchOutcome::Applied
    }

    fn on_deleted(
        &mut self,
        deleted: &Deleted,
        version: ChangeVersion,
        pending: &mut Pending,
    ) {
        match *deleted {
            Deleted::Tag(tag) => self.tag_deleted(tag, version),
            Deleted::Item(kind, item) if kind.is_listable() => {
                pending.remove(item);
                if let Some(uid) = self.uid_for_item(item) {
                    self.mark_expunged(uid);
                }
            }
            Deleted::Item(..) | Deleted::Folder(_) => (),
        }
    }

    fn on_created(&mut self, created: &Created, pending: &mut Pending) {
        let entry = &created.entry;
        if !entry.kind.is_listable()
            || (!self.is_virtual() && created.folder != self.folder)
        {
            return;
        }

        let known = self.lookup_by_item_id(entry.item).is_some()
            || entry.uid.map_or(false, |uid| {
                self.lookup_by_uid(uid).map_or(false, |e| !e.is_expunged())
            })
            || pending.contains(entry.item);
        if !known {
            pending.put(entry);
        }
    }

    fn on_modified(
        &mut self,
        modified: &Modified,
        version: ChangeVersion,
        store: &dyn MailStore,
        pending: &mut Pending,
    ) {
        let (folder, entry, changes) = match *modified {
            Modified::Tag(ref info) => {
                self.tag_renamed(info, version);
                return;
            }
            Modified::Folder {
                folder, ref path, ..
            } => {
                if folder == self.folder {
                    self.path = path.clone();
                }
                return;
            }
            Modified::Item {
                folder,
                ref entry,
                changes,
            } => (folder, entry, changes),
        };

        if !entry.kind.is_listable() {
            return;
        }

        let in_folder = self.is_virtual() || folder == self.folder;
        let existing = self
            .uid_for_item(entry.item)
            .filter(|&uid| self.lookup_by_uid(uid).map_or(false, |e| !e.is_expunged()));

        let uid = match existing {
            Some(uid) => uid,
            None => {
                if !in_folder {
                    pending.remove(entry.item);
                } else if pending.contains(entry.item)
                    || changes.intersects(ItemChanges::FOLDER | ItemChanges::UID)
                {
                    pending.put(entry);
                }
                return;
            }
        };

        if !in_folder {
            self.mark_expunged(uid);
            return;
        }

        if changes.contains(ItemChanges::UID) {
            match entry.uid {
                Some(new_uid) if new_uid <= uid => (),
                _ => {
                    self.mark_expunged(uid);
                    pending.put(entry);
                    return;
                }
            }
        }

        if changes.intersects(
            ItemChanges::FLAGS | ItemChanges::TAGS | ItemChanges::UNREAD,
        ) {
            let changed = match self.lookup_by_uid_mut(uid) {
                Some(cached) => cached.set_persistent(entry.flags, entry.tags),
                None => false,
            };
            if changed {
                self.refresh_tags(entry.tags, store);
                self.mark_dirty(uid, version);
            }
        }
    }

    fn flush(
        &mut self,
        pending: Pending,
        version: ChangeVersion,
        store: &dyn MailStore,
        recent: bool,
    ) {
        if pending.entries.is_empty() {
            return;
        }

        let (mut numbered, mut unnumbered): (Vec<StoreEntry>, Vec<StoreEntry>) =
            pending.entries.into_iter().partition(|e| e.uid.is_some());
        numbered.sort_by_key(|e| e.uid);

        let mut added = Vec::new();
        for entry in numbered {
            let uid = match entry.uid {
                Some(uid) => uid,
                None => continue,
            };

            if self.append_added(MessageEntry::from_store(&entry, uid), recent, store)
            {
                added.push(uid);
            } else {
                unnumbered.push(entry);
            }
        }

        if !unnumbered.is_empty() {
            let items: Vec<ItemId> = unnumbered.iter().map(|e| e.item).collect();
            match store.assign_uids(&self.mailbox, self.folder, &items) {
                Ok(uids) => {
                    for (entry, uid) in unnumbered.iter().zip(uids) {
                        if self.append_added(
                            MessageEntry::from_store(entry, uid),
                            recent,
                            store,
                        ) {
                            added.push(uid);
                        } else {
                            warn!(
                                "{}/{:?}: newly assigned {:?} for {:?} is not \
                                 beyond the entries already reported",
                                self.mailbox, self.folder, uid, entry.item
                            );
                        }
                    }
                }
                Err(e) => warn!(
                    "{}/{:?}: failed to assign UIDs to {} new items: {}",
                    self.mailbox,
                    self.folder,
                    items.len(),
                    e
                ),
            }
        }

        for uid in added {
            self.mark_dirty(uid, version);
        }
    }

    fn append_added(
        &mut self,
        mut entry: MessageEntry,
        recent: bool,
        store: &dyn MailStore,
    ) -> bool {
        entry.session_flags_mut().insert(SessionFlags::ADDED);
        Appended::NeedsRenumber != self.append(entry, recent, store)
    }
}
