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

use std::collections::HashMap;

use log::warn;

use super::super::model::*;
use super::super::store::MailStore;
use super::FolderView;

/// Where `FolderView::append()` put an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    /// Added after every other entry.
    Tail(Seqnum),
    /// An entry with the same UID was already present and was replaced.
    Replaced(Seqnum),
    /// Inserted before some entries the client has not been told about yet.
    Inserted(Seqnum),
    /// The UID sorts before entries the client already knows about. The
    /// entry was not added; it must be given a new UID first.
    NeedsRenumber,
}

impl Appended {
    pub fn seqnum(self) -> Option<Seqnum> {
        match self {
            Appended::Tail(s) | Appended::Replaced(s) | Appended::Inserted(s) => {
                Some(s)
            }
            Appended::NeedsRenumber => None,
        }
    }
}

impl FolderView {
    /// Look up the live entry for the given backing store item.
    ///
    /// Entries marked expunged are treated as absent.
    pub fn lookup_by_item_id(&mut self, item: ItemId) -> Option<&MessageEntry> {
        let uid = self.uid_for_item(item)?;
        self.lookup_by_uid(uid).filter(|e| !e.is_expunged())
    }

    /// Find the UID of the entry for `item`, preferring a live entry over
    /// one marked expunged.
    pub(super) fn uid_for_item(&mut self, item: ItemId) -> Option<Uid> {
        // Fast path: the UID and item id are usually the same
        let direct = Uid::of(item.0)
            .and_then(|u| self.lookup_by_uid(u))
            .filter(|e| e.item() == item)
            .map(|e| (e.uid(), e.is_expunged()));
        if let Some((uid, false)) = direct {
            return Some(uid);
        }

        self.item_index()
            .get(&item)
            .copied()
            .or_else(|| direct.map(|(uid, _)| uid))
    }

    fn item_index(&mut self) -> &HashMap<ItemId, Uid> {
        let entries = &self.entries;
        self.item_index.get_or_insert_with(|| {
            entries
                .iter()
                .filter(|e| e.item().0 != e.uid().get())
                .map(|e| (e.item(), e.uid()))
                .collect()
        })
    }

    pub fn lookup_by_uid(&self, uid: Uid) -> Option<&MessageEntry> {
        self.index_of_uid(uid).map(|ix| &self.entries[ix])
    }

    pub(super) fn lookup_by_uid_mut(
        &mut self,
        uid: Uid,
    ) -> Option<&mut MessageEntry> {
        self.index_of_uid(uid).map(move |ix| &mut self.entries[ix])
    }

    pub fn lookup_by_seqnum(&self, seqnum: Seqnum) -> Option<&MessageEntry> {
        self.entries.get(seqnum.to_index())
    }

    /// Return the current sequence number of the entry with the given UID.
    pub fn seqnum_of(&self, uid: Uid) -> Option<Seqnum> {
        self.index_of_uid(uid).map(Seqnum::from_index)
    }

    pub(super) fn index_of_uid(&self, uid: Uid) -> Option<usize> {
        self.entries.binary_search_by_key(&uid, |e| e.uid()).ok()
    }

    pub fn last_entry(&self) -> Option<&MessageEntry> {
        self.entries.last()
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.entries.last().map(MessageEntry::uid)
    }

    /// Iterate the UIDs of entries not marked expunged, in ascending order.
    pub fn live_uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_expunged())
            .map(MessageEntry::uid)
    }

    /// Iterate `(Seqnum, entry)` pairs for every entry.
    pub fn seqnums_entries(
        &self,
    ) -> impl Iterator<Item = (Seqnum, &MessageEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(ix, e)| (Seqnum::from_index(ix), e))
    }

    /// The sequence number of the first unread entry, for the initial
    /// `UNSEEN` response.
    pub fn first_unread(&self) -> Option<Seqnum> {
        self.entries
            .iter()
            .position(|e| {
                e.flags().contains(PersistentFlags::UNREAD) && !e.is_expunged()
            })
            .map(Seqnum::from_index)
    }

    /// Add an entry to the view.
    ///
    /// Normally the entry's UID is greater than every UID present and it is
    /// simply added at the end. If an entry with that UID already exists it
    /// is replaced. An entry with a lower UID is inserted in place only if
    /// every entry after that point has not yet been reported to the client;
    /// otherwise nothing is added and `NeedsRenumber` is returned.
    ///
    /// If `recent`, the entry is flagged `\Recent`. Any tags on the entry not
    /// yet in the tag cache are looked up through `store`.
    pub fn append(
        &mut self,
        mut entry: MessageEntry,
        recent: bool,
        store: &dyn MailStore,
    ) -> Appended {
        let uid = entry.uid();
        if recent {
            entry.session_flags_mut().insert(SessionFlags::RECENT);
        }

        let ix = match self.entries.last() {
            None => self.entries.len(),
            Some(last) if last.uid() < uid => self.entries.len(),
            _ => self.entries.partition_point(|e| e.uid() < uid),
        };

        let outcome = if ix == self.entries.len() {
            if let Some(ref mut index) = self.item_index {
                if entry.item().0 != uid.get() {
                    index.insert(entry.item(), uid);
                }
            }
            self.entries.push(entry);
            Appended::Tail(Seqnum::from_index(ix))
        } else if self.entries[ix].uid() == uid {
            warn!(
                "{}/{:?}: duplicate {:?} ({:?} replaced by {:?})",
                self.mailbox,
                self.folder,
                uid,
                self.entries[ix].item(),
                entry.item()
            );
            let old = std::mem::replace(&mut self.entries[ix], entry);
            self.forget(&old);
            self.item_index = None;
            Appended::Replaced(Seqnum::from_index(ix))
        } else if self.entries[ix..].iter().all(MessageEntry::is_added) {
            self.entries.insert(ix, entry);
            self.item_index = None;
            Appended::Inserted(Seqnum::from_index(ix))
        } else {
            return Appended::NeedsRenumber;
        };

        if recent {
            if let Some(ref mut session) = self.session {
                session.recent_count += 1;
            }
        }

        let tags = self.entries[ix].tags();
        self.refresh_tags(tags, store);
        outcome
    }

    /// Drop counters and dirty state held for an entry that is leaving the
    /// view.
    pub(super) fn forget(&mut self, entry: &MessageEntry) {
        if let Some(ref mut session) = self.session {
            session.dirty.remove(&entry.uid());
            if entry.is_recent() {
                session.recent_count = session.recent_count.saturating_sub(1);
            }
            if entry.is_expunged() {
                session.expunged_count =
                    session.expunged_count.saturating_sub(1);
            }
        }

        if let Some(ref mut index) = self.item_index {
            index.remove(&entry.item());
        }
    }
}
