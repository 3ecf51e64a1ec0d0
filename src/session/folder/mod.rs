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

//! One connection's view of one folder.
//!
//! A `FolderView` is the ordered list of `MessageEntry` values making up the
//! folder as far as the connection is concerned, plus the connection-specific
//! state needed to tell the client about changes.
//!
//! The entry list is always in strictly ascending UID order, and a message's
//! sequence number is simply its index plus one. Entries removed from the
//! backing store are first marked `EXPUNGED` and stay in place (keeping every
//! sequence number stable) until the connection is in a position to report
//! the removals, at which point `sweep_expunged()` physically removes them.
//!
//! The view is split into two parts:
//!
//! - The entry list, folder metadata, and tag cache. These are what gets
//!   serialised into cache snapshots and are suitable for sharing with other
//!   connections (after resetting the session flags on each entry).
//!
//! - `SessionData`, which only exists while a connection has the folder
//!   selected. It holds the `\Recent` and expunge counters, the set of dirty
//!   entries awaiting unsolicited `FETCH` responses, and the saved search
//!   result.
//!
//! Nothing here does I/O beyond looking up unknown tags through the
//! `MailStore` passed in by the caller.
//!
//! This is a single abstraction split into several files for manageability.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::model::*;
use crate::support::error::Error;

mod dirty;
mod flags;
mod lookup;
mod notify;
mod sequence;

pub use self::flags::{FlagDef, FlagKind, TagCache};
pub use self::lookup::Appended;
pub use self::notify::{closes_folder, BatchOutcome};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderView {
    mailbox: MailboxId,
    folder: FolderId,
    uid_validity: UidValidity,
    path: String,
    /// The search defining a virtual folder's membership.
    query: Option<String>,
    entries: Vec<MessageEntry>,
    tags: TagCache,
    /// The latest change version reflected in `entries`.
    version: ChangeVersion,

    /// Maps item ids to UIDs for entries where the two differ.
    ///
    /// Built on first use. Set back to `None` instead of being repaired
    /// whenever a bulk change makes incremental maintenance awkward.
    #[serde(skip)]
    item_index: Option<HashMap<ItemId, Uid>>,

    #[serde(skip)]
    session: Option<SessionData>,
}

/// State which only exists while a connection has the folder selected.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionData {
    writable: bool,
    condstore: bool,
    /// The entry count last reported to the client via `EXISTS`.
    last_size: usize,
    recent_count: usize,
    expunged_count: usize,
    /// Set when new tags were discovered and the client should get a fresh
    /// `FLAGS` response.
    tags_dirty: bool,
    notifications_suspended: bool,
    /// The UIDs in the saved search result (`$`), if one was saved.
    saved_search: Option<BTreeSet<Uid>>,
    /// Entries changed since the client was last told, with the greatest
    /// change version affecting each.
    dirty: BTreeMap<Uid, ChangeVersion>,
}

impl SessionData {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn expunged_count(&self) -> usize {
        self.expunged_count
    }
}

impl FolderView {
    pub fn new(
        mailbox: MailboxId,
        folder: FolderId,
        uid_validity: UidValidity,
        path: String,
        query: Option<String>,
    ) -> Self {
        Self {
            mailbox,
            folder,
            uid_validity,
            path,
            query,
            entries: Vec::new(),
            tags: TagCache::default(),
            version: ChangeVersion(0),
            item_index: None,
            session: None,
        }
    }

    pub fn mailbox(&self) -> &MailboxId {
        &self.mailbox
    }

    pub fn folder(&self) -> FolderId {
        self.folder
    }

    pub fn uid_validity(&self) -> UidValidity {
        self.uid_validity
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_virtual(&self) -> bool {
        self.query.is_some()
    }

    pub fn version(&self) -> ChangeVersion {
        self.version
    }

    /// Record that the view is current as of `version`, as when it has just
    /// been read from the backing store.
    pub fn set_version(&mut self, version: ChangeVersion) {
        self.version = version;
    }

    /// The number of entries, including any marked expunged but not yet
    /// swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    /// Copies of every live entry, suitable for seeding another
    /// connection's view.
    pub fn fresh_entries(&self) -> Vec<MessageEntry> {
        self.entries
            .iter()
            .filter(|e| !e.is_expunged())
            .map(MessageEntry::fresh_copy)
            .collect()
    }

    /// Start a selection of this folder.
    ///
    /// Any prior session state is discarded.
    pub fn begin_select(&mut self, writable: bool, condstore: bool) {
        self.session = Some(SessionData {
            writable,
            condstore,
            last_size: self.entries.len(),
            ..SessionData::default()
        });

        // Counters are derived from the entries as they are now
        let recent = self.entries.iter().filter(|e| e.is_recent()).count();
        let expunged =
            self.entries.iter().filter(|e| e.is_expunged()).count();
        if let Some(ref mut session) = self.session {
            session.recent_count = recent;
            session.expunged_count = expunged;
        }
    }

    /// End the selection, returning the session state that was dropped.
    pub fn end_select(&mut self) -> Option<SessionData> {
        self.session.take()
    }

    pub fn is_selected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.writable)
    }

    pub fn condstore_enabled(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.condstore)
    }

    pub fn recent_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.recent_count)
    }

    pub fn expunged_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.expunged_count)
    }

    /// Whether any entry is marked expunged but not yet swept.
    pub fn has_expunges(&self) -> bool {
        self.expunged_count() > 0
            || self.entries.iter().any(MessageEntry::is_expunged)
    }

    /// Record the current size as reported to the client.
    ///
    /// Returns whether the size changed since the last checkpoint, i.e.,
    /// whether an `EXISTS` response is due.
    pub fn checkpoint_size(&mut self) -> bool {
        let size = self.entries.len();
        match self.session {
            Some(ref mut session) => {
                let changed = session.last_size != size;
                session.last_size = size;
                changed
            }
            None => false,
        }
    }

    /// Whether new tags have been discovered since the last call.
    pub fn take_tags_dirty(&mut self) -> bool {
        self.session
            .as_mut()
            .map_or(false, |s| std::mem::replace(&mut s.tags_dirty, false))
    }

    pub fn saved_search(&self) -> Option<&BTreeSet<Uid>> {
        self.session.as_ref().and_then(|s| s.saved_search.as_ref())
    }

    /// Save the result of a search for later reference via `$`.
    ///
    /// UIDs not currently in the view are dropped.
    pub fn save_search(&mut self, uids: impl IntoIterator<Item = Uid>) {
        let uids: BTreeSet<Uid> = uids
            .into_iter()
            .filter(|&uid| self.lookup_by_uid(uid).is_some())
            .collect();
        if let Some(ref mut session) = self.session {
            session.saved_search = Some(uids);
        }
    }

    /// Clone the session state, for keeping alongside a serialised copy of
    /// this view.
    pub fn capture_session(&self) -> Option<SessionData> {
        self.session.clone()
    }

    /// Replace the session state wholesale, as when reloading a paged view.
    ///
    /// This also drops the item index since the entries it was built from may
    /// not be the ones now present.
    pub fn restore_session(&mut self, session: Option<SessionData>) {
        self.session = session;
        self.item_index = None;
    }

    /// Every entry whose session flags are not just the defaults, with those
    /// flags.
    pub fn session_flag_overrides(&self) -> Vec<(Uid, SessionFlags)> {
        self.entries
            .iter()
            .filter(|e| !(e.session_flags() - SessionFlags::IS_CONTACT).is_empty())
            .map(|e| (e.uid(), e.session_flags()))
            .collect()
    }

    /// Put every entry's session flags back to the defaults.
    pub fn reset_session_flags(&mut self) {
        for entry in &mut self.entries {
            *entry.session_flags_mut() &= SessionFlags::IS_CONTACT;
        }
    }

    /// Overwrite the session flags of the entry with the given UID, keeping
    /// the flags which describe the item itself.
    pub fn restore_session_flags(&mut self, uid: Uid, flags: SessionFlags) {
        if let Some(entry) = self.lookup_by_uid_mut(uid) {
            let sflags = entry.session_flags_mut();
            *sflags = (*sflags & SessionFlags::IS_CONTACT)
                | (flags - SessionFlags::IS_CONTACT);
        }
    }

    /// Apply one of the session-only flags which the client can change, such
    /// as `$Junk`. Returns whether anything changed.
    pub fn set_mutable_session_flags(
        &mut self,
        uid: Uid,
        flags: SessionFlags,
    ) -> Result<bool, Error> {
        let flags = flags & SessionFlags::MUTABLE;
        let entry = match self.lookup_by_uid_mut(uid) {
            Some(entry) if !entry.is_expunged() => entry,
            _ => return Err(Error::NxMessage),
        };

        let sflags = entry.session_flags_mut();
        let new = (*sflags - SessionFlags::MUTABLE) | flags;
        let changed = new != *sflags;
        *sflags = new;

        if changed {
            self.mark_dirty(uid, ChangeVersion::default());
        }
        Ok(changed)
    }
}
