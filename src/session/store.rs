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

//! The boundary with the backing mail store.

use bitflags::bitflags;

use super::model::*;
use crate::support::error::Error;

/// Static information about a folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderInfo {
    pub path: String,
    /// The UID the next item added to the folder will receive.
    pub uid_next: Uid,
    /// Items whose UID is strictly greater than this have not been seen by
    /// any writable session yet and so are `\Recent`.
    pub recent_cutoff: u32,
    /// For virtual (search-backed) folders, the query defining membership.
    pub query: Option<String>,
    pub selectable: bool,
}

impl FolderInfo {
    pub fn is_virtual(&self) -> bool {
        self.query.is_some()
    }
}

/// A user-defined tag as known to the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagInfo {
    pub id: TagId,
    pub name: String,
    pub version: ChangeVersion,
}

/// The operations the session layer needs from the backing mail store.
///
/// Implementations must be safe to call while the caller holds the mailbox
/// lock, and must not call back into the session layer.
pub trait MailStore: Send + Sync {
    /// Return information about `folder`, or `Error::NxFolder`.
    fn folder_info(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
    ) -> Result<FolderInfo, Error>;

    /// List the items in `folder`, in no particular order.
    ///
    /// For virtual folders, this runs the folder's query.
    fn list_folder_entries(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
    ) -> Result<Vec<StoreEntry>, Error>;

    /// Assign fresh UIDs to `items`, in order.
    ///
    /// The returned UIDs must be strictly increasing and greater than any UID
    /// previously assigned in `folder`, even across concurrent callers.
    fn assign_uids(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
        items: &[ItemId],
    ) -> Result<Vec<Uid>, Error>;

    fn current_change_version(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
    ) -> Result<ChangeVersion, Error>;

    fn current_uid_validity(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
    ) -> Result<UidValidity, Error>;

    /// Look up the tag at bit position `tag`.
    fn tag(
        &self,
        mailbox: &MailboxId,
        tag: TagId,
    ) -> Result<Option<TagInfo>, Error>;

    /// Record that a writable session has now seen everything up to and
    /// including `uid`, so those items are no longer `\Recent`.
    fn record_recent_cutoff(
        &self,
        mailbox: &MailboxId,
        folder: FolderId,
        uid: Uid,
    ) -> Result<(), Error>;
}

/// Something removed from the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deleted {
    Item(ItemKind, ItemId),
    Tag(TagId),
    Folder(FolderId),
}

/// An item created in the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Created {
    pub folder: FolderId,
    pub entry: StoreEntry,
}

bitflags! {
    /// What about an item changed.
    pub struct ItemChanges: u8 {
        /// The item moved to a different folder.
        const FOLDER = 0x01;
        /// The item was given a new UID.
        const UID = 0x02;
        const FLAGS = 0x04;
        const TAGS = 0x08;
        const UNREAD = 0x10;
    }
}

/// Something modified in the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modified {
    /// A tag was renamed.
    Tag(TagInfo),
    Folder {
        folder: FolderId,
        path: String,
        selectable: bool,
    },
    Item {
        folder: FolderId,
        entry: StoreEntry,
        changes: ItemChanges,
    },
}

/// All changes made to a mailbox under one change version.
///
/// Within a batch, deletions are applied first, then creations, then
/// modifications, and finally newly seen items are numbered and added.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub version: ChangeVersion,
    pub deleted: Vec<Deleted>,
    pub created: Vec<Created>,
    pub modified: Vec<Modified>,
}

impl ChangeBatch {
    pub fn new(version: ChangeVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// The number of individual events in the batch.
    pub fn len(&self) -> usize {
        self.deleted.len() + self.created.len() + self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    /// Fold another batch with the same version into this one.
    pub fn absorb(&mut self, other: ChangeBatch) {
        debug_assert_eq!(self.version, other.version);
        self.deleted.extend(other.deleted);
        self.created.extend(other.created);
        self.modified.extend(other.modified);
    }
}
