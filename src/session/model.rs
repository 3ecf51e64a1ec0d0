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

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::num::NonZeroU32;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The backing store's identifier for an item.
///
/// For most items this equals the item's UID, which lets lookups by item id
/// use the same binary search as lookups by UID.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct ItemId(pub u32);

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

/// Uniquely identifies a message within a single folder.
///
/// UIDs are assigned by the backing store, strictly increasing within a
/// folder, and never change except through an explicit renumbering (which
/// looks to the client like the message vanishing and a new one appearing).
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn saturating_next(self) -> Self {
        Uid::of(self.0.get().saturating_add(1)).unwrap_or(Uid::MAX)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// A message's 1-based position in a connection's current view of a folder.
///
/// This is derived from the index of the entry in the folder view and shifts
/// whenever an earlier entry is swept away.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqnum(pub NonZeroU32);

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Panics if `ix` does not fit in a sequence number; folder views never
    /// hold more than `u32::MAX` entries.
    pub fn from_index(ix: usize) -> Self {
        let raw: u32 = (ix + 1).try_into().unwrap();
        Seqnum::of(raw).unwrap()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

/// The backing store's change number.
///
/// Every change to the mailbox is assigned a strictly greater version than
/// the one before it. Change notifications are grouped by version.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct ChangeVersion(pub u64);

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct FolderId(pub u32);

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MailboxId(pub String);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[serde(transparent)]
pub struct UidValidity(pub u32);

/// Identifies one session within a `SessionManager`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// A bit position in a `TagSet`.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct TagId(u8);

impl TagId {
    pub const COUNT: usize = 64;

    pub fn of(bit: u8) -> Option<Self> {
        if (bit as usize) < TagId::COUNT {
            Some(TagId(bit))
        } else {
            None
        }
    }

    pub fn bit(self) -> u8 {
        self.0
    }
}

/// The set of user-defined tags applied to an item.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(transparent)]
pub struct TagSet(pub u64);

impl TagSet {
    pub const EMPTY: Self = TagSet(0);

    pub fn contains(self, tag: TagId) -> bool {
        0 != self.0 & (1 << tag.0)
    }

    pub fn insert(&mut self, tag: TagId) {
        self.0 |= 1 << tag.0;
    }

    pub fn remove(&mut self, tag: TagId) {
        self.0 &= !(1 << tag.0);
    }

    pub fn is_empty(self) -> bool {
        0 == self.0
    }

    pub fn iter(self) -> impl Iterator<Item = TagId> {
        (0..TagId::COUNT as u8)
            .map(TagId)
            .filter(move |&t| self.contains(t))
    }
}

bitflags! {
    /// Flags stored by the backing store, surfaced over IMAP either directly
    /// or (for `UNREAD`) inverted as `\Seen`.
    #[derive(Deserialize, Serialize, Default)]
    pub struct PersistentFlags: u32 {
        const UNREAD = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const DRAFT = 1 << 3;
        const REPLIED = 1 << 4;
        const FORWARDED = 1 << 5;
        const NOTIFIED = 1 << 6;
    }
}

bitflags! {
    /// Per-connection state of an entry which the backing store knows nothing
    /// about.
    #[derive(Deserialize, Serialize, Default)]
    pub struct SessionFlags: u16 {
        const RECENT = 0x0001;
        const SPAM = 0x0002;
        const NONSPAM = 0x0004;
        const JUNK_RECORDED = 0x0008;
        const IS_CONTACT = 0x0010;
        /// The entry has not yet been announced to the client.
        const ADDED = 0x0100;
        /// The entry is gone from the backing store but the client has not
        /// yet been told.
        const EXPUNGED = 0x0200;

        const MUTABLE = Self::SPAM.bits | Self::NONSPAM.bits
            | Self::JUNK_RECORDED.bits;
    }
}

bitflags! {
    /// Options given when a connection opens a folder.
    pub struct SelectParams: u8 {
        const READ_ONLY = 0x01;
        const CONDSTORE = 0x02;
    }
}

/// The type of an item in the backing store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Message,
    Chat,
    Contact,
    Tag,
    Folder,
    Other,
}

impl ItemKind {
    /// Whether items of this kind can appear as entries in a folder view.
    pub fn is_listable(self) -> bool {
        matches!(self, ItemKind::Message | ItemKind::Chat | ItemKind::Contact)
    }
}

/// An item as reported by the backing store, before it is given a place in
/// a folder view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntry {
    pub item: ItemId,
    pub kind: ItemKind,
    /// `None` if the backing store has not assigned a UID yet.
    pub uid: Option<Uid>,
    pub flags: PersistentFlags,
    pub tags: TagSet,
}

/// One item's view within a folder view.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageEntry {
    item: ItemId,
    uid: Uid,
    kind: ItemKind,
    flags: PersistentFlags,
    tags: TagSet,
    session_flags: SessionFlags,
}

impl MessageEntry {
    pub fn new(
        item: ItemId,
        uid: Uid,
        kind: ItemKind,
        flags: PersistentFlags,
        tags: TagSet,
    ) -> Self {
        let session_flags = if ItemKind::Contact == kind {
            SessionFlags::IS_CONTACT
        } else {
            SessionFlags::empty()
        };

        Self {
            item,
            uid,
            kind,
            flags,
            tags,
            session_flags,
        }
    }

    /// Build an entry from a backing store item which has a UID.
    pub fn from_store(entry: &StoreEntry, uid: Uid) -> Self {
        Self::new(entry.item, uid, entry.kind, entry.flags, entry.tags)
    }

    /// Copy this entry for use by a different connection.
    ///
    /// Only the session flags describing the item itself survive.
    pub fn fresh_copy(&self) -> Self {
        Self {
            session_flags: self.session_flags & SessionFlags::IS_CONTACT,
            ..self.clone()
        }
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn flags(&self) -> PersistentFlags {
        self.flags
    }

    pub fn tags(&self) -> TagSet {
        self.tags
    }

    pub fn session_flags(&self) -> SessionFlags {
        self.session_flags
    }

    pub fn is_expunged(&self) -> bool {
        self.session_flags.contains(SessionFlags::EXPUNGED)
    }

    pub fn is_added(&self) -> bool {
        self.session_flags.contains(SessionFlags::ADDED)
    }

    pub fn is_recent(&self) -> bool {
        self.session_flags.contains(SessionFlags::RECENT)
    }

    pub(crate) fn set_persistent(
        &mut self,
        flags: PersistentFlags,
        tags: TagSet,
    ) -> bool {
        if self.flags == flags && self.tags == tags {
            return false;
        }

        self.flags = flags;
        self.tags = tags;
        true
    }

    pub(crate) fn tags_mut(&mut self) -> &mut TagSet {
        &mut self.tags
    }

    pub(crate) fn session_flags_mut(&mut self) -> &mut SessionFlags {
        &mut self.session_flags
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_set_operations() {
        let mut tags = TagSet::EMPTY;
        assert!(tags.is_empty());

        tags.insert(TagId::of(0).unwrap());
        tags.insert(TagId::of(63).unwrap());
        assert!(tags.contains(TagId::of(63).unwrap()));
        assert!(!tags.contains(TagId::of(1).unwrap()));
        assert_eq!(
            vec![0, 63],
            tags.iter().map(TagId::bit).collect::<Vec<_>>()
        );

        tags.remove(TagId::of(0).unwrap());
        assert_eq!(TagSet(1 << 63), tags);
        assert_eq!(None, TagId::of(64));
    }

    #[test]
    fn fresh_copy_keeps_only_item_properties() {
        let mut contact = MessageEntry::new(
            ItemId(5),
            Uid::u(5),
            ItemKind::Contact,
            PersistentFlags::FLAGGED,
            TagSet::EMPTY,
        );
        contact
            .session_flags_mut()
            .insert(SessionFlags::RECENT | SessionFlags::ADDED);

        let copy = contact.fresh_copy();
        assert_eq!(SessionFlags::IS_CONTACT, copy.session_flags());
        assert_eq!(PersistentFlags::FLAGGED, copy.flags());
        assert_eq!(Uid::u(5), copy.uid());
    }

    #[test]
    fn seqnum_index_conversion() {
        assert_eq!(0, Seqnum::u(1).to_index());
        assert_eq!(Seqnum::u(10), Seqnum::from_index(9));
    }
}
