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

//! Mapping between IMAP flag names and what backs them.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use super::super::model::*;
use super::super::store::{MailStore, TagInfo};
use super::FolderView;

/// What a flag name refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagKind {
    /// A persistent flag. If `positive` is false, the IMAP flag is set when
    /// the bits are *clear* (as with `\Seen` and `UNREAD`).
    System {
        bits: PersistentFlags,
        positive: bool,
    },
    /// A flag which lives only in the session.
    Session(SessionFlags),
    /// A user-defined tag.
    Tag(TagId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagDef {
    pub name: String,
    pub kind: FlagKind,
    /// Whether changes to the flag outlive the session.
    pub permanent: bool,
    /// For tags, the version at which the tag was last created or renamed.
    pub version: ChangeVersion,
}

impl FlagDef {
    /// Whether `entry` has this flag set.
    pub fn matches(&self, entry: &MessageEntry) -> bool {
        match self.kind {
            FlagKind::System { bits, positive } => {
                entry.flags().contains(bits) == positive
            }
            FlagKind::Session(flags) => entry.session_flags().contains(flags),
            FlagKind::Tag(tag) => entry.tags().contains(tag),
        }
    }
}

static SYSTEM_FLAGS: &[(&str, PersistentFlags, bool)] = &[
    ("\\Answered", PersistentFlags::REPLIED, true),
    ("\\Deleted", PersistentFlags::DELETED, true),
    ("\\Draft", PersistentFlags::DRAFT, true),
    ("\\Flagged", PersistentFlags::FLAGGED, true),
    ("\\Seen", PersistentFlags::UNREAD, false),
    ("$Forwarded", PersistentFlags::FORWARDED, true),
    ("$MDNSent", PersistentFlags::NOTIFIED, true),
];

static SESSION_FLAGS: &[(&str, SessionFlags)] = &[
    ("$Junk", SessionFlags::SPAM),
    ("$NotJunk", SessionFlags::NONSPAM),
    ("$JunkRecorded", SessionFlags::JUNK_RECORDED),
];

/// The names of the tags seen so far, keyed by bit position.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TagCache {
    tags: BTreeMap<u8, (String, ChangeVersion)>,
}

impl TagCache {
    pub fn get(&self, tag: TagId) -> Option<&str> {
        self.tags.get(&tag.bit()).map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, tag: TagId) -> bool {
        self.tags.contains_key(&tag.bit())
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn insert(&mut self, info: &TagInfo) {
        self.tags
            .insert(info.id.bit(), (info.name.clone(), info.version));
    }

    fn remove(&mut self, tag: TagId) -> bool {
        self.tags.remove(&tag.bit()).is_some()
    }

    fn defs(&self) -> impl Iterator<Item = FlagDef> + '_ {
        self.tags.iter().filter_map(|(&bit, (name, version))| {
            TagId::of(bit).map(|tag| FlagDef {
                name: name.clone(),
                kind: FlagKind::Tag(tag),
                permanent: true,
                version: *version,
            })
        })
    }
}

impl FolderView {
    /// Look a flag up by its IMAP name, case-insensitively.
    pub fn flag_by_name(&self, name: &str) -> Option<FlagDef> {
        self.all_flags()
            .find(|def| def.name.eq_ignore_ascii_case(name))
    }

    /// The names for the `FLAGS` response, or for `PERMANENTFLAGS` if
    /// `permanent_only`.
    pub fn list_names(&self, permanent_only: bool) -> Vec<String> {
        self.all_flags()
            .filter(|def| def.permanent || !permanent_only)
            .map(|def| def.name)
            .collect()
    }

    fn all_flags(&self) -> impl Iterator<Item = FlagDef> + '_ {
        SYSTEM_FLAGS
            .iter()
            .map(|&(name, bits, positive)| FlagDef {
                name: name.to_owned(),
                kind: FlagKind::System { bits, positive },
                permanent: true,
                version: ChangeVersion::default(),
            })
            .chain(SESSION_FLAGS.iter().map(|&(name, flags)| FlagDef {
                name: name.to_owned(),
                kind: FlagKind::Session(flags),
                permanent: false,
                version: ChangeVersion::default(),
            }))
            .chain(self.tags.defs())
    }

    pub fn tag_cache(&self) -> &TagCache {
        &self.tags
    }

    /// Make sure every tag in `tags` is in the tag cache, looking unknown
    /// ones up in `store`.
    ///
    /// Returns whether any new tag was found, in which case the client is
    /// also due a new `FLAGS` response.
    pub fn refresh_tags(&mut self, tags: TagSet, store: &dyn MailStore) -> bool {
        let unknown: Vec<TagId> =
            tags.iter().filter(|&t| !self.tags.contains(t)).collect();

        let mut found = false;
        for tag in unknown {
            match store.tag(&self.mailbox, tag) {
                Ok(Some(info)) => {
                    self.tags.insert(&info);
                    found = true;
                }
                Ok(None) => warn!(
                    "{}/{:?}: entry refers to unknown tag {}",
                    self.mailbox,
                    self.folder,
                    tag.bit()
                ),
                Err(e) => warn!(
                    "{}/{:?}: failed to look up tag {}: {}",
                    self.mailbox,
                    self.folder,
                    tag.bit(),
                    e
                ),
            }
        }

        if found {
            if let Some(ref mut session) = self.session {
                session.tags_dirty = true;
            }
        }
        found
    }

    /// Handle a tag being deleted from the backing store.
    ///
    /// The tag is cleared from every entry and those entries become dirty.
    pub fn tag_deleted(&mut self, tag: TagId, version: ChangeVersion) {
        let known = self.tags.remove(tag);

        let mut affected = Vec::new();
        for entry in &mut self.entries {
            if entry.tags().contains(tag) {
                entry.tags_mut().remove(tag);
                affected.push(entry.uid());
            }
        }

        for uid in affected {
            self.mark_dirty(uid, version);
        }

        if known {
            if let Some(ref mut session) = self.session {
                session.tags_dirty = true;
            }
        }
    }

    /// Handle a tag being renamed. Entries carrying the tag are dirtied so
    /// the client sees the new name.
    pub fn tag_renamed(&mut self, info: &TagInfo, version: ChangeVersion) {
        self.tags.insert(info);

        let affected: Vec<Uid> = self
            .entries
            .iter()
            .filter(|e| e.tags().contains(info.id))
            .map(MessageEntry::uid)
            .collect();
        for uid in affected {
            self.mark_dirty(uid, version);
        }

        if let Some(ref mut session) = self.session {
            session.tags_dirty = true;
        }
    }

    /// UIDs of every live entry which has `flag` set.
    pub fn with_flag(&self, flag: &FlagDef) -> Vec<Uid> {
        self.entries
            .iter()
            .filter(|e| !e.is_expunged() && flag.matches(e))
            .map(MessageEntry::uid)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::super::super::test_prelude::*;
    use super::*;

    fn tag(bit: u8) -> TagId {
        TagId::of(bit).unwrap()
    }

    fn tags(bits: &[u8]) -> TagSet {
        let mut set = TagSet::EMPTY;
        for &bit in bits {
            set.insert(tag(bit));
        }
        set
    }

    #[test]
    fn system_flags_by_name() {
        let view = view_with_uids(&[]);
        let seen = view.flag_by_name("\\SEEN").unwrap();
        assert_eq!(
            FlagKind::System {
                bits: PersistentFlags::UNREAD,
                positive: false
            },
            seen.kind
        );

        let mut read = message(1, 1);
        assert!(seen.matches(&read));
        read.set_persistent(PersistentFlags::UNREAD, TagSet::EMPTY);
        assert!(!seen.matches(&read));

        assert!(!view.flag_by_name("$junk").unwrap().permanent);
        assert!(view.flag_by_name("\\Recent").is_none());

        let names = view.list_names(true);
        assert!(names.contains(&"\\Flagged".to_owned()));
        assert!(!names.contains(&"$Junk".to_owned()));
        assert!(view.list_names(false).contains(&"$Junk".to_owned()));
    }

    #[test]
    fn unknown_tags_fetched_from_store() {
        let store = TestStore::new();
        store.define_tag(3, "Important");
        let mut view = view_with_uids(&[1]);
        view.begin_select(true, false);

        let mut entry = message(2, 2);
        entry.set_persistent(PersistentFlags::empty(), tags(&[3, 4]));
        view.append(entry, false, &store);

        assert_eq!(Some("Important"), view.tag_cache().get(tag(3)));
        // Tag 4 does not exist in the store
        assert_eq!(1, view.tag_cache().len());
        assert!(view.take_tags_dirty());
        assert!(!view.take_tags_dirty());

        let def = view.flag_by_name("important").unwrap();
        assert_eq!(vec![Uid::u(2)], view.with_flag(&def));
        assert!(!view.refresh_tags(tags(&[3]), &store));
    }

    #[test]
    fn tag_removal_and_rename_dirty_entries() {
        let store = TestStore::new();
        store.define_tag(1, "Work");
        let mut view = view_with_uids(&[1, 2]);
        view.begin_select(true, false);
        let mut entry = message(3, 3);
        entry.set_persistent(PersistentFlags::empty(), tags(&[1]));
        view.append(entry, false, &store);
        view.take_tags_dirty();

        view.tag_renamed(
            &TagInfo {
                id: tag(1),
                name: "Job".to_owned(),
                version: ChangeVersion(4),
            },
            ChangeVersion(4),
        );
        assert!(view.flag_by_name("Work").is_none());
        assert!(view.flag_by_name("Job").is_some());
        assert_eq!(vec![Uid::u(3)], dirty_uids(&mut view));
        assert!(view.take_tags_dirty());

        view.tag_deleted(tag(1), ChangeVersion(5));
        assert!(view.flag_by_name("Job").is_none());
        assert!(view.lookup_by_uid(Uid::u(3)).unwrap().tags().is_empty());
        assert_eq!(vec![Uid::u(3)], dirty_uids(&mut view));
    }
}
