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

//! Sequence sets, expunge tracking, and resynchronisation support.

use super::super::model::*;
use super::super::range::{RangeList, MAX_ID};
use super::FolderView;
use crate::support::error::Error;

impl FolderView {
    /// Resolve a sequence set against the view.
    ///
    /// `text` is either `$` (the saved search result) or a sequence set as
    /// understood by `RangeList::parse()`. If `by_uid`, the set refers to
    /// UIDs, and UIDs not present are silently skipped. Otherwise it refers
    /// to sequence numbers, and any number outside `1..=len` is an error
    /// unless `allow_out_of_range` is set, in which case such numbers are
    /// ignored.
    ///
    /// The result is in ascending order with no duplicates. Entries marked
    /// expunged but not yet swept are included, since they still occupy
    /// sequence numbers.
    pub fn resolve_subsequence(
        &self,
        text: &str,
        by_uid: bool,
        allow_out_of_range: bool,
    ) -> Result<Vec<(Seqnum, &MessageEntry)>, Error> {
        let text = text.trim();
        if "$" == text {
            return Ok(self
                .saved_search()
                .into_iter()
                .flatten()
                .filter_map(|&uid| {
                    self.index_of_uid(uid)
                        .map(|ix| (Seqnum::from_index(ix), &self.entries[ix]))
                })
                .collect());
        }

        let star = if by_uid {
            self.max_uid().map_or(MAX_ID, Uid::get)
        } else {
            self.entries.len() as u32
        };

        let mut result = Vec::new();
        for &(low, high) in RangeList::parse(text, star).ranges() {
            if by_uid {
                let start = self.entries.partition_point(|e| e.uid().get() < low);
                result.extend(
                    self.entries[start..]
                        .iter()
                        .take_while(|e| e.uid().get() <= high)
                        .enumerate()
                        .map(|(off, e)| (Seqnum::from_index(start + off), e)),
                );
            } else {
                let len = self.entries.len() as u32;
                if low < 1 || high > len {
                    if !allow_out_of_range {
                        return Err(Error::BadSequence(text.to_owned()));
                    }
                }

                let low = low.max(1);
                let high = high.min(len);
                if low > high {
                    continue;
                }

                let start = low as usize - 1;
                result.extend(
                    self.entries[start..high as usize]
                        .iter()
                        .enumerate()
                        .map(|(off, e)| (Seqnum::from_index(start + off), e)),
                );
            }
        }

        Ok(result)
    }

    /// Mark the entry with the given UID as removed from the backing store.
    ///
    /// The entry keeps its sequence number until the next
    /// `sweep_expunged()`. Returns whether anything changed; marking an
    /// already-expunged or unknown entry is a no-op.
    pub fn mark_expunged(&mut self, uid: Uid) -> bool {
        let entry = match self.lookup_by_uid_mut(uid) {
            Some(entry) if !entry.is_expunged() => entry,
            _ => return false,
        };

        entry.session_flags_mut().insert(SessionFlags::EXPUNGED);
        if let Some(ref mut session) = self.session {
            if let Some(ref mut saved) = session.saved_search {
                saved.remove(&uid);
            }
            session.expunged_count += 1;
        }
        true
    }

    /// Physically remove every entry marked expunged.
    ///
    /// Returns the removals the client needs to be told about, in the order
    /// `EXPUNGE` responses must be sent. Each sequence number accounts for
    /// the removals listed before it. Entries the client never learnt about
    /// (still `ADDED`) are removed silently.
    pub fn sweep_expunged(&mut self) -> Vec<(Seqnum, Uid)> {
        if !self.entries.iter().any(MessageEntry::is_expunged) {
            return Vec::new();
        }

        let mut reported = Vec::new();
        let mut removed = Vec::new();
        let mut position = 0usize;
        self.entries.retain(|entry| {
            if !entry.is_expunged() {
                position += 1;
                return true;
            }

            if !entry.is_added() {
                reported.push((Seqnum::from_index(position), entry.uid()));
            }
            removed.push(entry.clone());
            false
        });

        for entry in &removed {
            self.forget(entry);
        }

        reported
    }

    /// Compute the `VANISHED` set for a client which last knew about the
    /// UIDs in `known`: those which are no longer present.
    pub fn vanished(&self, known: &RangeList) -> RangeList {
        let max = self.max_uid().map_or(0, Uid::get);
        let known = known.crop(1, max);
        known.invert(self.live_uids().map(Uid::get))
    }

    /// Evaluate QRESYNC sequence match data.
    ///
    /// `known_seqnums` and `known_uids` are parallel lists of sequence
    /// numbers and the UIDs the client believes they map to. Returns the
    /// lowest UID from which removals need to be reported: one past the last
    /// pair, in order, for which the client is still correct.
    pub fn sequence_match_low_water(
        &self,
        known_seqnums: &str,
        known_uids: &str,
    ) -> Result<Uid, Error> {
        let mut low_water = Uid::MIN;
        if known_seqnums.trim().is_empty() || known_uids.trim().is_empty() {
            return Ok(low_water);
        }

        let seqnums = RangeList::parse(known_seqnums, self.entries.len() as u32);
        let uids = RangeList::parse(
            known_uids,
            self.max_uid().map_or(MAX_ID, Uid::get),
        );

        let mut uids = uids.items();
        for seqnum in seqnums.items() {
            let seqnum = Seqnum::of(seqnum)
                .ok_or_else(|| Error::BadSequence(known_seqnums.to_owned()))?;
            let uid = match uids.next().and_then(Uid::of) {
                Some(uid) => uid,
                None => break,
            };

            match self.lookup_by_seqnum(seqnum) {
                Some(entry) if entry.uid() == uid && !entry.is_expunged() => {
                    low_water = uid.saturating_next();
                }
                _ => break,
            }
        }

        Ok(low_water)
    }

    /// Every live entry for which `flag` is set.
    pub fn flagged(&self, flag: PersistentFlags) -> Vec<(Seqnum, &MessageEntry)> {
        self.seqnums_entries()
            .filter(|&(_, e)| !e.is_expunged() && e.flags().contains(flag))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::super::super::test_prelude::*;
    use super::*;

    fn resolved_uids(
        view: &FolderView,
        text: &str,
        by_uid: bool,
    ) -> Vec<u32> {
        view.resolve_subsequence(text, by_uid, false)
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.uid().get())
            .collect()
    }

    #[test]
    fn resolve_by_uid() {
        let view = view_with_uids(&[10, 11, 12, 15, 16, 20]);
        assert_eq!(vec![11, 12, 15], resolved_uids(&view, "11:15", true));
        assert_eq!(vec![20], resolved_uids(&view, "*", true));
        assert_eq!(vec![16, 20], resolved_uids(&view, "16:*", true));
        assert_eq!(vec![10, 20], resolved_uids(&view, "20,1:10", true));
        assert!(resolved_uids(&view, "21:30", true).is_empty());
        assert!(resolved_uids(&view, "", true).is_empty());

        let seqnums: Vec<Seqnum> = view
            .resolve_subsequence("12,16", true, false)
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(vec![Seqnum::u(3), Seqnum::u(5)], seqnums);
    }

    #[test]
    fn resolve_by_seqnum() {
        let view = view_with_uids(&[10, 11, 12, 15, 16, 20]);
        assert_eq!(vec![11, 12, 15], resolved_uids(&view, "2:4", false));
        assert_eq!(vec![20], resolved_uids(&view, "*", false));
        assert_eq!(vec![10, 20], resolved_uids(&view, "6,1", false));

        assert_matches!(
            Err(Error::BadSequence(_)),
            view.resolve_subsequence("5:7", false, false)
        );
        assert_matches!(
            Err(Error::BadSequence(_)),
            view.resolve_subsequence("0", false, false)
        );
        assert_eq!(
            2,
            view.resolve_subsequence("5:7", false, true).unwrap().len()
        );

        let empty = view_with_uids(&[]);
        assert_matches!(
            Err(Error::BadSequence(_)),
            empty.resolve_subsequence("*", false, false)
        );
        assert!(empty
            .resolve_subsequence("*", false, true)
            .unwrap()
            .is_empty());
        assert!(empty.resolve_subsequence("*", true, false).unwrap().is_empty());
    }

    #[test]
    fn resolve_saved_search() {
        let mut view = view_with_uids(&[10, 11, 12]);
        view.begin_select(true, false);
        assert!(view.resolve_subsequence("$", true, false).unwrap().is_empty());

        view.save_search(vec![Uid::u(12), Uid::u(10)]);
        view.mark_expunged(Uid::u(12));
        assert_eq!(vec![10], resolved_uids(&view, "$", false));
    }

    #[test]
    fn expunge_and_sweep() {
        let mut view = view_with_uids(&[1, 2, 3, 4, 5]);
        view.begin_select(true, false);

        assert!(view.mark_expunged(Uid::u(2)));
        assert!(!view.mark_expunged(Uid::u(2)));
        assert!(!view.mark_expunged(Uid::u(99)));
        assert!(view.mark_expunged(Uid::u(4)));
        assert_eq!(2, view.expunged_count());
        assert!(view.has_expunges());
        // Sequence numbers are stable until the sweep
        assert_eq!(Some(Seqnum::u(5)), view.seqnum_of(Uid::u(5)));

        let swept = view.sweep_expunged();
        assert_eq!(
            vec![(Seqnum::u(2), Uid::u(2)), (Seqnum::u(3), Uid::u(4))],
            swept
        );
        assert_eq!(0, view.expunged_count());
        assert!(!view.has_expunges());
        assert_eq!(Some(Seqnum::u(3)), view.seqnum_of(Uid::u(5)));
        assert!(view.sweep_expunged().is_empty());
    }

    #[test]
    fn sweep_hides_unannounced_removals() {
        let store = TestStore::new();
        let mut view = view_with_uids(&[1, 2]);
        view.begin_select(true, false);
        let mut added = message(3, 3);
        added.session_flags_mut().insert(SessionFlags::ADDED);
        view.append(added, false, &store);

        view.mark_expunged(Uid::u(1));
        view.mark_expunged(Uid::u(3));
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], view.sweep_expunged());
        assert_eq!(1, view.len());
    }

    #[test]
    fn vanished_against_known() {
        let mut view = view_with_uids(&[1, 2, 3, 5, 8]);
        view.begin_select(true, false);
        view.mark_expunged(Uid::u(3));

        let known = RangeList::parse("1:10", MAX_ID);
        assert_eq!("3:4,6:7", view.vanished(&known).to_string());
        assert_eq!("", view.vanished(&RangeList::new()).to_string());

        let empty = view_with_uids(&[]);
        assert!(empty.vanished(&known).is_empty());
    }

    #[test]
    fn flagged_entries() {
        let store = TestStore::new();
        let mut view = view_with_uids(&[]);
        for &(uid, flags) in &[
            (1, PersistentFlags::FLAGGED),
            (2, PersistentFlags::empty()),
            (3, PersistentFlags::FLAGGED | PersistentFlags::UNREAD),
            (4, PersistentFlags::FLAGGED),
            (5, PersistentFlags::UNREAD),
        ] {
            let mut entry = message(uid, uid);
            entry.set_persistent(flags, TagSet::EMPTY);
            view.append(entry, false, &store);
        }
        view.begin_select(true, false);
        view.mark_expunged(Uid::u(4));

        let flagged = |view: &FolderView, flag| {
            view.flagged(flag)
                .into_iter()
                .map(|(seqnum, e)| (seqnum.get(), e.uid().get()))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            vec![(1, 1), (3, 3)],
            flagged(&view, PersistentFlags::FLAGGED)
        );
        assert_eq!(
            vec![(3, 3), (5, 5)],
            flagged(&view, PersistentFlags::UNREAD)
        );
        assert!(flagged(&view, PersistentFlags::DRAFT).is_empty());

        view.sweep_expunged();
        assert_eq!(
            vec![(3, 3), (4, 5)],
            flagged(&view, PersistentFlags::UNREAD)
        );
    }

    #[test]
    fn sequence_match_data() {
        let view = view_with_uids(&[1, 2, 4, 6, 7]);
        // Client is right about 1 and 2 but thinks seqnum 3 is UID 3
        assert_eq!(
            Uid::u(3),
            view.sequence_match_low_water("1:3", "1:3").unwrap()
        );
        assert_eq!(
            Uid::u(8),
            view.sequence_match_low_water("1,3,5", "1,4,7").unwrap()
        );
        assert_eq!(Uid::MIN, view.sequence_match_low_water("", "1").unwrap());
        assert_matches!(
            Err(Error::BadSequence(_)),
            view.sequence_match_low_water("0", "1")
        );
    }

    proptest! {
        #[test]
        fn sweep_keeps_positions_contiguous(
            uids in prop::collection::btree_set(1u32..500, 3..40),
            remove in prop::collection::vec(any::<bool>(), 40)
        ) {
            let uids: Vec<u32> = uids.into_iter().collect();
            let mut view = view_with_uids(&uids);
            view.begin_select(true, false);

            // Only expunge strictly interior entries
            let mut expected = vec![uids[0]];
            for (ix, &uid) in uids[1..uids.len() - 1].iter().enumerate() {
                if remove[ix] {
                    view.mark_expunged(Uid::u(uid));
                } else {
                    expected.push(uid);
                }
            }
            expected.push(uids[uids.len() - 1]);

            view.sweep_expunged();
            prop_assert_eq!(expected.len(), view.len());
            for (ix, &uid) in expected.iter().enumerate() {
                let seqnum = Seqnum::from_index(ix);
                prop_assert_eq!(
                    uid,
                    view.lookup_by_seqnum(seqnum).unwrap().uid().get());
                prop_assert_eq!(Some(seqnum), view.seqnum_of(Uid::u(uid)));
            }
        }
    }
}
