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

use std::collections::BTreeMap;

use super::cache::{CacheKey, CacheTier};
use super::folder::{FolderView, SessionData};
use super::model::*;
use super::store::ChangeBatch;

/// A change batch received while paged out.
#[derive(Clone, Debug)]
pub struct QueuedBatch {
    pub batch: ChangeBatch,
    /// Whether new entries in the batch are `\Recent` for this session.
    pub recent: bool,
}

/// What remains of a session's folder view after it has been written to the
/// cache.
///
/// The snapshot itself may be shared with other sessions, so everything
/// belonging to this session alone is held here: the session data, the
/// session flags on each entry, and the changes that arrived since.
#[derive(Clone, Debug)]
pub struct PagedFolder {
    key: CacheKey,
    original_size: usize,
    session: Option<SessionData>,
    session_flags: Vec<(Uid, SessionFlags)>,
    queued: BTreeMap<ChangeVersion, QueuedBatch>,
}

impl PagedFolder {
    pub fn capture(key: CacheKey, view: &FolderView) -> Self {
        PagedFolder {
            key,
            original_size: view.len(),
            session: view.capture_session(),
            session_flags: view.session_flag_overrides(),
            queued: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn tier(&self) -> CacheTier {
        self.key.tier
    }

    /// The number of entries in the view when it was paged out.
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    pub fn is_selected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.session.as_ref().map_or(false, SessionData::is_writable)
    }

    /// Queue `batch` for replay. Batches are replayed in version order
    /// regardless of arrival order; a batch with the same version as one
    /// already queued is merged into it.
    pub fn enqueue(&mut self, batch: &ChangeBatch, recent: bool) {
        match self.queued.get_mut(&batch.version) {
            Some(queued) => {
                queued.batch.absorb(batch.clone());
                queued.recent |= recent;
            }
            None => {
                self.queued.insert(
                    batch.version,
                    QueuedBatch {
                        batch: batch.clone(),
                        recent,
                    },
                );
            }
        }
    }

    /// The total number of queued events.
    pub fn queued_len(&self) -> usize {
        self.queued.values().map(|q| q.batch.len()).sum()
    }

    /// The queued batches in replay order.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedBatch> + '_ {
        self.queued.values()
    }

    /// Put this session's own state back into `view`, freshly read from the
    /// snapshot.
    pub fn restore_into(&self, view: &mut FolderView) {
        view.reset_session_flags();
        for &(uid, flags) in &self.session_flags {
            view.restore_session_flags(uid, flags);
        }
        view.restore_session(self.session.clone());
    }
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;
    use super::*;

    fn paged(view: &FolderView) -> PagedFolder {
        PagedFolder::capture(
            CacheKey::for_view(
                CacheTier::Active,
                view,
                ChangeVersion(1),
                SessionId(1),
            ),
            view,
        )
    }

    #[test]
    fn queue_orders_and_merges_by_version() {
        let mut p = paged(&view_with_uids(&[1]));
        let mut b5 = ChangeBatch::new(ChangeVersion(5));
        b5.deleted.push(Deleted::Item(ItemKind::Message, ItemId(1)));
        let mut b3 = ChangeBatch::new(ChangeVersion(3));
        b3.deleted.push(Deleted::Item(ItemKind::Message, ItemId(2)));

        p.enqueue(&b5, false);
        p.enqueue(&b3, false);
        p.enqueue(&b5, true);
        assert_eq!(3, p.queued_len());
        let order: Vec<(ChangeVersion, usize, bool)> = p
            .queued()
            .map(|q| (q.batch.version, q.batch.len(), q.recent))
            .collect();
        assert_eq!(
            vec![(ChangeVersion(3), 1, false), (ChangeVersion(5), 2, true)],
            order
        );
    }

    #[test]
    fn restores_own_session_flags() {
        let store = TestStore::new();
        let mut view = view_with_uids(&[1, 2]);
        view.begin_select(true, false);
        view.append(message(3, 3), true, &store);
        view.set_mutable_session_flags(Uid::u(1), SessionFlags::SPAM)
            .unwrap();
        let p = paged(&view);
        assert!(p.is_selected());
        assert!(p.is_writable());
        assert_eq!(3, p.original_size());

        // A snapshot written by some other session
        let mut other = view.clone();
        other.reset_session_flags();
        other
            .set_mutable_session_flags(Uid::u(2), SessionFlags::NONSPAM)
            .unwrap();
        other.end_select();

        p.restore_into(&mut other);
        assert_eq!(view.entries(), other.entries());
        assert_eq!(view.capture_session(), other.capture_session());
        assert_eq!(1, other.recent_count());
    }
}
