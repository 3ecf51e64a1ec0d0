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

//! Periodic eviction of sessions from memory.
//!
//! Each pass walks the sessions from most to least recently used, adding up
//! the entries held in memory. Loaded sessions that have been idle too long,
//! or which would take the total over the footprint limit, are paged out to
//! the active cache tier. Paged sessions which have accumulated too many
//! queued changes are loaded, caught up, and paged out again so the queue
//! does not grow without bound. Sessions without a connection beyond the
//! allowed number are dropped entirely.

use std::sync::{Arc, Weak};

use log::{info, warn};

use super::cache::CacheTier;
use super::lifecycle::{Reload, Session};
use super::manager::SessionManager;
use crate::support::error::Error;
use crate::support::threading::PeriodicTask;

/// What an eviction pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub paged: usize,
    pub reserialized: usize,
    pub dropped: usize,
    pub failed: usize,
}

enum Action {
    Keep,
    Page,
    Reserialize,
    Drop,
}

impl SessionManager {
    /// Run one eviction pass over every registered session.
    pub fn run_eviction_pass(&self) -> EvictionReport {
        let mut sessions = self.sessions();
        // Most recently used first
        sessions.sort_by(|a, b| b.last_access().cmp(&a.last_access()));

        let threshold = self.config.reserialization_threshold;
        let limit = self.config.footprint_limit;
        let inactive_after = self.config.inactive_after();

        // Reserialising requires loading the largest such session, so room
        // is reserved for it up front.
        let mut footprint = sessions
            .iter()
            .filter(|s| overflows(s, threshold))
            .map(|s| s.paged_size())
            .max()
            .unwrap_or(0)
            .min(limit);

        let mut noninteractive = 0;
        let mut report = EvictionReport::default();
        for session in sessions {
            if session.is_closed() {
                self.detach(session.id());
                continue;
            }

            let interactive = session.is_interactive();
            if !interactive {
                noninteractive += 1;
            }

            let action = if !interactive
                && noninteractive > self.config.max_noninteractive
            {
                Action::Drop
            } else if overflows(&session, threshold) {
                Action::Reserialize
            } else if session.is_loaded() {
                let size = session.estimated_size();
                if session.idle_for() > inactive_after
                    || footprint + size > limit
                {
                    Action::Page
                } else {
                    footprint += size;
                    Action::Keep
                }
            } else {
                Action::Keep
            };

            match self.evict(&session, action) {
                Ok(Action::Keep) => (),
                Ok(Action::Page) => report.paged += 1,
                Ok(Action::Reserialize) => report.reserialized += 1,
                Ok(Action::Drop) => report.dropped += 1,
                Err(e) => {
                    warn!("{} Eviction failed: {}", session.log_prefix(), e);
                    let guard = session.mailbox().lock();
                    self.discard(&guard, &session);
                    report.failed += 1;
                }
            }
        }

        if report != EvictionReport::default() {
            info!("Eviction pass: {:?}", report);
        }
        report
    }

    fn evict(&self, session: &Session, action: Action) -> Result<Action, Error> {
        match action {
            Action::Keep => (),
            Action::Page => session.unload(CacheTier::Active)?,
            Action::Reserialize => {
                let guard = session.mailbox().lock();
                if Reload::Unavailable == session.reload_locked(&guard)? {
                    return Err(Error::NxSnapshot);
                }
                session.unload_locked(&guard, CacheTier::Active)?;
            }
            Action::Drop => {
                let guard = session.mailbox().lock();
                self.discard(&guard, session);
            }
        }

        Ok(action)
    }

    /// Start running eviction passes in the background, at the interval
    /// given by the configuration. Does nothing if that interval is zero or
    /// the task is already running.
    ///
    /// The task holds only a weak reference to the manager, and ends once
    /// the manager is dropped.
    pub fn start_eviction_task(self: &Arc<Self>) -> Result<(), Error> {
        let interval = match self.config.eviction_interval() {
            Some(interval) => interval,
            None => return Ok(()),
        };

        let mut eviction = self.eviction.lock().unwrap();
        if eviction.is_some() {
            return Ok(());
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        *eviction = Some(PeriodicTask::spawn(
            "session-eviction",
            interval,
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.run_eviction_pass();
                }
            },
        )?);
        Ok(())
    }

    /// Stop the background eviction task, waiting for any pass in progress
    /// to finish.
    pub fn stop_eviction_task(&self) {
        let task = self.eviction.lock().unwrap().take();
        if let Some(task) = task {
            task.stop();
        }
    }
}

/// Whether `session` is paged out with more queued changes than should be
/// replayed on reload.
fn overflows(session: &Session, threshold: usize) -> bool {
    !session.is_loaded() && session.queued_len() > threshold
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::super::cache::{CacheKey, TieredCache};
    use super::super::lifecycle::MailboxHandle;
    use super::super::manager::OpenedFolder;
    use super::super::test_prelude::*;
    use super::*;
    use crate::support::system_config::SessionConfig;

    struct Setup {
        store: Arc<TestStore>,
        mailbox: Arc<MailboxHandle>,
        manager: Arc<SessionManager>,
    }

    fn set_up(config: SessionConfig) -> Setup {
        crate::init_test_log();
        let store = Arc::new(TestStore::new());
        for folder in 2..=5 {
            store.add_folder(FolderId(folder), &format!("F{}", folder), None);
        }
        for item in 1..=10 {
            for folder in 1..=5 {
                store.add_item(FolderId(folder), folder * 100 + item, Some(item));
            }
        }

        Setup {
            mailbox: handle(&store),
            store,
            manager: Arc::new(SessionManager::with_cache(
                config,
                Arc::new(TieredCache::in_memory()),
            )),
        }
    }

    fn open(setup: &Setup, folder: u32) -> OpenedFolder {
        let opened = setup
            .manager
            .open_folder(
                &setup.mailbox,
                FolderId(folder),
                SelectParams::empty(),
                &format!("conn{}", folder),
            )
            .unwrap();
        // Distinct access times
        thread::sleep(Duration::from_millis(2));
        opened
    }

    fn footprint(manager: &SessionManager) -> usize {
        manager.sessions().iter().map(|s| s.estimated_size()).sum()
    }

    #[test]
    fn footprint_limit_pages_least_recent() {
        let setup = set_up(SessionConfig {
            footprint_limit: 25,
            ..SessionConfig::default()
        });
        let opened: Vec<_> = (1..=5).map(|f| open(&setup, f)).collect();
        assert_eq!(50, footprint(&setup.manager));

        let report = setup.manager.run_eviction_pass();
        assert_eq!(3, report.paged);
        assert!(footprint(&setup.manager) <= 25);
        assert!(opened[4].session.is_loaded());
        assert!(opened[3].session.is_loaded());
        assert!(!opened[0].session.is_loaded());

        // Paged sessions come back transparently
        let len = opened[0].session.with_folder(|v| v.len()).unwrap();
        assert_eq!(10, len);
        assert_eq!(5, setup.manager.sessions().len());
    }

    #[test]
    fn idle_sessions_are_paged() {
        let setup = set_up(SessionConfig {
            inactive_after_secs: 0,
            ..SessionConfig::default()
        });
        let opened = open(&setup, 1);
        thread::sleep(Duration::from_millis(5));

        assert_eq!(1, setup.manager.run_eviction_pass().paged);
        assert!(!opened.session.is_loaded());
        assert_eq!(0, setup.manager.run_eviction_pass().paged);
    }

    #[test]
    fn noninteractive_sessions_are_capped() {
        let setup = set_up(SessionConfig {
            max_noninteractive: 1,
            ..SessionConfig::default()
        });
        let opened: Vec<_> = (1..=3).map(|f| open(&setup, f)).collect();
        for o in &opened {
            setup.manager.close_folder(&o.session).unwrap();
        }

        let report = setup.manager.run_eviction_pass();
        assert_eq!(2, report.dropped);
        assert_eq!(1, setup.manager.sessions().len());
        // The most recently used survives
        assert!(!opened[2].session.is_closed());
        assert!(opened[0].session.is_closed());
    }

    #[test]
    fn long_queues_are_reserialized() {
        let setup = set_up(SessionConfig {
            reserialization_threshold: 2,
            ..SessionConfig::default()
        });
        let opened = open(&setup, 1);
        opened.session.unload(CacheTier::Active).unwrap();

        for item in 11..=13 {
            let mut batch = ChangeBatch::new(ChangeVersion(u64::from(item)));
            batch.created.push(Created {
                folder: FolderId(1),
                entry: setup.store.add_item(FolderId(1), 100 + item, Some(item)),
            });
            setup.manager.notify(&setup.mailbox, &batch);
        }
        assert_eq!(3, opened.session.queued_len());

        let report = setup.manager.run_eviction_pass();
        assert_eq!(1, report.reserialized);
        assert!(!opened.session.is_loaded());
        assert_eq!(0, opened.session.queued_len());
        assert_eq!(13, opened.session.with_folder(|v| v.len()).unwrap());
    }

    #[test]
    fn reserialising_room_is_reserved_against_the_footprint() {
        let setup = set_up(SessionConfig {
            footprint_limit: 25,
            reserialization_threshold: 1,
            ..SessionConfig::default()
        });
        let opened: Vec<_> = (1..=4).map(|f| open(&setup, f)).collect();
        opened[0].session.unload(CacheTier::Active).unwrap();
        for item in 11..=12 {
            let mut batch = ChangeBatch::new(ChangeVersion(u64::from(item)));
            batch.created.push(Created {
                folder: FolderId(1),
                entry: setup.store.add_item(FolderId(1), 100 + item, Some(item)),
            });
            setup.manager.notify(&setup.mailbox, &batch);
        }
        assert_eq!(12, opened[0].session.paged_size());

        // 12 is set aside for the overflowing session, leaving room for
        // only one of the others
        let report = setup.manager.run_eviction_pass();
        assert_eq!(1, report.reserialized);
        assert_eq!(2, report.paged);
        assert!(opened[3].session.is_loaded());
        assert!(!opened[2].session.is_loaded());
        assert!(!opened[1].session.is_loaded());
        assert!(!opened[0].session.is_loaded());
        assert_eq!(0, opened[0].session.queued_len());
        assert!(footprint(&setup.manager) <= 25);
    }

    #[test]
    fn reserialising_leaves_one_snapshot_per_session() {
        let setup = set_up(SessionConfig {
            reserialization_threshold: 0,
            ..SessionConfig::default()
        });
        let opened = open(&setup, 1);
        opened.session.unload(CacheTier::Active).unwrap();

        let cache = setup.manager.cache();
        let key_at = |version: u64| {
            CacheKey::shared(
                CacheTier::Active,
                mailbox_id(),
                FolderId(1),
                ChangeVersion(version),
                UidValidity(1),
            )
        };

        for item in 11..=15 {
            let version = u64::from(item) - 10;
            let mut batch = ChangeBatch::new(ChangeVersion(version));
            batch.created.push(Created {
                folder: FolderId(1),
                entry: setup.store.add_item(FolderId(1), 100 + item, Some(item)),
            });
            setup.manager.notify(&setup.mailbox, &batch);
            assert_eq!(1, setup.manager.run_eviction_pass().reserialized);
            assert_eq!(1, cache.claims(&key_at(version)));
            assert!(cache.get(&key_at(version - 1)).unwrap().is_none());
        }
        assert_eq!(
            Some(key_at(5)),
            opened.session.snapshot_key(&setup.mailbox.lock())
        );

        assert_eq!(15, opened.session.with_folder(|v| v.len()).unwrap());
        assert_eq!(0, cache.claims(&key_at(5)));
        assert!(cache.get(&key_at(5)).unwrap().is_none());
    }

    #[test]
    fn lost_snapshot_drops_session() {
        let setup = set_up(SessionConfig {
            reserialization_threshold: 0,
            ..SessionConfig::default()
        });
        let opened = open(&setup, 1);
        opened.session.unload(CacheTier::Active).unwrap();
        let mut batch = ChangeBatch::new(ChangeVersion(1));
        batch.deleted.push(Deleted::Item(ItemKind::Message, ItemId(101)));
        setup.manager.notify(&setup.mailbox, &batch);
        setup
            .manager
            .cache()
            .clear(&CacheKey::shared(
                CacheTier::Active,
                mailbox_id(),
                FolderId(1),
                ChangeVersion(0),
                UidValidity(1),
            ))
            .unwrap();

        let report = setup.manager.run_eviction_pass();
        assert_eq!(1, report.failed);
        assert!(opened.session.is_closed());
        assert!(setup.manager.sessions().is_empty());
    }

    #[test]
    fn background_task_runs_and_stops() {
        let setup = set_up(SessionConfig {
            eviction_interval_secs: 1,
            inactive_after_secs: 0,
            ..SessionConfig::default()
        });
        let opened = open(&setup, 1);
        setup.manager.start_eviction_task().unwrap();
        // Starting twice is harmless
        setup.manager.start_eviction_task().unwrap();

        for _ in 0..300 {
            if !opened.session.is_loaded() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!opened.session.is_loaded());
        setup.manager.stop_eviction_task();
    }
}
