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

//! A session: one connection's folder view, either loaded or paged out.
//!
//! Lock order is mailbox first, then session. This is enforced by the
//! types: the only way to lock a session's state is `lock_state()`, which
//! requires a `MailboxGuard` for the session's mailbox.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::cache::{CacheKey, CacheTier, TieredCache};
use super::folder::{BatchOutcome, FolderView};
use super::model::*;
use super::paged::PagedFolder;
use super::store::{ChangeBatch, MailStore};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// A mailbox as seen by the session layer: its identity, the backing store
/// it lives in, and the lock serialising changes to it.
pub struct MailboxHandle {
    id: MailboxId,
    store: Arc<dyn MailStore>,
    lock: Mutex<()>,
}

impl MailboxHandle {
    pub fn new(id: MailboxId, store: Arc<dyn MailStore>) -> Self {
        MailboxHandle {
            id,
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &MailboxId {
        &self.id
    }

    pub fn store(&self) -> &dyn MailStore {
        &*self.store
    }

    pub fn lock(&self) -> MailboxGuard<'_> {
        MailboxGuard {
            mailbox: self,
            _lock: self.lock.lock().unwrap(),
        }
    }
}

/// Proof that the current thread holds a mailbox's lock.
pub struct MailboxGuard<'a> {
    mailbox: &'a MailboxHandle,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> MailboxGuard<'a> {
    pub fn id(&self) -> &'a MailboxId {
        &self.mailbox.id
    }

    pub fn store(&self) -> &'a dyn MailStore {
        &*self.mailbox.store
    }

    fn is_for(&self, mailbox: &MailboxHandle) -> bool {
        ptr::eq(self.mailbox, mailbox)
    }
}

/// The result of `Session::reload()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reload {
    AlreadyLoaded,
    Reloaded,
    /// The snapshot is gone. The session must be rebuilt from the backing
    /// store.
    Unavailable,
}

/// The result of delivering a change batch to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Applied,
    /// The session is paged out and the batch was queued.
    Queued,
    /// The folder is gone and the session has been closed.
    FolderGone,
}

enum SessionState {
    Loaded(Box<FolderView>),
    Paged(PagedFolder),
    Closed,
}

pub struct Session {
    id: SessionId,
    mailbox: Arc<MailboxHandle>,
    folder: FolderId,
    is_virtual: bool,
    log_prefix: LogPrefix,
    cache: Arc<TieredCache>,

    connection: Mutex<Option<String>>,
    last_access: Mutex<Instant>,
    state: Mutex<SessionState>,

    // Mirrors of the state, readable without taking any lock
    loaded: AtomicBool,
    closed: AtomicBool,
    writable: AtomicBool,
    loaded_size: AtomicUsize,
    paged_size: AtomicUsize,
    queued_len: AtomicUsize,
}

impl Session {
    pub fn new(
        id: SessionId,
        mailbox: Arc<MailboxHandle>,
        view: FolderView,
        cache: Arc<TieredCache>,
        connection: Option<String>,
    ) -> Self {
        let log_prefix =
            LogPrefix::new(id.0, &mailbox.id().0, view.folder().0);
        log_prefix.set_connection(connection.clone());

        Session {
            id,
            folder: view.folder(),
            is_virtual: view.is_virtual(),
            mailbox,
            log_prefix,
            cache,
            connection: Mutex::new(connection),
            last_access: Mutex::new(Instant::now()),
            loaded: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            writable: AtomicBool::new(view.is_writable()),
            loaded_size: AtomicUsize::new(view.len()),
            paged_size: AtomicUsize::new(0),
            queued_len: AtomicUsize::new(0),
            state: Mutex::new(SessionState::Loaded(Box::new(view))),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mailbox(&self) -> &Arc<MailboxHandle> {
        &self.mailbox
    }

    pub fn folder(&self) -> FolderId {
        self.folder
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    /// Whether a connection is attached to this session.
    pub fn is_interactive(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    pub fn connection(&self) -> Option<String> {
        self.connection.lock().unwrap().clone()
    }

    pub fn set_connection(&self, connection: Option<String>) {
        self.log_prefix.set_connection(connection.clone());
        *self.connection.lock().unwrap() = connection;
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock().unwrap()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access().elapsed()
    }

    /// The number of entries held in memory, or 0 if not loaded.
    pub fn estimated_size(&self) -> usize {
        self.loaded_size.load(Ordering::Relaxed)
    }

    /// If paged out, the number of entries the view had plus the number of
    /// queued changes. Otherwise 0.
    pub fn paged_size(&self) -> usize {
        self.paged_size.load(Ordering::Relaxed)
    }

    /// The number of changes queued while paged out.
    pub fn queued_len(&self) -> usize {
        self.queued_len.load(Ordering::Relaxed)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Whether the connection has the folder selected read-write.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn lock_state<'a>(
        &'a self,
        mailbox: &'a MailboxGuard<'_>,
    ) -> MutexGuard<'a, SessionState> {
        assert!(
            mailbox.is_for(&self.mailbox),
            "{} locked with another mailbox's guard",
            self.log_prefix
        );
        self.state.lock().unwrap()
    }

    fn publish(&self, state: &SessionState) {
        let (loaded, writable, size, paged, queued) = match *state {
            SessionState::Loaded(ref view) => {
                (true, view.is_writable(), view.len(), 0, 0)
            }
            SessionState::Paged(ref p) => {
                let queued = p.queued_len();
                (false, p.is_writable(), 0, p.original_size() + queued, queued)
            }
            SessionState::Closed => (false, false, 0, 0, 0),
        };
        self.loaded.store(loaded, Ordering::Relaxed);
        self.writable.store(writable, Ordering::Relaxed);
        self.closed.store(
            matches!(*state, SessionState::Closed),
            Ordering::Relaxed,
        );
        self.loaded_size.store(size, Ordering::Relaxed);
        self.paged_size.store(paged, Ordering::Relaxed);
        self.queued_len.store(queued, Ordering::Relaxed);
    }

    /// Run `f` against the folder view, reloading it first if paged out.
    ///
    /// Fails with `NxSnapshot` if the session is paged out and its snapshot
    /// is gone, or `SessionClosed` if the session was closed.
    pub fn with_folder<R>(
        &self,
        f: impl FnOnce(&mut FolderView) -> R,
    ) -> Result<R, Error> {
        self.touch();
        let guard = self.mailbox.lock();
        self.with_folder_locked(&guard, f)
    }

    pub fn with_folder_locked<R>(
        &self,
        guard: &MailboxGuard<'_>,
        f: impl FnOnce(&mut FolderView) -> R,
    ) -> Result<R, Error> {
        let mut state = self.lock_state(guard);
        if Reload::Unavailable == self.reload_state(guard, &mut state)? {
            return Err(Error::NxSnapshot);
        }

        let result = match *state {
            SessionState::Loaded(ref mut view) => f(view),
            _ => return Err(Error::SessionClosed),
        };
        self.publish(&state);
        Ok(result)
    }

    /// If the session is loaded, run `f` against its view without touching
    /// the access time. Returns `None` if not loaded.
    pub fn peek_locked<R>(
        &self,
        guard: &MailboxGuard<'_>,
        f: impl FnOnce(&FolderView) -> R,
    ) -> Option<R> {
        let state = self.lock_state(guard);
        match *state {
            SessionState::Loaded(ref view) => Some(f(view)),
            _ => None,
        }
    }

    /// Deliver `batch` to this session.
    ///
    /// A loaded session applies it immediately; a paged one queues it. If the
    /// batch removes the folder, the session is closed.
    pub fn notify_locked(
        &self,
        guard: &MailboxGuard<'_>,
        batch: &ChangeBatch,
        recent: bool,
    ) -> Result<NotifyOutcome, Error> {
        let mut state = self.lock_state(guard);
        let outcome = match *state {
            SessionState::Loaded(ref mut view) => {
                match view.apply_batch(batch, guard.store(), recent) {
                    BatchOutcome::Applied => NotifyOutcome::Applied,
                    BatchOutcome::FolderGone => NotifyOutcome::FolderGone,
                }
            }
            SessionState::Paged(ref mut paged) => {
                if super::folder::closes_folder(batch, self.folder) {
                    NotifyOutcome::FolderGone
                } else {
                    paged.enqueue(batch, recent);
                    NotifyOutcome::Queued
                }
            }
            SessionState::Closed => return Err(Error::SessionClosed),
        };

        if NotifyOutcome::FolderGone == outcome {
            info!("{} Folder removed; closing session", self.log_prefix);
            self.release_paged(&state, false);
            *state = SessionState::Closed;
        }
        self.publish(&state);
        Ok(outcome)
    }

    /// Write the folder view to `tier` of the cache and drop it from memory.
    ///
    /// A session already paged out to a different tier is moved there. A
    /// session without a connection sweeps its expunged entries first, since
    /// nobody is going to be told about them.
    pub fn unload(&self, tier: CacheTier) -> Result<(), Error> {
        let guard = self.mailbox.lock();
        self.unload_locked(&guard, tier)
    }

    pub fn unload_locked(
        &self,
        guard: &MailboxGuard<'_>,
        tier: CacheTier,
    ) -> Result<(), Error> {
        let mut state = self.lock_state(guard);
        match *state {
            SessionState::Paged(ref paged) if paged.tier() == tier => {
                return Ok(())
            }
            SessionState::Paged(_) => {
                if Reload::Unavailable
                    == self.reload_state(guard, &mut state)?
                {
                    return Err(Error::NxSnapshot);
                }
            }
            SessionState::Loaded(_) => (),
            SessionState::Closed => return Err(Error::SessionClosed),
        }

        let paged = match *state {
            SessionState::Loaded(ref mut view) => {
                if !self.is_interactive() {
                    view.sweep_expunged();
                }

                let key =
                    CacheKey::for_view(tier, view, view.version(), self.id);
                self.cache.put(&key, view)?;
                debug!("{} Paged out to {}", self.log_prefix, key);
                PagedFolder::capture(key, view)
            }
            _ => return Err(Error::SessionClosed),
        };

        *state = SessionState::Paged(paged);
        self.publish(&state);
        Ok(())
    }

    /// Bring a paged-out session back into memory, replaying everything
    /// queued in the meantime.
    pub fn reload(&self) -> Result<Reload, Error> {
        let guard = self.mailbox.lock();
        self.reload_locked(&guard)
    }

    pub fn reload_locked(&self, guard: &MailboxGuard<'_>) -> Result<Reload, Error> {
        let mut state = self.lock_state(guard);
        let result = self.reload_state(guard, &mut state);
        self.publish(&state);
        result
    }

    fn reload_state(
        &self,
        guard: &MailboxGuard<'_>,
        state: &mut SessionState,
    ) -> Result<Reload, Error> {
        let paged = match *state {
            SessionState::Loaded(_) => return Ok(Reload::AlreadyLoaded),
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Paged(ref paged) => paged,
        };

        let snapshot = match self.cache.get(paged.key())? {
            Some(snapshot) => snapshot,
            None => {
                warn!(
                    "{} Snapshot {} has disappeared",
                    self.log_prefix,
                    paged.key()
                );
                return Ok(Reload::Unavailable);
            }
        };

        let mut view = snapshot.folder;
        paged.restore_into(&mut view);
        let gone = paged.queued().any(|queued| {
            BatchOutcome::FolderGone
                == view.apply_batch(&queued.batch, guard.store(), queued.recent)
        });
        self.release_paged(state, true);
        if gone {
            info!(
                "{} Folder removed while paged out; closing session",
                self.log_prefix
            );
            *state = SessionState::Closed;
            return Err(Error::SessionClosed);
        }

        if !self.is_interactive() {
            view.sweep_expunged();
        }

        debug!("{} Reloaded", self.log_prefix);
        *state = SessionState::Loaded(Box::new(view));
        Ok(Reload::Reloaded)
    }

    /// If `state` is paged out, give up its claim on its snapshot.
    ///
    /// If `consumed`, the snapshot has been read back, and an inactive-tier
    /// one is also removed.
    fn release_paged(&self, state: &SessionState, consumed: bool) {
        let key = match *state {
            SessionState::Paged(ref paged) => paged.key(),
            _ => return,
        };

        let result = self.cache.release(key).and_then(|_| {
            if consumed {
                self.cache.safe_remove(key).map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!(
                "{} Failed to release snapshot {}: {}",
                self.log_prefix, key, e
            );
        }
    }

    /// The key of the snapshot holding this session's view, if paged out.
    pub fn snapshot_key(&self, guard: &MailboxGuard<'_>) -> Option<CacheKey> {
        match *self.lock_state(guard) {
            SessionState::Paged(ref paged) => Some(paged.key().clone()),
            _ => None,
        }
    }

    /// Replace whatever the session holds with `view`.
    pub fn replace_locked(&self, guard: &MailboxGuard<'_>, view: FolderView) {
        let mut state = self.lock_state(guard);
        self.release_paged(&state, false);
        *state = SessionState::Loaded(Box::new(view));
        self.publish(&state);
    }

    /// Permanently close the session. Any further use fails with
    /// `SessionClosed`.
    pub fn close_locked(&self, guard: &MailboxGuard<'_>) {
        let mut state = self.lock_state(guard);
        self.release_paged(&state, false);
        *state = SessionState::Closed;
        self.publish(&state);
    }
}
