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

//! The registry of all sessions.
//!
//! Opening a folder is the expensive part of a session's life, so the
//! manager tries hard to avoid going to the backing store for it. In order,
//! it looks for:
//!
//! 1. Another session with the same folder loaded. Its entries are copied;
//!    if it has no connection it has served its purpose and is dropped.
//!
//! 2. A snapshot in the cache for the folder's current change version and
//!    UID validity.
//!
//! 3. The backing store itself.
//!
//! Virtual folders are defined by a search, so only the third option is
//! reliable for them.
//!
//! Everything involving a particular mailbox happens under that mailbox's
//! lock, including registering the new session. This is what stops two
//! connections opening the same folder at the same time from both asking
//! the store to number the same items.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use super::cache::{CacheKey, CacheTier, TieredCache};
use super::folder::FolderView;
use super::lifecycle::{MailboxGuard, MailboxHandle, NotifyOutcome, Session};
use super::model::*;
use super::store::{ChangeBatch, FolderInfo};
use crate::support::error::Error;
use crate::support::system_config::SessionConfig;
use crate::support::threading::PeriodicTask;

/// The values a client is told upon selecting a folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialFolderValues {
    pub uid_next: Uid,
    pub change_version: ChangeVersion,
    pub uid_validity: UidValidity,
    pub first_unread: Option<Seqnum>,
    pub exists: usize,
    pub recent: usize,
}

pub struct OpenedFolder {
    pub session: Arc<Session>,
    pub initial: InitialFolderValues,
}

pub struct SessionManager {
    pub(super) config: SessionConfig,
    pub(super) cache: Arc<TieredCache>,
    registry: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    pub(super) eviction: Mutex<Option<PeriodicTask>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        let cache = Arc::new(TieredCache::from_config(&config.cache)?);
        Ok(SessionManager::with_cache(config, cache))
    }

    pub fn with_cache(config: SessionConfig, cache: Arc<TieredCache>) -> Self {
        SessionManager {
            config,
            cache,
            registry: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            eviction: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// All registered sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.lock().unwrap().values().cloned().collect()
    }

    /// Registered sessions on `mailbox`, optionally only those on `folder`.
    fn sessions_for(
        &self,
        mailbox: &Arc<MailboxHandle>,
        folder: Option<FolderId>,
    ) -> Vec<Arc<Session>> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter(|s| Arc::ptr_eq(s.mailbox(), mailbox))
            .filter(|s| folder.map_or(true, |f| f == s.folder()))
            .cloned()
            .collect()
    }

    /// Remove a session from the registry, returning it if it was there.
    pub fn detach(&self, session: SessionId) -> Option<Arc<Session>> {
        self.registry.lock().unwrap().remove(&session)
    }

    /// Close `session` and remove it from the registry.
    pub(super) fn discard(&self, guard: &MailboxGuard<'_>, session: &Session) {
        session.close_locked(guard);
        self.detach(session.id());
    }

    /// Select `folder` for the connection identified by `connection`.
    pub fn open_folder(
        &self,
        mailbox: &Arc<MailboxHandle>,
        folder: FolderId,
        params: SelectParams,
        connection: &str,
    ) -> Result<OpenedFolder, Error> {
        let guard = mailbox.lock();
        let (view, initial) = self.build_view(&guard, mailbox, folder, params, true)?;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(
            id,
            Arc::clone(mailbox),
            view,
            Arc::clone(&self.cache),
            Some(connection.to_owned()),
        ));
        self.registry
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&session));
        info!(
            "{} Opened {} entries, {} recent",
            session.log_prefix(),
            initial.exists,
            initial.recent
        );

        Ok(OpenedFolder { session, initial })
    }

    /// Give `session` a fresh view straight from the backing store, as when
    /// its snapshot has been lost.
    ///
    /// The connection must treat this like a new selection.
    pub fn rebuild(
        &self,
        session: &Arc<Session>,
        params: SelectParams,
    ) -> Result<InitialFolderValues, Error> {
        let mailbox = session.mailbox();
        let guard = mailbox.lock();
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }

        let (view, initial) =
            self.build_view(&guard, mailbox, session.folder(), params, false)?;
        session.replace_locked(&guard, view);
        info!("{} Rebuilt from backing store", session.log_prefix());
        Ok(initial)
    }

    fn build_view(
        &self,
        guard: &MailboxGuard<'_>,
        mailbox: &Arc<MailboxHandle>,
        folder: FolderId,
        params: SelectParams,
        reuse: bool,
    ) -> Result<(FolderView, InitialFolderValues), Error> {
        let store = guard.store();
        let info = store.folder_info(mailbox.id(), folder)?;
        if !info.selectable {
            return Err(Error::FolderNotSelectable);
        }

        let change_version = store.current_change_version(mailbox.id(), folder)?;
        let uid_validity = store.current_uid_validity(mailbox.id(), folder)?;

        let reused = if reuse && !info.is_virtual() {
            self.reuse_entries(guard, mailbox, folder, change_version, uid_validity)
        } else {
            None
        };

        let entries = match reused {
            Some(reused) if self.config.consistency_check => {
                let fresh = read_store(guard, folder)?;
                if reused != fresh {
                    warn!(
                        "{}/{:?}: reused entries disagree with the backing store",
                        mailbox.id(),
                        folder
                    );
                    let key = CacheKey::shared(
                        CacheTier::Active,
                        mailbox.id().clone(),
                        folder,
                        change_version,
                        uid_validity,
                    );
                    if let Err(e) = self.cache.clear(&key) {
                        warn!("Failed to clear {}: {}", key, e);
                    }
                }
                fresh
            }
            Some(reused) => reused,
            None => read_store(guard, folder)?,
        };

        let mut view = FolderView::new(
            mailbox.id().clone(),
            folder,
            uid_validity,
            info.path.clone(),
            info.query.clone(),
        );
        for entry in entries {
            let recent = entry.uid().get() > info.recent_cutoff;
            view.append(entry, recent, store);
        }
        view.set_version(change_version);
        view.begin_select(
            !params.contains(SelectParams::READ_ONLY),
            params.contains(SelectParams::CONDSTORE),
        );

        let initial = initial_values(&view, &info, change_version);
        Ok((view, initial))
    }

    /// Find entries for `folder` without going to the backing store.
    fn reuse_entries(
        &self,
        guard: &MailboxGuard<'_>,
        mailbox: &Arc<MailboxHandle>,
        folder: FolderId,
        change_version: ChangeVersion,
        uid_validity: UidValidity,
    ) -> Option<Vec<MessageEntry>> {
        for other in self.sessions_for(mailbox, Some(folder)) {
            let entries = other.peek_locked(guard, |view| {
                if view.uid_validity() == uid_validity
                    && view.version() == change_version
                {
                    Some(view.fresh_entries())
                } else {
                    None
                }
            });

            if let Some(Some(entries)) = entries {
                if !other.is_interactive() {
                    info!("{} Handing entries to new session", other.log_prefix());
                    self.discard(guard, &other);
                }
                return Some(entries);
            }
        }

        let key = CacheKey::shared(
            CacheTier::Inactive,
            mailbox.id().clone(),
            folder,
            change_version,
            uid_validity,
        );
        match self.cache.lookup_shared(&key) {
            Ok(snapshot) => snapshot.map(|s| s.folder.fresh_entries()),
            Err(e) => {
                warn!("Failed to read snapshot {}: {}", key, e);
                None
            }
        }
    }

    /// Handle the connection on `session` closing the folder.
    ///
    /// A writable session records that everything it saw is no longer
    /// `\Recent`. The session is then either dropped, or kept around without
    /// a connection (possibly paged out to the inactive cache tier) so that
    /// reopening the folder is cheap.
    pub fn close_folder(&self, session: &Arc<Session>) -> Result<(), Error> {
        let mailbox = session.mailbox();
        let guard = mailbox.lock();

        let seen = session.with_folder_locked(&guard, |view| {
            let seen = if view.is_writable() {
                view.max_uid()
            } else {
                None
            };
            view.end_select();
            seen
        });

        match seen {
            Ok(Some(uid)) => {
                if let Err(e) = guard.store().record_recent_cutoff(
                    mailbox.id(),
                    session.folder(),
                    uid,
                ) {
                    warn!(
                        "{} Failed to record recent cutoff: {}",
                        session.log_prefix(),
                        e
                    );
                }
            }
            Ok(None) => (),
            Err(Error::NxSnapshot) | Err(Error::SessionClosed) => {
                self.discard(&guard, session);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        session.set_connection(None);
        let others = self
            .sessions_for(mailbox, Some(session.folder()))
            .iter()
            .any(|s| s.id() != session.id() && s.is_interactive());

        if session.is_virtual() || self.config.terminate_on_close || others {
            self.discard(&guard, session);
        } else if self.config.serialize_on_close {
            if let Err(e) = session.unload_locked(&guard, CacheTier::Inactive) {
                warn!(
                    "{} Failed to page out closed session: {}",
                    session.log_prefix(),
                    e
                );
                self.discard(&guard, session);
            }
        }

        Ok(())
    }

    /// Deliver a change batch to every session on `mailbox`.
    ///
    /// The first writable session on each folder is told that new entries
    /// are `\Recent`. Sessions whose folder has gone away are closed and
    /// removed; their ids are returned.
    pub fn notify(
        &self,
        mailbox: &Arc<MailboxHandle>,
        batch: &ChangeBatch,
    ) -> Vec<SessionId> {
        let guard = mailbox.lock();
        let mut recent_given = BTreeSet::new();
        let mut closed = Vec::new();

        for session in self.sessions_for(mailbox, None) {
            if session.is_closed() {
                continue;
            }

            let recent =
                session.is_writable() && recent_given.insert(session.folder());
            match session.notify_locked(&guard, batch, recent) {
                Ok(NotifyOutcome::Applied) | Ok(NotifyOutcome::Queued) => (),
                Ok(NotifyOutcome::FolderGone) | Err(Error::SessionClosed) => {
                    self.discard(&guard, &session);
                    closed.push(session.id());
                }
                Err(e) => {
                    warn!(
                        "{} Failed to apply change batch: {}",
                        session.log_prefix(),
                        e
                    );
                    self.discard(&guard, &session);
                    closed.push(session.id());
                }
            }
        }

        closed
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut eviction) = self.eviction.lock() {
            eviction.take();
        }
    }
}

/// Read `folder` from the backing store, numbering anything without a UID.
fn read_store(
    guard: &MailboxGuard<'_>,
    folder: FolderId,
) -> Result<Vec<MessageEntry>, Error> {
    let store = guard.store();
    let listed = store.list_folder_entries(guard.id(), folder)?;

    let mut entries = Vec::with_capacity(listed.len());
    let mut unnumbered = Vec::new();
    for entry in listed.iter().filter(|e| e.kind.is_listable()) {
        match entry.uid {
            Some(uid) => entries.push(MessageEntry::from_store(entry, uid)),
            None => unnumbered.push(entry),
        }
    }

    entries.sort_by_key(MessageEntry::uid);
    let before = entries.len();
    entries.dedup_by_key(|e| e.uid());
    if entries.len() != before {
        warn!(
            "{}/{:?}: backing store listed {} duplicate UIDs",
            guard.id(),
            folder,
            before - entries.len()
        );
    }

    if !unnumbered.is_empty() {
        let items: Vec<ItemId> = unnumbered.iter().map(|e| e.item).collect();
        let uids = store.assign_uids(guard.id(), folder, &items)?;
        let max = entries.last().map(MessageEntry::uid);
        for (entry, uid) in unnumbered.into_iter().zip(uids) {
            if max.map_or(false, |max| uid <= max) {
                warn!(
                    "{}/{:?}: assigned {:?} is not beyond {:?}; skipping {:?}",
                    guard.id(),
                    folder,
                    uid,
                    max,
                    entry.item
                );
                continue;
            }
            entries.push(MessageEntry::from_store(entry, uid));
        }
    }

    Ok(entries)
}

fn initial_values(
    view: &FolderView,
    info: &FolderInfo,
    change_version: ChangeVersion,
) -> InitialFolderValues {
    let after_last = view.max_uid().map_or(Uid::MIN, Uid::saturating_next);
    InitialFolderValues {
        uid_next: info.uid_next.max(after_last),
        change_version,
        uid_validity: view.uid_validity(),
        first_unread: view.first_unread(),
        exists: view.len(),
        recent: view.recent_count(),
    }
}
