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

use super::super::model::*;
use super::FolderView;

impl FolderView {
    /// Note that the entry with the given UID changed at `version` and the
    /// client should be sent a `FETCH` for it.
    ///
    /// Repeated marks keep the greatest version. Does nothing if the folder
    /// is not selected, notifications are suspended, or the UID is unknown.
    pub fn mark_dirty(&mut self, uid: Uid, version: ChangeVersion) {
        if self.index_of_uid(uid).is_none() {
            return;
        }

        if let Some(ref mut session) = self.session {
            if session.notifications_suspended {
                return;
            }

            let v = session.dirty.entry(uid).or_insert(version);
            *v = (*v).max(version);
        }
    }

    pub fn is_dirty(&self, uid: Uid) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.dirty.contains_key(&uid))
    }

    pub fn dirty_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.dirty.len())
    }

    /// Take every dirty entry, in UID order, with the version at which it
    /// last changed.
    ///
    /// The entries returned are now considered reported, so they lose
    /// `ADDED`.
    pub fn take_dirty(&mut self) -> Vec<(Uid, ChangeVersion)> {
        let dirty = match self.session {
            Some(ref mut session) => std::mem::take(&mut session.dirty),
            None => return Vec::new(),
        };

        for &uid in dirty.keys() {
            if let Some(entry) = self.lookup_by_uid_mut(uid) {
                entry.session_flags_mut().remove(SessionFlags::ADDED);
            }
        }

        dirty.into_iter().collect()
    }

    /// Forget all dirty state, treating every entry as reported.
    pub fn clear_dirty(&mut self) {
        if let Some(ref mut session) = self.session {
            session.dirty.clear();
        }

        for entry in &mut self.entries {
            entry.session_flags_mut().remove(SessionFlags::ADDED);
        }
    }

    /// Stop recording dirty entries, e.g., while the connection itself is
    /// making changes it will report directly.
    pub fn suspend_notifications(&mut self) {
        if let Some(ref mut session) = self.session {
            session.notifications_suspended = true;
        }
    }

    pub fn resume_notifications(&mut self) {
        if let Some(ref mut session) = self.session {
            session.notifications_suspended = false;
        }
    }
}
