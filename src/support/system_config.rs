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

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Configuration for the session manager.
///
/// This is stored in a file named `session.toml`. Every field has a usable
/// default, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often, in seconds, the eviction task runs.
    ///
    /// 0 disables the background task entirely; eviction then only happens
    /// through explicit calls.
    pub eviction_interval_secs: u64,

    /// How long, in seconds, a loaded session may go without being accessed
    /// before the eviction task pages it out.
    pub inactive_after_secs: u64,

    /// The maximum total number of message entries held in memory by loaded
    /// sessions.
    ///
    /// When this is exceeded, the eviction task pages out sessions, most
    /// stale first, until the live footprint is back under the limit.
    pub footprint_limit: usize,

    /// The maximum number of non-interactive sessions to retain.
    ///
    /// Non-interactive sessions are ones whose connection has closed the
    /// folder or gone away. They are kept so that reopening the folder is
    /// cheap, but beyond this count the least recently used are dropped.
    pub max_noninteractive: usize,

    /// The number of queued change notifications a paged session may
    /// accumulate before the eviction task reloads it and writes a fresh
    /// snapshot.
    pub reserialization_threshold: usize,

    /// If true, any entry list reused from another session or the cache is
    /// compared against a fresh read of the backing store. Mismatches
    /// invalidate the cache.
    ///
    /// This is expensive and only useful when debugging.
    pub consistency_check: bool,

    /// If true, a session's folder view is written to the inactive cache tier
    /// when its connection closes the folder.
    pub serialize_on_close: bool,

    /// If true, sessions are unregistered as soon as their connection closes
    /// the folder instead of lingering as non-interactive sessions.
    pub terminate_on_close: bool,

    pub cache: CacheConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            eviction_interval_secs: 30,
            inactive_after_secs: 30 * 60,
            footprint_limit: 2_000_000,
            max_noninteractive: 100,
            reserialization_threshold: 500,
            consistency_check: false,
            serialize_on_close: true,
            terminate_on_close: false,
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the active cache tier.
    ///
    /// If unset, the active tier is kept in memory and does not survive a
    /// restart.
    pub directory: Option<PathBuf>,

    /// The approximate number of bytes of snapshots the active tier may hold
    /// when kept in memory. Sessions whose snapshots are evicted to stay
    /// within this are rebuilt from the backing store when next used.
    pub active_capacity_bytes: u64,

    /// The approximate number of bytes of snapshots the inactive tier may
    /// hold before evicting the least recently used.
    pub inactive_capacity_bytes: u64,

    /// How long, in seconds, an inactive-tier snapshot may go unread before
    /// it is discarded.
    pub inactive_idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            active_capacity_bytes: 256 * 1024 * 1024,
            inactive_capacity_bytes: 64 * 1024 * 1024,
            inactive_idle_secs: 24 * 60 * 60,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn eviction_interval(&self) -> Option<Duration> {
        if 0 == self.eviction_interval_secs {
            None
        } else {
            Some(Duration::from_secs(self.eviction_interval_secs))
        }
    }

    pub fn inactive_after(&self) -> Duration {
        Duration::from_secs(self.inactive_after_secs)
    }
}
