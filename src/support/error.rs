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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such folder")]
    NxFolder,
    #[error("No such message")]
    NxMessage,
    /// The cached snapshot backing a paged session is gone. The caller must
    /// rebuild the session from the backing store.
    #[error("Session snapshot no longer available")]
    NxSnapshot,
    #[error("Folder is not selectable")]
    FolderNotSelectable,
    /// The folder was deleted or the mailbox became unreachable while the
    /// session was open.
    #[error("Selected folder is gone")]
    SessionClosed,
    #[error("Invalid message sequence number: {0}")]
    BadSequence(String),
    #[error("Unsupported snapshot format version {0}")]
    UnsupportedSnapshot(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}
