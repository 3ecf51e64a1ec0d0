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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// concerning one session.
///
/// Clones of a `LogPrefix` share the same underlying data, so the connection
/// can be attached or detached after the prefix has been handed out.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    session: u64,
    mailbox: String,
    folder: u32,
    connection: Option<String>,
}

impl LogPrefix {
    pub fn new(session: u64, mailbox: &str, folder: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session,
                mailbox: sanitise(mailbox.to_owned()),
                folder,
                connection: None,
            })),
        }
    }

    pub fn set_connection(&self, connection: Option<String>) {
        self.inner.lock().unwrap().connection = connection.map(sanitise);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(
            f,
            "session#{}[{}/{}",
            inner.session, inner.mailbox, inner.folder
        )?;
        if let Some(ref connection) = inner.connection {
            write!(f, " conn={}", connection)?;
        }
        write!(f, "]")
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
