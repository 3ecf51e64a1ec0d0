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

//! Utilities for working with threads.
//!
//! The process spends most of its life idle, so background work is done on a
//! single dedicated thread per periodic task rather than a pool.

use std::io;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, error};

/// A named thread which invokes a closure at a fixed interval until stopped.
///
/// Dropping the `PeriodicTask` stops it and waits for the thread to exit.
pub struct PeriodicTask {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a thread named `name` which runs `tick` every `interval`.
    ///
    /// The first invocation happens one full interval after spawning.
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_name = name.to_owned();
        let handle = thread::Builder::new().name(name.to_owned()).spawn(
            move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("{} stopping", thread_name);
                        break;
                    }
                }
            },
        )?;

        Ok(Self {
            name: name.to_owned(),
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the task to stop and wait for it to do so.
    ///
    /// If the task is in the middle of a tick, this waits for the tick to
    /// complete.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Some(handle) = self.handle.take() {
            // Dropped from within its own tick; the loop exits on its own
            // once the tick returns.
            if handle.thread().id() == thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                error!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
