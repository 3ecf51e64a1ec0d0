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

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::warn;

use super::main::InspectSnapshotSubcommand;
use crate::session::cache::Snapshot;
use crate::session::range::RangeList;
use crate::support::error::Error;
use crate::support::sysexits::*;

pub(super) fn inspect(cmd: InspectSnapshotSubcommand) {
    let mut failed = false;
    for file in &cmd.files {
        match describe(file, cmd.entries) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                warn!("{}: {}", file.display(), e);
                eprintln!("{}: {}", file.display(), e);
                failed = true;
            }
        }
    }

    if failed {
        EX_DATAERR.exit();
    }
}

fn describe(file: &Path, entries: bool) -> Result<String, Error> {
    let snapshot = Snapshot::decode(&fs::read(file)?)?;
    Ok(summarise(&file.display().to_string(), &snapshot, entries))
}

fn summarise(name: &str, snapshot: &Snapshot, entries: bool) -> String {
    let view = &snapshot.folder;
    let uids: RangeList =
        view.entries().iter().map(|e| e.uid().get()).collect();

    let mut out = String::new();
    let _ = writeln!(out, "{}:", name);
    let _ = writeln!(out, "  format:         {}", snapshot.format);
    let _ = writeln!(out, "  created:        {}", snapshot.created.to_rfc3339());
    let _ = writeln!(out, "  change version: {}", snapshot.version.0);
    let _ = writeln!(
        out,
        "  folder:         {} ({}){}",
        view.path(),
        view.folder().0,
        if view.is_virtual() { " virtual" } else { "" }
    );
    let _ = writeln!(out, "  uid validity:   {}", view.uid_validity().0);
    let _ = writeln!(out, "  entries:        {}", view.len());
    let _ = writeln!(out, "  uids:           {}", uids);
    match snapshot.session {
        Some(ref session) => {
            let _ = writeln!(
                out,
                "  selected:       {} ({} expunged)",
                if session.is_writable() {
                    "read-write"
                } else {
                    "read-only"
                },
                session.expunged_count()
            );
        }
        None => {
            let _ = writeln!(out, "  selected:       no");
        }
    }

    if entries {
        for (seqnum, entry) in view.seqnums_entries() {
            let _ = writeln!(
                out,
                "  {:>6} uid={} item={} {:?} {:?}",
                seqnum.get(),
                entry.uid().get(),
                entry.item().0,
                entry.flags(),
                entry.session_flags()
            );
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::model::*;
    use crate::session::test_prelude::*;

    #[test]
    fn summary_of_selected_view() {
        let mut view = view_with_uids(&[1, 2, 3, 7]);
        view.begin_select(true, false);
        view.mark_expunged(Uid::u(2));
        let snapshot = Snapshot::decode(
            &Snapshot::new(&view, ChangeVersion(42)).encode().unwrap(),
        )
        .unwrap();

        let text = summarise("x.snap", &snapshot, true);
        assert!(text.starts_with("x.snap:\n"));
        assert!(text.contains("change version: 42\n"));
        assert!(text.contains("folder:         INBOX (1)\n"));
        assert!(text.contains("uids:           1:3,7\n"));
        assert!(text.contains("read-write (1 expunged)"));
        assert!(text.contains("uid=7 item=7"));
    }

    #[test]
    fn unselected_virtual_view() {
        let view = virtual_view();
        let snapshot = Snapshot::new(&view, ChangeVersion(1));
        let text = summarise("v", &snapshot, false);
        assert!(text.contains("Search (50) virtual"));
        assert!(text.contains("selected:       no"));
        assert!(!text.contains("uid="));
    }
}
