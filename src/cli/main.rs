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
use std::path::{Path, PathBuf};

use log::info;
use structopt::StructOpt;

use crate::session::SessionManager;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::SessionConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Load the session configuration and print the effective settings.
    ///
    /// This also opens the snapshot cache as the server would, so problems
    /// with the cache directory show up here rather than on the first
    /// connection.
    CheckConfig(CommonOptions),
    /// Describe snapshot files from the on-disk cache.
    ///
    /// Use `--entries` to list each entry in the snapshot as well.
    InspectSnapshot(InspectSnapshotSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `session.toml` and optionally `logging.toml`
    /// [default: /etc/crymap or /usr/local/etc/crymap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

/// Describe one or more snapshot files from the on-disk cache.
///
/// Snapshots are written by the server when sessions are paged out. This
/// prints what each one holds: the folder, its change version and UID
/// validity, and the UIDs of the entries within.
#[derive(StructOpt)]
pub(super) struct InspectSnapshotSubcommand {
    /// Also list every entry with its flags.
    #[structopt(long)]
    pub(super) entries: bool,

    /// The snapshot files to inspect.
    #[structopt(parse(from_os_str), required = true)]
    pub(super) files: Vec<PathBuf>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    match cmd {
        Command::CheckConfig(common) => check_config(common),
        Command::InspectSnapshot(cmd) => {
            crate::init_simple_log();
            super::inspect::inspect(cmd);
        }
    }
}

fn find_root(common: CommonOptions) -> PathBuf {
    common.root.unwrap_or_else(|| {
        if Path::new("/etc/crymap/session.toml").is_file() {
            "/etc/crymap".to_owned().into()
        } else if Path::new("/usr/local/etc/crymap/session.toml").is_file() {
            "/usr/local/etc/crymap".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/crymap nor /usr/local/etc/crymap contains\n\
                 session.toml; use --root=/path/to/crymap if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    })
}

fn init_logging(root: &Path) {
    let log_config_file = root.join("logging.toml");
    if !log_config_file.is_file() {
        crate::init_simple_log();
        return;
    }

    if let Err(e) =
        log4rs::init_file(&log_config_file, log4rs::file::Deserializers::new())
    {
        eprintln!(
            "Error in logging config at '{}': {}",
            log_config_file.display(),
            e
        );
        EX_CONFIG.exit();
    }
}

fn check_config(common: CommonOptions) {
    let root = find_root(common);
    let config_path = root.join("session.toml");
    let config = match SessionConfig::load(&config_path) {
        Ok(config) => config,
        Err(Error::Io(e)) if io::ErrorKind::NotFound == e.kind() => {
            eprintln!(
                "'{}' not found; using defaults",
                config_path.display()
            );
            SessionConfig::default()
        }
        Err(e) => {
            eprintln!(
                "Error in config file at '{}': {}",
                config_path.display(),
                e
            );
            EX_CONFIG.exit()
        }
    };

    init_logging(&root);

    let effective = match toml::to_string_pretty(&config) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Unable to format configuration: {}", e);
            EX_SOFTWARE.exit()
        }
    };

    if let Err(e) = SessionManager::new(config) {
        eprintln!("Unable to open the snapshot cache: {}", e);
        EX_CANTCREAT.exit();
    }

    info!("Configuration at '{}' is usable", config_path.display());
    print!("{}", effective);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_subcommand_has_help() {
        let mut help = Vec::new();
        Command::clap().write_help(&mut help).unwrap();
        let help = String::from_utf8(help).unwrap();
        assert!(help.contains("check-config"));
        assert!(help.contains("Load the session configuration"));
        assert!(help.contains("inspect-snapshot"));
        assert!(help.contains("Describe snapshot files"));
    }
}
