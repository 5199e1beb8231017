/*
 * Hearthd - self-hosted cloud services for liberated smart thermostats
 * Copyright (c) 2024-2026  Hearthd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::str::FromStr;

use anyhow::Result;
use log::{info, LevelFilter, Log, Metadata, Record};
use systemd_journal_logger::{connected_to_journal, JournalLog};

use crate::VERSION;

pub const LOG_ENV: &str = "HEARTHD_LOG";

/// Dependency targets that drown out the daemon's own output when left at
/// the application level.
const NOISY_TARGETS: [&str; 4] = ["rumqttc", "hyper", "tower", "tracing"];

/// Installs the global logger. Under systemd the records go to the journal
/// with a VERSION field; on a terminal, env_logger formats them to stderr.
/// `HEARTHD_LOG` picks the level, `--debug` overrides it.
pub fn init(debug: bool) -> Result<()> {
    let app_level = if debug {
        LevelFilter::Debug
    } else {
        std::env::var(LOG_ENV)
            .ok()
            .and_then(|level| LevelFilter::from_str(&level).ok())
            .unwrap_or(LevelFilter::Info)
    };
    let sink: Box<dyn Log> = if connected_to_journal() {
        Box::new(
            JournalLog::new()?
                .with_extra_fields(vec![("VERSION", VERSION.unwrap_or("unknown"))]),
        )
    } else {
        Box::new(
            env_logger::Builder::new()
                .filter_level(app_level)
                .build(),
        )
    };
    log::set_boxed_logger(Box::new(DaemonLog {
        app_level,
        lib_level: library_level(app_level),
        sink,
    }))?;
    log::set_max_level(app_level);
    info!("Logging level: {app_level}");
    Ok(())
}

/// Dependencies stay one step quieter than the daemon itself.
fn library_level(app_level: LevelFilter) -> LevelFilter {
    match app_level {
        LevelFilter::Trace => LevelFilter::Debug,
        LevelFilter::Debug => LevelFilter::Info,
        _ => LevelFilter::Warn,
    }
}

fn is_noisy(target: &str) -> bool {
    NOISY_TARGETS.iter().any(|lib| target.starts_with(lib))
}

/// Routes records to the journal or terminal sink, holding dependency
/// targets to their own, quieter threshold.
struct DaemonLog {
    app_level: LevelFilter,
    lib_level: LevelFilter,
    sink: Box<dyn Log>,
}

impl Log for DaemonLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let threshold = if is_noisy(metadata.target()) {
            self.lib_level
        } else {
            self.app_level
        };
        metadata.level() <= threshold
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.sink.log(record);
        }
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libraries_log_one_step_quieter() {
        assert_eq!(library_level(LevelFilter::Trace), LevelFilter::Debug);
        assert_eq!(library_level(LevelFilter::Debug), LevelFilter::Info);
        assert_eq!(library_level(LevelFilter::Info), LevelFilter::Warn);
        assert_eq!(library_level(LevelFilter::Error), LevelFilter::Warn);
    }

    #[test]
    fn noisy_targets_match_by_module_prefix() {
        assert!(is_noisy("rumqttc"));
        assert!(is_noisy("rumqttc::state"));
        assert!(is_noisy("tower::buffer"));
        assert!(!is_noisy("hearthd::watchdog"));
    }
}
