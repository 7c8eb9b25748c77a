// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Diagnostics reported while parsing formats and rendering records.
//!
//! Messages go through a [Logger] installed in the session, filtered by the session
//! [LogLevel]. The default logger forwards to the [log] facade, so any `log` backend such as
//! `env_logger` can be used by the application.

use core::fmt;
use std::sync::Arc;

/// Verbosity of the diagnostics emitted by a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    None,
    #[default]
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    All,
}

/// Sink of the diagnostics.
pub trait Logger: Send + Sync {
    fn warn(&self, args: fmt::Arguments<'_>);
    fn info(&self, args: fmt::Arguments<'_>);
}

/// [Logger] forwarding to the [log] crate macros.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    #[inline]
    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: "eventfmt", "{args}");
    }

    #[inline]
    fn info(&self, args: fmt::Arguments<'_>) {
        log::info!(target: "eventfmt", "{args}");
    }
}

/// [Logger] along with the level below which messages are dropped.
#[derive(Clone)]
pub struct Log {
    level: LogLevel,
    logger: Arc<dyn Logger>,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Log::new(Arc::new(DefaultLogger))
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Log").field("level", &self.level).finish_non_exhaustive()
    }
}

impl Log {
    #[inline]
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Log {
            level: LogLevel::default(),
            logger,
        }
    }

    #[inline]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    #[inline]
    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Restore the default level.
    #[inline]
    pub fn reset_level(&mut self) {
        self.level = LogLevel::default();
    }

    #[inline]
    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.logger = logger;
    }

    #[inline]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.level >= LogLevel::Warning {
            self.logger.warn(args)
        }
    }

    #[inline]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.level >= LogLevel::Info {
            self.logger.info(args)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// [Logger] keeping all the messages it receives.
    #[derive(Default)]
    pub struct RecordingLogger {
        pub messages: Mutex<Vec<String>>,
    }

    impl RecordingLogger {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Logger for RecordingLogger {
        fn warn(&self, args: fmt::Arguments<'_>) {
            self.messages.lock().unwrap().push(format!("warning: {args}"));
        }

        fn info(&self, args: fmt::Arguments<'_>) {
            self.messages.lock().unwrap().push(format!("info: {args}"));
        }
    }

    #[test]
    fn level_test() {
        let logger = Arc::new(RecordingLogger::default());
        let mut log = Log::new(logger.clone());

        assert_eq!(log.level(), LogLevel::Critical);
        log.warn(format_args!("dropped"));
        assert!(logger.messages().is_empty());

        log.set_level(LogLevel::Warning);
        log.warn(format_args!("kept {}", 1));
        log.info(format_args!("dropped"));
        assert_eq!(logger.messages(), vec!["warning: kept 1".to_string()]);

        log.set_level(LogLevel::All);
        log.info(format_args!("kept {}", 2));
        assert_eq!(logger.messages().len(), 2);

        log.reset_level();
        assert_eq!(log.level(), LogLevel::Critical);
    }
}
