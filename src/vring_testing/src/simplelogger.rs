/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::{Mutex, Once};
use std::thread::current;

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

/// Log records from targets outside this prefix are ignored.
const TARGET_PREFIX: &str = "vring";

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

pub struct SimpleLogger {}

impl SimpleLogger {
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    pub fn num_log_calls(&self) -> usize {
        LOGCALLS.lock().unwrap().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        LOGCALLS.lock().unwrap().get(idx).cloned()
    }

    pub fn clear_log_calls(&self) {
        LOGCALLS.lock().unwrap().clear();
    }

    /// Run `f` over the captured records, then clear them.
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        {
            let logcalls = LOGCALLS.lock().unwrap();
            f(&logcalls);
        }
        self.clear_log_calls();
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(TARGET_PREFIX) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut logcalls = LOGCALLS.lock().unwrap();
        logcalls.push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            line: record.line(),
            file: record.file().map(|file| file.to_string()),
            module_path: record
                .module_path()
                .map(|module_path| module_path.to_string()),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}
