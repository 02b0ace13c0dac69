//! Logging backend which writes to stderr (so output shows up in the launcher's console) and
//! optionally to a file.

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Which of our two binaries is logging. Used to tag console output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Launcher,
    Payload,
}

impl Component {
    fn tag(self) -> &'static str {
        match self {
            Component::Launcher => "\x1B[31mnecrolauncher.exe\x1B[0m",
            Component::Payload => "\x1B[33mnecrolua.dll\x1B[0m",
        }
    }
}

struct Message {
    module: String,
    level: Level,
    file: String,
    line: u32,
    string: String,
    time: String,
}

impl Message {
    fn from_record(record: &Record) -> Message {
        Message {
            module: record
                .module_path()
                .and_then(|path| path.split("::").last())
                .unwrap_or("unknown")
                .to_string(),
            level: record.level(),
            file: record.file().unwrap_or("?").to_string(),
            line: record.line().unwrap_or(0),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    fn level_name(&self) -> &'static str {
        match self.level {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        }
    }

    /// `[date time] [module] [level] Text`
    fn file_line(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}\n",
            self.time,
            self.module,
            self.level_name(),
            self.string
        )
    }

    /// `[component] file:line: Text`
    fn console_line(&self, component: Component) -> String {
        format!(
            "[{}] {}:{:3}: {}\n",
            component.tag(),
            self.file,
            self.line,
            self.string
        )
    }
}

pub struct Logger {
    component: Component,
    level: LevelFilter,
    file: Mutex<Option<File>>,
}

impl Logger {
    fn new(component: Component, level: LevelFilter, path: Option<&Path>) -> Logger {
        let file = path.and_then(|path| match File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("unable to create log file {}: {}", path.display(), err);
                None
            }
        });

        Logger {
            component,
            level,
            file: Mutex::new(file),
        }
    }

    // The payload logs from inside the loader lock, where a background writer thread would
    //  never get to run, so everything is written on the calling thread.
    pub fn commit(&self, record: &Record) {
        let message = Message::from_record(record);

        let _ = std::io::stderr().write_all(message.console_line(self.component).as_bytes());

        if let Ok(mut file) = self.file.lock() {
            if let Some(file) = file.as_mut() {
                let _ = file.write_all(message.file_line().as_bytes());
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();

        if let Ok(mut file) = self.file.lock() {
            if let Some(file) = file.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

static LOGGER: OnceCell<Logger> = OnceCell::new();
static PANIC_PATH: OnceCell<PathBuf> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned());

    let message = match message.as_ref() {
        Some(m) => m.as_str(),
        None => "no message",
    };

    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "unknown".to_string());

    let time = Local::now();
    let backtrace = crate::hook::generate_backtrace();

    let info_dump = format!(
        "NecroLua crashed.

Please include this file when reporting the problem.

Message: {message}
Location: {location}
Time: {time}
Backtrace: see below

{backtrace}"
    );

    log::error!("{info_dump}");
    flush();

    if let Some(path) = PANIC_PATH.get() {
        let _ = std::fs::write(path, info_dump);
    }

    std::process::abort();
}

fn install_panic_hook(log_path: Option<&Path>) {
    let panic_path = match log_path.and_then(Path::parent) {
        Some(dir) => dir.join("PANIC.txt"),
        None => PathBuf::from("PANIC.txt"),
    };

    let _ = PANIC_PATH.set(panic_path);

    // Print something useful before aborting, since unwinding into the game isn't an option.
    std::panic::set_hook(Box::new(panic_hook));
}

/// Installs the logger and panic hook. Subsequent calls do nothing.
pub fn init(component: Component, level: LevelFilter, log_path: Option<&Path>) {
    if LOGGER.get().is_some() {
        return;
    }

    let logger = LOGGER.get_or_init(|| Logger::new(component, level, log_path));

    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }

    install_panic_hook(log_path);
}

pub fn flush() {
    log::logger().flush();
}
