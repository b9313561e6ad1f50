//! Levelled log sink with stderr and syslog mirrors.
//!
//! The sink is installed once by the entry point and handed to the pieces
//! that need to toggle it (the config layer flips the mirrors when
//! `log_stdout` / `log_syslog` are set). Log lines never go to stdout; the
//! console mirror writes to stderr so normal operation leaves stdout clean.

use std::ffi::CString;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use libc::c_char;
use log::Level;
use log::LevelFilter;
use log::Metadata;
use log::Record;
use parking_lot::Mutex;

pub struct Logger {
    to_stderr: AtomicBool,
    to_syslog: AtomicBool,
    // openlog(3) keeps the ident pointer, so the CString must stay alive
    // while the syslog mirror is enabled.
    ident: Mutex<Option<CString>>,
}

impl Logger {
    /// Installs the sink as the global logger and returns a handle for
    /// toggling the mirrors. Defaults: stderr on, syslog off, INFO level.
    pub fn init() -> &'static Logger {
        let logger: &'static Logger = Box::leak(Box::new(Logger {
            to_stderr: AtomicBool::new(true),
            to_syslog: AtomicBool::new(false),
            ident: Mutex::new(None),
        }));
        let _ = log::set_logger(logger);
        log::set_max_level(LevelFilter::Info);
        logger
    }

    pub fn log_to_stderr(&self, enable: bool) {
        self.to_stderr.store(enable, Ordering::Relaxed);
    }

    /// Enables the syslog mirror under `ident`, or disables it with `None`.
    pub fn log_to_syslog(&self, ident: Option<&str>) {
        let mut held = self.ident.lock();
        match ident {
            Some(name) => {
                let Ok(name) = CString::new(name) else {
                    return;
                };
                unsafe {
                    libc::openlog(name.as_ptr(), libc::LOG_PID | libc::LOG_NDELAY, libc::LOG_USER);
                }
                *held = Some(name);
                self.to_syslog.store(true, Ordering::Relaxed);
            }
            None => {
                if held.take().is_some() {
                    unsafe { libc::closelog() };
                }
                self.to_syslog.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Closes the syslog mirror. Part of the teardown owned by the entry
    /// point.
    pub fn shutdown(&self) {
        self.log_to_syslog(None);
    }
}

fn severity_char(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug | Level::Trace => 'D',
    }
}

fn syslog_severity(level: Level) -> libc::c_int {
    match level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

fn wall_clock() -> (u32, u32, u32) {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&now, &mut tm) };
    (tm.tm_hour as u32, tm.tm_min as u32, tm.tm_sec as u32)
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        self.to_stderr.load(Ordering::Relaxed) || self.to_syslog.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();

        if self.to_stderr.load(Ordering::Relaxed) {
            let (hour, minute, second) = wall_clock();
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "[{hour:02}:{minute:02}:{second:02}] {} [{}] {message}",
                severity_char(record.level()),
                record.target(),
            );
        }

        if self.to_syslog.load(Ordering::Relaxed) {
            // Hold the ident lock so closelog() cannot race the write.
            let held = self.ident.lock();
            if held.is_some() {
                if let Ok(text) = CString::new(message) {
                    unsafe {
                        libc::syslog(
                            syslog_severity(record.level()),
                            c"%s".as_ptr() as *const c_char,
                            text.as_ptr(),
                        );
                    }
                }
            }
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_chars() {
        assert_eq!(severity_char(Level::Error), 'E');
        assert_eq!(severity_char(Level::Warn), 'W');
        assert_eq!(severity_char(Level::Info), 'I');
        assert_eq!(severity_char(Level::Debug), 'D');
    }

    #[test]
    fn syslog_severities() {
        assert_eq!(syslog_severity(Level::Error), libc::LOG_ERR);
        assert_eq!(syslog_severity(Level::Info), libc::LOG_INFO);
    }
}
