//! Diagnostic output on standard error
//!
//! Lines are rendered into a fixed buffer before they are written, so
//! logging never allocates. That matters here: the initializer runs before
//! any other constructor and the cleanup protocol runs in the middle of
//! thread teardown.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

/// Standard error file descriptor
const STDERR: libc::c_int = 2;

/// Longest line written in one piece
const LINE_CAPACITY: usize = 256;

/// Marker appended to lines that did not fit
const TRUNCATED: &str = "...\n";

/// How much the runtime talks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    /// Fatal errors only
    Quiet = 0,
    /// Initialization summary
    Notice = 1,
    /// Every allocation, spawn and release
    Trace = 2,
}

impl Verbosity {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Verbosity::Quiet,
            1 => Verbosity::Notice,
            _ => Verbosity::Trace,
        }
    }
}

static VERBOSITY: AtomicU8 = AtomicU8::new(Verbosity::Quiet as u8);

pub fn set_verbosity(level: Verbosity) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

pub fn verbosity() -> Verbosity {
    Verbosity::from_u8(VERBOSITY.load(Ordering::Relaxed))
}

/// Check whether messages at `level` should be written
#[inline(always)]
pub fn enabled(level: Verbosity) -> bool {
    verbosity() >= level
}

/// Raw writer over a file descriptor
pub struct FdWriter {
    fd: libc::c_int,
}

impl FdWriter {
    const fn new(fd: libc::c_int) -> Self {
        Self { fd }
    }

    /// Write every byte, retrying on `EINTR`. Other errors drop the rest of
    /// the line; there is nowhere left to report them.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let written = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
            if written < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return;
            }
            bytes = &bytes[written as usize..];
        }
    }
}

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Global stderr writer
static STDERR_WRITER: Mutex<FdWriter> = Mutex::new(FdWriter::new(STDERR));

/// Fixed line that keeps whatever prefix fits
struct LineBuffer {
    line: heapless::String<LINE_CAPACITY>,
    truncated: bool,
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.line.len();
        if s.len() <= room {
            let _ = self.line.push_str(s);
            return Ok(());
        }

        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let _ = self.line.push_str(&s[..cut]);
        self.truncated = true;
        Err(fmt::Error)
    }
}

/// Render a message into a fixed-size line, marking truncation
pub fn render(args: fmt::Arguments) -> heapless::String<LINE_CAPACITY> {
    let mut buffer = LineBuffer {
        line: heapless::String::new(),
        truncated: false,
    };
    if fmt::write(&mut buffer, args).is_err() || buffer.truncated {
        let line = &mut buffer.line;
        while line.len() > LINE_CAPACITY - TRUNCATED.len() {
            line.pop();
        }
        let _ = line.push_str(TRUNCATED);
    }
    buffer.line
}

/// Macro for runtime output (like print!)
#[macro_export]
macro_rules! ward_print {
    ($($arg:tt)*) => {
        $crate::chronicle::_print(format_args!($($arg)*))
    };
}

/// Macro for runtime output with prefix and newline (like println!)
#[macro_export]
macro_rules! ward_println {
    () => ($crate::ward_print!("\n"));
    ($($arg:tt)*) => ($crate::ward_print!("[twin_stacks] {}\n", format_args!($($arg)*)));
}

/// Written when `TWIN_STACKS_LOG` is `notice` or louder
#[macro_export]
macro_rules! ward_notice {
    ($($arg:tt)*) => {
        if $crate::chronicle::enabled($crate::chronicle::Verbosity::Notice) {
            $crate::ward_println!($($arg)*);
        }
    };
}

/// Written when `TWIN_STACKS_LOG` is `trace`
#[macro_export]
macro_rules! ward_trace {
    ($($arg:tt)*) => {
        if $crate::chronicle::enabled($crate::chronicle::Verbosity::Trace) {
            $crate::ward_println!($($arg)*);
        }
    };
}

/// Integrity check: abort with file and line when `cond` is false
#[macro_export]
macro_rules! ward_check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::chronicle::fatal(format_args!(
                "{}:{}: check `{}` failed: {}",
                file!(),
                line!(),
                stringify!($cond),
                format_args!($($arg)+)
            ));
        }
    };
}

/// Internal print function for macros
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let line = render(args);
    STDERR_WRITER.lock().write_bytes(line.as_bytes());
}

/// Report an unrecoverable condition and abort the process.
///
/// Does not take the writer lock: the failing thread may already hold it.
#[cold]
pub fn fatal(args: fmt::Arguments) -> ! {
    let line = render(format_args!("[twin_stacks] FATAL: {}\n", args));
    FdWriter::new(STDERR).write_bytes(line.as_bytes());
    unsafe { libc::abort() }
}
