//! # Ring-buffer log sink
//!
//! A fixed-capacity byte ring behind a spinlock, installed as the `log`
//! facade's sink. Oldest bytes are overwritten when the ring is full; the
//! buffer can be read back for a kernel log consumer.

use alloc::collections::VecDeque;
use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::{Mutex, Once};

pub static LOG: Mutex<Option<Log>> = Mutex::new(None);

pub struct Log {
    data: VecDeque<u8>,
    size: usize,
}

impl Log {
    pub fn new(size: usize) -> Log {
        Log {
            data: VecDeque::with_capacity(size),
            size,
        }
    }

    pub fn write(&mut self, buf: &[u8]) {
        for &b in buf {
            while self.data.len() + 1 > self.size {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }

    pub fn read(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }
}

struct RingWriter<'a>(&'a mut Log);

impl fmt::Write for RingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write(s.as_bytes());
        Ok(())
    }
}

struct RingLogger;

impl log::Log for RingLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut log = LOG.lock();
        if let Some(log) = log.as_mut() {
            let _ = writeln!(
                RingWriter(log),
                "{:>5}: {}",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger;
static INIT: Once<()> = Once::new();

/// Installs the ring sink, once per process. Another already-installed
/// logger (a test harness, say) is left in place.
pub fn init() {
    INIT.call_once(|| {
        *LOG.lock() = Some(Log::new(1024 * 1024));
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_discards_the_oldest_bytes() {
        let mut log = Log::new(8);
        log.write(b"0123456789");
        let (a, b) = log.read();
        let mut joined = alloc::vec::Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        assert_eq!(&joined, b"23456789");
    }

    #[test]
    fn records_end_up_in_the_ring() {
        init();
        log::warn!("klog smoke marker");

        let log = LOG.lock();
        let (a, b) = log.as_ref().expect("initialized above").read();
        let mut joined = alloc::vec::Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        let text = core::str::from_utf8(&joined).unwrap();
        assert!(text.contains("klog smoke marker"));
    }
}
