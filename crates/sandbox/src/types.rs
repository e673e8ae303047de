use std::sync::{Mutex, PoisonError};

pub struct ExecRequest<'a> {
    pub code: &'a str,
}

pub struct ProcessExit {
    pub exit_code: i64,
}

/// Point-in-time resource usage of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    /// `None` until a baseline reading exists in the current window.
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Collects process output while it is produced.
///
/// Owned by the caller of [`Sandbox::exec`](crate::Sandbox::exec), so
/// everything written before the exec future is dropped stays readable.
/// Each stream is capped at `limit` bytes; excess is discarded.
pub struct OutputCapture {
    limit: usize,
    inner: Mutex<Captured>,
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Captured::default()),
        }
    }

    pub fn push(&self, stream: OutputStream, chunk: &[u8]) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let captured = &mut *guard;
        let buf = match stream {
            OutputStream::Stdout => &mut captured.stdout,
            OutputStream::Stderr => &mut captured.stderr,
        };
        let room = self.limit.saturating_sub(buf.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        buf.extend(chunk.iter().take(room));
    }

    pub fn stdout(&self) -> String {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&guard.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&guard.stderr).into_owned()
    }

    pub fn truncated(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_streams_apart() {
        let capture = OutputCapture::new(1024);
        capture.push(OutputStream::Stdout, b"hello ");
        capture.push(OutputStream::Stderr, b"oops");
        capture.push(OutputStream::Stdout, b"world");
        assert_eq!(capture.stdout(), "hello world");
        assert_eq!(capture.stderr(), "oops");
        assert!(!capture.truncated());
    }

    #[test]
    fn capture_truncates_at_limit() {
        let capture = OutputCapture::new(4);
        capture.push(OutputStream::Stdout, b"abc");
        capture.push(OutputStream::Stdout, b"defg");
        assert_eq!(capture.stdout(), "abcd");
        assert!(capture.truncated());
        // The limit is per stream.
        capture.push(OutputStream::Stderr, b"xy");
        assert_eq!(capture.stderr(), "xy");
    }
}
