//! Utilities for command handlers.

use std::io::{self, ErrorKind, Write};

/// A writer wrapper that silently handles broken pipe errors.
///
/// When the underlying writer returns EPIPE, this wrapper converts it to a
/// successful write, so `rwl apply -o yaml ... | head` exits cleanly when the
/// consumer closes early.
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct BrokenPipeWriter;

	impl Write for BrokenPipeWriter {
		fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
			Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
		}

		fn flush(&mut self) -> io::Result<()> {
			Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
		}
	}

	#[test]
	fn swallows_broken_pipe() {
		let mut guard = BrokenPipeGuard::new(BrokenPipeWriter);
		assert_eq!(guard.write(b"diff output").unwrap(), 11);
		guard.flush().unwrap();
	}
}
