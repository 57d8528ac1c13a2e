//! Byte sources, sinks and the generic copy loop
//!
//! Transfers, exec capture and the shell poller all move data the same way:
//! a [`Source`] is drained into a [`Sink`] chunk by chunk with [`copy`]. The
//! session-bound adapters live in [`adapters`]; this module holds the traits
//! plus the local ones.

use std::io::{Read, Write};

use tracing::debug;

use crate::ssh::ProtocolError;

pub(crate) mod adapters;

/// Something bytes can be read from.
pub trait Source {
    fn open(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn close(&mut self) {}

    /// `Ok(0)` ends the copy.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;

    fn has_bytes_available(&self) -> bool;
}

/// Something bytes can be written to.
pub trait Sink {
    fn open(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError>;

    fn has_space_available(&self) -> bool;
}

/// Closes both ends when dropped, whatever path `copy` leaves by.
struct Bracket<'a> {
    source: &'a mut dyn Source,
    sink: &'a mut dyn Sink,
}

impl Drop for Bracket<'_> {
    fn drop(&mut self) {
        self.source.close();
        self.sink.close();
    }
}

/// Copy `source` into `sink` in chunks of at most `buffer_size` bytes.
///
/// `progress` receives the running total after each chunk; returning `false`
/// stops the copy and the total so far is returned as a success. A read or
/// write error is returned as is. Both ends are opened first and always
/// closed exactly once.
pub fn copy(
    source: &mut dyn Source,
    sink: &mut dyn Sink,
    buffer_size: usize,
    mut progress: impl FnMut(u64) -> bool,
) -> Result<u64, ProtocolError> {
    let bracket = Bracket { source, sink };
    bracket.source.open()?;
    bracket.sink.open()?;

    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;

    while bracket.source.has_bytes_available() {
        let read = bracket.source.read(&mut buf)?;
        if read == 0 {
            break;
        }

        let mut offset = 0;
        while offset < read && bracket.sink.has_space_available() {
            let written = bracket.sink.write(&buf[offset..read])?;
            if written == 0 {
                break;
            }
            offset += written;
        }
        total += offset as u64;

        if !progress(total) {
            debug!("Copy stopped by progress callback after {} bytes", total);
            return Ok(total);
        }
        if offset < read {
            break;
        }
    }

    Ok(total)
}

/// Hands every chunk to a callback; a `false` return refuses further data.
pub struct PipeSink<F> {
    forward: F,
    accepting: bool,
}

impl<F: FnMut(&[u8]) -> bool> PipeSink<F> {
    pub fn new(forward: F) -> Self {
        Self {
            forward,
            accepting: true,
        }
    }
}

impl<F: FnMut(&[u8]) -> bool> Sink for PipeSink<F> {
    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        self.accepting = (self.forward)(data);
        Ok(data.len())
    }

    fn has_space_available(&self) -> bool {
        self.accepting
    }
}

/// Any [`Read`] as a source.
pub struct ReaderSource<R> {
    reader: R,
    done: bool,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Source for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        loop {
            match self.reader.read(buf) {
                Ok(0) => {
                    self.done = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Err(ProtocolError::io(&e));
                }
            }
        }
    }

    fn has_bytes_available(&self) -> bool {
        !self.done
    }
}

/// Any [`Write`] as a sink; flushed on close.
pub struct WriterSink<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn close(&mut self) {
        if let Err(e) = self.writer.flush() {
            debug!("Flush on close failed: {}", e);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        self.writer.write(data).map_err(|e| {
            self.failed = true;
            ProtocolError::io(&e)
        })
    }

    fn has_space_available(&self) -> bool {
        !self.failed
    }
}
