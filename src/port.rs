//! Serial port access. The daemon talks to the HMI through the [`SerialIo`]
//! trait; the real backend wraps a TTY, while [`FakePort`] provides an
//! in-memory pair for tests.

use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Byte-oriented full-duplex port with timeout-bounded reads.
pub trait SerialIo {
    /// Reads up to `buf.len()` bytes, waiting at most `timeout` for more.
    /// Returns the number of bytes placed in `buf`; 0 means the timeout
    /// expired with nothing available.
    fn read_until_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Queues bytes for transmission without blocking on the peer.
    fn write_now(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Releases the underlying device. Further operations fail.
    fn close(&mut self);
}

// ------------------------------------------------------------------------
// TTY backend

pub struct TtyPort {
    inner: Option<Box<dyn serialport::SerialPort>>,
}

impl TtyPort {
    /// Opens `device` at `baud_rate`, resolving symlinks first (the device
    /// node is commonly a udev-provided link). Flow control is disabled and
    /// the line is set to 8N1, matching what the HMI firmware expects.
    pub fn open(device: &str, baud_rate: u32) -> io::Result<TtyPort> {
        let resolved = std::fs::canonicalize(device)?;

        let settings = serialport::SerialPortSettings {
            baud_rate,
            data_bits: serialport::DataBits::Eight,
            flow_control: serialport::FlowControl::None,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            timeout: Duration::from_millis(20),
        };

        let port = serialport::open_with_settings(&resolved, &settings)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{}", e)))?;

        log::info!("serial port {} open at {} baud", resolved.display(), baud_rate);
        Ok(TtyPort { inner: Some(port) })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl SerialIo for TtyPort {
    fn read_until_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut got = 0;

        while got < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            port.set_timeout(remaining.max(Duration::from_millis(1)))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{}", e)))?;

            match port.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        Ok(got)
    }

    fn write_now(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port()?.write_all(bytes)
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

// ------------------------------------------------------------------------
// fake backend for tests

/// One direction of the fake link: the byte queue a port reads from.
struct FakeCell {
    queue: VecDeque<u8>,
    open: bool,
}

/// Registry holding both cells of a fake pair. Each [`FakePort`] keeps an
/// index into this registry instead of a reference to its peer, so the two
/// sides do not form a reference cycle.
pub struct FakeRegistry {
    cells: [Mutex<FakeCell>; 2],
}

pub struct FakePort {
    registry: Arc<FakeRegistry>,
    handle: usize,
}

/// Creates a connected pair of fake ports. Bytes written on one side become
/// readable on the other; reads never block.
pub fn fake_pair() -> (FakePort, FakePort) {
    let registry = Arc::new(FakeRegistry {
        cells: [
            Mutex::new(FakeCell { queue: VecDeque::new(), open: true }),
            Mutex::new(FakeCell { queue: VecDeque::new(), open: true }),
        ],
    });
    (
        FakePort { registry: Arc::clone(&registry), handle: 0 },
        FakePort { registry, handle: 1 },
    )
}

impl SerialIo for FakePort {
    fn read_until_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut cell = self.registry.cells[self.handle].lock().unwrap();
        if !cell.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "fake port closed"));
        }
        let mut got = 0;
        while got < buf.len() {
            match cell.queue.pop_front() {
                Some(b) => {
                    buf[got] = b;
                    got += 1;
                }
                None => break,
            }
        }
        Ok(got)
    }

    fn write_now(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut peer = self.registry.cells[1 - self.handle].lock().unwrap();
        if !peer.open {
            // the other side hung up; surface it the way a dead TTY does
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        peer.queue.extend(bytes.iter().copied());
        Ok(())
    }

    fn close(&mut self) {
        self.registry.cells[self.handle].lock().unwrap().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_pair_is_cross_wired() {
        let (mut a, mut b) = fake_pair();
        a.write_now(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = b.read_until_timeout(&mut buf, Duration::from_millis(1)).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // nothing echoes back to the writer
        let n = a.read_until_timeout(&mut buf, Duration::from_millis(1)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn write_to_closed_peer_reports_eio() {
        let (mut a, mut b) = fake_pair();
        b.close();
        let err = a.write_now(b"x").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }
}
