//! Length-prefixed framing over the serial link.
//!
//! Incoming frames look like `CMD SS PAYLOAD\0` where `CMD` is a 7-byte
//! command, `SS` two lowercase hex digits with the payload size and the
//! whole frame ends in a single NUL. The decoder is deliberately paranoid:
//! the HMI side resets asynchronously and the line picks up garbage, so
//! every failure is classified as either "nothing useful arrived" or
//! "bytes arrived mid-frame, realign at the next NUL".

use std::time::Duration;

use crate::api::*;
use crate::port::SerialIo;

/// Main blocking-read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Cheap supplementary timeout used when a frame appears cut off.
fn retry_timeout() -> Duration {
    Duration::from_millis((READ_TIMEOUT.as_millis() as u64 / 10).max(1))
}

/// Outcome of one framed read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A full frame of this many bytes (NUL excluded) is in the buffer.
    Msg(usize),
    /// Nothing to read, or only idle NUL padding.
    NoData,
    /// Bytes arrived but do not form a frame; realign with [`drain_until_nul`].
    Invalid,
    /// Hard I/O error, the port is gone.
    Io,
}

/// Outcome of a realignment scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A NUL was consumed; the next read starts at a frame boundary.
    Realigned,
    /// The line went quiet before any NUL showed up.
    NoData,
    /// Hard I/O error.
    Io,
}

/// Reads one frame into `buf`, tolerating partial delivery and stream
/// desync. On `Msg(n)` the frame occupies `buf[..n]` and the trailing NUL
/// has been consumed.
pub fn read_msg(port: &mut dyn SerialIo, buf: &mut [u8; BUFFER_SIZE]) -> ReadOutcome {
    // command plus its delimiter (or terminating NUL)
    let mut got = match port.read_until_timeout(&mut buf[..CMD_LENGTH + 1], READ_TIMEOUT) {
        Ok(n) => n,
        Err(e) => {
            log::error!("serial read failed: {}", e);
            return ReadOutcome::Io;
        }
    };

    // shift by one byte if the stream still carries the previous frame's NUL
    if got > 1 && buf[0] == 0 && buf[1] != 0 {
        buf.copy_within(1..got, 0);
        got -= 1;
    }

    if got == 0 {
        return ReadOutcome::NoData;
    }

    // all zeros is idle padding, treat as if nothing arrived
    if buf[..got].iter().all(|&b| b == 0) {
        return ReadOutcome::NoData;
    }

    if got < CMD_LENGTH + 1 {
        // the beginning of a valid command may have been cut off, give the
        // sender one short chance to complete it
        let mut completed = false;
        if got >= CMD_PREFIX.len() && &buf[..CMD_PREFIX.len()] == CMD_PREFIX.as_bytes() {
            match port.read_until_timeout(&mut buf[got..CMD_LENGTH + 1], retry_timeout()) {
                Ok(n) => completed = got + n == CMD_LENGTH + 1,
                Err(e) => {
                    log::error!("serial read failed: {}", e);
                    return ReadOutcome::Io;
                }
            }
        }

        if !completed {
            log::debug!(
                "reading command timed out, got {} bytes: {:?}",
                got,
                String::from_utf8_lossy(&buf[..got])
            );
            return ReadOutcome::Invalid;
        }
    }

    if &buf[..CMD_PREFIX.len()] != CMD_PREFIX.as_bytes() {
        log::debug!(
            "invalid command received: {:?}",
            String::from_utf8_lossy(&buf[..CMD_LENGTH])
        );
        return ReadOutcome::Invalid;
    }

    // message only carries the command, we can stop here
    if buf[CMD_LENGTH] == 0 {
        return ReadOutcome::Msg(CMD_LENGTH);
    }

    if buf[CMD_LENGTH] != b' ' {
        log::debug!("command is missing its space delimiter");
        return ReadOutcome::Invalid;
    }

    // fetch the payload size field, `HH `
    let off = CMD_LENGTH + 1;
    let n = match port.read_until_timeout(&mut buf[off..off + DATA_SIZE_LENGTH + 1], READ_TIMEOUT) {
        Ok(n) => n,
        Err(e) => {
            log::error!("serial read failed: {}", e);
            return ReadOutcome::Io;
        }
    };
    if n < DATA_SIZE_LENGTH + 1 {
        log::debug!("reading payload size timed out, got {} of 3 bytes", n);
        // a NUL in the tail means the sender gave up on the frame itself
        return if n > 0 && buf[off + n - 1] == 0 {
            ReadOutcome::NoData
        } else {
            ReadOutcome::Invalid
        };
    }

    let data_size = std::str::from_utf8(&buf[off..off + DATA_SIZE_LENGTH])
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .unwrap_or(0);

    if data_size == 0 || data_size > MAX_DATA_SIZE {
        log::debug!(
            "incorrect payload size {:?}",
            String::from_utf8_lossy(&buf[off..off + DATA_SIZE_LENGTH])
        );
        return if buf[off + DATA_SIZE_LENGTH] == 0 {
            ReadOutcome::NoData
        } else {
            ReadOutcome::Invalid
        };
    }

    // payload plus terminating NUL
    let off = HEADER_LENGTH;
    let want = data_size + 1;
    let mut n = match port.read_until_timeout(&mut buf[off..off + want], READ_TIMEOUT) {
        Ok(n) => n,
        Err(e) => {
            log::error!("serial read failed: {}", e);
            return ReadOutcome::Io;
        }
    };
    if n < want && n > 0 {
        // a few bytes arrived, the rest may just be late
        match port.read_until_timeout(&mut buf[off + n..off + want], retry_timeout()) {
            Ok(n2) => n += n2,
            Err(e) => {
                log::error!("serial read failed: {}", e);
                return ReadOutcome::Io;
            }
        }
    }
    if n < want {
        log::debug!("reading payload timed out, got {} of {} bytes", n, want);
        return if n > 0 && buf[off + n - 1] == 0 {
            ReadOutcome::NoData
        } else {
            ReadOutcome::Invalid
        };
    }

    let total = HEADER_LENGTH + data_size;
    if buf[total] != 0 {
        log::debug!("full message is not null terminated");
        return ReadOutcome::Invalid;
    }

    ReadOutcome::Msg(total)
}

/// Consumes bytes one at a time until the next NUL, realigning the stream
/// after an invalid frame.
pub fn drain_until_nul(port: &mut dyn SerialIo) -> DrainOutcome {
    let timeout = Duration::from_millis((READ_TIMEOUT.as_millis() as u64 / 2).max(1));
    let mut byte = [0u8; 1];

    loop {
        match port.read_until_timeout(&mut byte, timeout) {
            Ok(0) => return DrainOutcome::NoData,
            Ok(_) => {
                if byte[0] == 0 {
                    return DrainOutcome::Realigned;
                }
            }
            Err(e) => {
                log::error!("serial drain failed: {}", e);
                return DrainOutcome::Io;
            }
        }
    }
}

/// Builds an outgoing frame (without its trailing NUL, which
/// [`write_or_close`] appends).
///
/// With `quoted` the payload must carry an actuator prefix, `N REST`; the
/// remainder is wrapped in double quotes and the size field accounts for
/// the two added bytes. A payload that does not match the form, or that
/// does not fit the carrier, is refused.
pub fn encode_msg(cmd: &str, payload: &[u8], quoted: bool) -> Option<Vec<u8>> {
    debug_assert_eq!(cmd.len(), CMD_LENGTH);

    if payload.is_empty() {
        return Some(cmd.as_bytes().to_vec());
    }

    let mut body = Vec::with_capacity(payload.len() + 2);
    if quoted {
        let space = payload.iter().position(|&b| b == b' ')?;
        if space == 0 || !payload[..space].iter().all(u8::is_ascii_digit) {
            return None;
        }
        body.extend_from_slice(&payload[..space + 1]);
        body.push(b'"');
        body.extend_from_slice(&payload[space + 1..]);
        body.push(b'"');
    } else {
        body.extend_from_slice(payload);
    }

    if body.len() > MAX_DATA_SIZE {
        return None;
    }

    let mut frame = Vec::with_capacity(HEADER_LENGTH + body.len());
    frame.extend_from_slice(cmd.as_bytes());
    frame.extend_from_slice(format!(" {:02x} ", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    Some(frame)
}

/// Writes `msg` plus its terminating NUL. Returns `false` only when the
/// port reported `EIO`, meaning the device is gone; the port is closed and
/// the caller must stop using it. Other write errors are treated as
/// transient.
pub fn write_or_close(port: &mut dyn SerialIo, msg: &[u8]) -> bool {
    let mut framed = Vec::with_capacity(msg.len() + 1);
    framed.extend_from_slice(msg);
    framed.push(0);

    match port.write_now(&framed) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EIO) => {
            log::error!("serial write failed with EIO, closing port");
            port.close();
            false
        }
        Err(e) => {
            log::warn!("serial write failed: {}", e);
            true
        }
    }
}

/// Reads one `r …` reply, for tests exercising the daemon from the HMI
/// side. Not used by the daemon itself.
pub fn read_response(port: &mut dyn SerialIo) -> Option<String> {
    let mut byte = [0u8; 1];

    if port.read_until_timeout(&mut byte, READ_TIMEOUT).ok()? != 1 || byte[0] != b'r' {
        return None;
    }

    let mut resp = vec![b'r'];
    let mut two = [0u8; 2];
    if port.read_until_timeout(&mut two, READ_TIMEOUT).ok()? != 2 || two[0] != b' ' {
        return None;
    }
    resp.extend_from_slice(&two);

    // negative code: exactly one digit plus the NUL follows
    if two[1] == b'-' {
        if port.read_until_timeout(&mut two, READ_TIMEOUT).ok()? != 2 || two[1] != 0 {
            return None;
        }
        resp.push(two[0]);
        return String::from_utf8(resp).ok();
    }

    loop {
        if port.read_until_timeout(&mut byte, READ_TIMEOUT).ok()? != 1 {
            return None;
        }
        if byte[0] == 0 {
            return String::from_utf8(resp).ok();
        }
        resp.push(byte[0]);
    }
}
