//! Asynchronous channel to the audio host process.
//!
//! The daemon side ([`HostChannel`]) owns the shared memory region and a
//! background reader thread. The thread only blocks on the inbound
//! semaphore and raises `has_msgs`; actually consuming ring records happens
//! on the main thread inside the HMI `process()` step, so the serial port
//! and display cache stay single-threaded. The host side ([`HostClient`])
//! attaches to the same region from the other process.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use num_traits::ToPrimitive;

use crate::api::EventType;
use crate::audioproc::AudioProc;
use crate::ring::{EventRecord, ShmRegion};

/// Upper bound for one semaphore wait; doubles as the tick that lets dirty
/// audio-processor state reach the disk even on an idle link.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HostChannel {
    shm: Arc<ShmRegion>,
    running: Arc<AtomicBool>,
    has_msgs: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl HostChannel {
    /// Creates the shared region and spawns the reader thread.
    pub fn create(shm_name: &str, audioproc: Arc<AudioProc>) -> io::Result<HostChannel> {
        let shm = Arc::new(ShmRegion::create(shm_name)?);
        let running = Arc::new(AtomicBool::new(true));
        let has_msgs = Arc::new(AtomicBool::new(false));

        let reader = thread::Builder::new().name("sys-host".into()).spawn({
            let shm = Arc::clone(&shm);
            let running = Arc::clone(&running);
            let has_msgs = Arc::clone(&has_msgs);
            move || {
                while running.load(Ordering::Acquire) {
                    if shm.pair().to_server.wait_timeout(WAIT_TIMEOUT) {
                        has_msgs.store(true, Ordering::Release);
                    }
                    audioproc.flush_if_dirty();
                }
            }
        })?;

        Ok(HostChannel { shm, running, has_msgs, reader: Some(reader) })
    }

    /// True once per burst of host activity: consumes the `has_msgs` flag
    /// so the caller drains the ring exactly when something arrived.
    pub fn take_msgs(&self) -> bool {
        self.has_msgs
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pops one inbound record, if any.
    pub fn read_event(&self) -> Option<EventRecord> {
        self.shm.pair().to_server.read_record()
    }

    /// Posts one outbound event to the host.
    pub fn send_event(&self, event: EventType, page: u8, subpage: u8, msg: &[u8]) -> bool {
        let channel = &self.shm.pair().to_client;
        let byte = match event.to_u8() {
            Some(byte) => byte,
            None => return false,
        };
        if !channel.write_record(byte, page, subpage, msg) {
            log::warn!("host ring full, dropping {:?}", event);
            return false;
        }
        channel.post();
        true
    }
}

impl Drop for HostChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        // unblock the reader so it can observe the flag
        self.shm.pair().to_server.post();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// The audio host's side of the link, for the host process itself and for
/// tests standing in for it.
pub struct HostClient {
    shm: ShmRegion,
}

impl HostClient {
    pub fn open(shm_name: &str) -> io::Result<HostClient> {
        Ok(HostClient { shm: ShmRegion::open(shm_name)? })
    }

    pub fn send_event(&self, event: EventType, page: u8, subpage: u8, msg: &[u8]) -> bool {
        let channel = &self.shm.pair().to_server;
        let byte = match event.to_u8() {
            Some(byte) => byte,
            None => return false,
        };
        if !channel.write_record(byte, page, subpage, msg) {
            return false;
        }
        channel.post();
        true
    }

    pub fn wait_event(&self, timeout: Duration) -> bool {
        self.shm.pair().to_client.wait_timeout(timeout)
    }

    pub fn read_event(&self) -> Option<EventRecord> {
        self.shm.pair().to_client.read_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shm_name(tag: &str) -> String {
        format!("/sys_msgs_host_test_{}_{}", tag, std::process::id())
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn client_posts_raise_the_message_flag() {
        let name = shm_name("flag");
        let audioproc = Arc::new(AudioProc::new(PathBuf::from("/nonexistent/audioproc.txt")));
        let host = HostChannel::create(&name, audioproc).unwrap();
        let client = HostClient::open(&name).unwrap();

        assert!(!host.take_msgs());

        assert!(client.send_event(EventType::LedBlink, 1, 0, b"2 red"));
        assert!(wait_for(|| host.take_msgs()));

        let record = host.read_event().unwrap();
        assert_eq!(record.event, EventType::LedBlink.to_u8().unwrap());
        assert_eq!(record.page, 1);
        assert_eq!(record.msg, b"2 red");
        assert!(host.read_event().is_none());

        // the flag was consumed along with the drain
        assert!(!host.take_msgs());
    }

    #[test]
    fn outbound_events_reach_the_client() {
        let name = shm_name("outbound");
        let audioproc = Arc::new(AudioProc::new(PathBuf::from("/nonexistent/audioproc.txt")));
        let host = HostChannel::create(&name, audioproc).unwrap();
        let client = HostClient::open(&name).unwrap();

        assert!(host.send_event(EventType::CompressorMode, 0, 0, b"2"));
        assert!(client.wait_event(Duration::from_secs(1)));
        let record = client.read_event().unwrap();
        assert_eq!(record.event, EventType::CompressorMode.to_u8().unwrap());
        assert_eq!(record.msg, b"2");
    }

    #[test]
    fn teardown_joins_and_unlinks() {
        let name = shm_name("teardown");
        let audioproc = Arc::new(AudioProc::new(PathBuf::from("/nonexistent/audioproc.txt")));
        let host = HostChannel::create(&name, audioproc).unwrap();
        drop(host);

        // the region is gone, a second create with the same name succeeds
        let audioproc = Arc::new(AudioProc::new(PathBuf::from("/nonexistent/audioproc.txt")));
        let host = HostChannel::create(&name, audioproc).unwrap();
        drop(host);
    }
}
