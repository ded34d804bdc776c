//! The daemon proper: one value owning the serial port and the three
//! long-lived subsystems, plus the read/dispatch/process main loop.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::BUFFER_SIZE;
use crate::audioproc::AudioProc;
use crate::dispatch;
use crate::exec::Runner;
use crate::framing::{self, DrainOutcome, ReadOutcome};
use crate::hmi::HmiState;
use crate::host::HostChannel;
use crate::mixer::MixerCoalescer;
use crate::port::SerialIo;

/// Filesystem surface touched by the dispatcher. Bundled so tests can point
/// everything at a scratch directory.
pub struct Paths {
    /// directory holding the flag files
    pub data_dir: PathBuf,
    /// device serial tag, maintained by the factory image
    pub tag: PathBuf,
    /// audio processor state file
    pub audioproc: PathBuf,
}

impl Default for Paths {
    fn default() -> Paths {
        Paths {
            data_dir: PathBuf::from("/data"),
            tag: PathBuf::from("/var/cache/mod/tag"),
            audioproc: PathBuf::from("/data/audioproc.txt"),
        }
    }
}

// Field order is teardown order: the mixer worker quits first, then the
// host channel (join, unmap, unlink), and the serial port closes last.
pub struct Daemon {
    pub(crate) hmi: HmiState,
    pub(crate) mixer: MixerCoalescer,
    pub(crate) host: HostChannel,
    pub(crate) audioproc: Arc<AudioProc>,
    pub(crate) runner: Arc<dyn Runner>,
    pub(crate) paths: Paths,
    pub(crate) port: Box<dyn SerialIo>,
}

impl Daemon {
    pub fn new(
        port: Box<dyn SerialIo>,
        paths: Paths,
        runner: Arc<dyn Runner>,
        shm_name: &str,
    ) -> io::Result<Daemon> {
        let audioproc = Arc::new(AudioProc::new(paths.audioproc.clone()));
        audioproc.load();

        let host = HostChannel::create(shm_name, Arc::clone(&audioproc))?;
        let mixer = MixerCoalescer::new(Arc::clone(&runner));

        Ok(Daemon { hmi: HmiState::new(), mixer, host, audioproc, runner, paths, port })
    }

    pub fn hmi_mut(&mut self) -> &mut HmiState {
        &mut self.hmi
    }

    /// One main-loop cycle: read a frame with a short timeout, dispatch it,
    /// and run the periodic HMI/host processing. Returns `false` when the
    /// loop must stop (port gone or a reboot request).
    pub fn iterate(&mut self) -> bool {
        let mut buf = [0u8; BUFFER_SIZE];

        match framing::read_msg(&mut *self.port, &mut buf) {
            ReadOutcome::NoData => self.process(),
            ReadOutcome::Invalid => framing::drain_until_nul(&mut *self.port) != DrainOutcome::Io,
            ReadOutcome::Io => false,
            ReadOutcome::Msg(len) => {
                if !dispatch::handle_message(self, &buf[..len]) {
                    return false;
                }
                self.process()
            }
        }
    }

    fn process(&mut self) -> bool {
        self.hmi.process(&mut *self.port, &self.host, &self.audioproc)
    }

    /// Runs until `term` is raised or the port dies.
    pub fn run(&mut self, term: &AtomicBool) {
        while !term.load(Ordering::Relaxed) {
            if !self.iterate() {
                break;
            }
        }
    }
}
