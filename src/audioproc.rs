//! Persistent audio-processor state: compressor, noise gate and pedalboard
//! gain settings, mirrored to `/data/audioproc.txt` and to the audio host.
//!
//! The values are shared between the main thread (setters, getters) and the
//! host reader thread (opportunistic disk flush), so each one lives in a
//! machine-word atomic; floats travel as their bit patterns. No lock: the
//! worst case is one extra flush.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::api::{EventType, DEFAULT_COMPRESSOR_MODE};
use crate::host::HostChannel;

pub const COMPRESSOR_MODE_RANGE: (i32, i32) = (0, 4);
pub const COMPRESSOR_RELEASE_RANGE: (f32, f32) = (50.0, 500.0);
pub const PEDALBOARD_GAIN_RANGE: (f32, f32) = (-30.0, 20.0);
pub const NOISEGATE_CHANNEL_RANGE: (i32, i32) = (0, 3);
pub const NOISEGATE_DECAY_RANGE: (f32, f32) = (1.0, 500.0);
pub const NOISEGATE_THRESHOLD_RANGE: (f32, f32) = (-70.0, -10.0);

pub const DEFAULT_COMPRESSOR_RELEASE: f32 = 100.0;
pub const DEFAULT_PEDALBOARD_GAIN: f32 = 0.0;
pub const DEFAULT_NOISEGATE_CHANNEL: i32 = 0;
pub const DEFAULT_NOISEGATE_DECAY: f32 = 10.0;
pub const DEFAULT_NOISEGATE_THRESHOLD: f32 = -60.0;

pub struct AudioProc {
    compressor_mode: AtomicI32,
    compressor_release: AtomicU32,
    pedalboard_gain: AtomicU32,
    noisegate_channel: AtomicI32,
    noisegate_decay: AtomicU32,
    noisegate_threshold: AtomicU32,
    dirty: AtomicBool,
    path: PathBuf,
}

fn in_range_f(value: f32, range: (f32, f32)) -> bool {
    value >= range.0 && value <= range.1
}

fn in_range_i(value: i32, range: (i32, i32)) -> bool {
    value >= range.0 && value <= range.1
}

impl AudioProc {
    pub fn new(path: PathBuf) -> AudioProc {
        AudioProc {
            compressor_mode: AtomicI32::new(DEFAULT_COMPRESSOR_MODE),
            compressor_release: AtomicU32::new(DEFAULT_COMPRESSOR_RELEASE.to_bits()),
            pedalboard_gain: AtomicU32::new(DEFAULT_PEDALBOARD_GAIN.to_bits()),
            noisegate_channel: AtomicI32::new(DEFAULT_NOISEGATE_CHANNEL),
            noisegate_decay: AtomicU32::new(DEFAULT_NOISEGATE_DECAY.to_bits()),
            noisegate_threshold: AtomicU32::new(DEFAULT_NOISEGATE_THRESHOLD.to_bits()),
            dirty: AtomicBool::new(false),
            path,
        }
    }

    fn reset_defaults(&self) {
        self.compressor_mode.store(DEFAULT_COMPRESSOR_MODE, Ordering::Relaxed);
        self.compressor_release
            .store(DEFAULT_COMPRESSOR_RELEASE.to_bits(), Ordering::Relaxed);
        self.pedalboard_gain
            .store(DEFAULT_PEDALBOARD_GAIN.to_bits(), Ordering::Relaxed);
        self.noisegate_channel.store(DEFAULT_NOISEGATE_CHANNEL, Ordering::Relaxed);
        self.noisegate_decay
            .store(DEFAULT_NOISEGATE_DECAY.to_bits(), Ordering::Relaxed);
        self.noisegate_threshold
            .store(DEFAULT_NOISEGATE_THRESHOLD.to_bits(), Ordering::Relaxed);
    }

    /// Loads the state file. Any parse failure or out-of-range value
    /// invalidates the whole file and the defaults are restored.
    pub fn load(&self) {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::info!("no audio processor state loaded: {}", e);
                return;
            }
        };

        let mut lines = content.lines();
        let parsed = (|| {
            let mode: i32 = lines.next()?.trim().parse().ok()?;
            let release: f32 = lines.next()?.trim().parse().ok()?;
            let gain: f32 = lines.next()?.trim().parse().ok()?;
            let channel: i32 = lines.next()?.trim().parse().ok()?;
            let decay: f32 = lines.next()?.trim().parse().ok()?;
            let threshold: f32 = lines.next()?.trim().parse().ok()?;

            if !in_range_i(mode, COMPRESSOR_MODE_RANGE)
                || !in_range_f(release, COMPRESSOR_RELEASE_RANGE)
                || !in_range_f(gain, PEDALBOARD_GAIN_RANGE)
                || !in_range_i(channel, NOISEGATE_CHANNEL_RANGE)
                || !in_range_f(decay, NOISEGATE_DECAY_RANGE)
                || !in_range_f(threshold, NOISEGATE_THRESHOLD_RANGE)
            {
                return None;
            }
            Some((mode, release, gain, channel, decay, threshold))
        })();

        match parsed {
            Some((mode, release, gain, channel, decay, threshold)) => {
                self.compressor_mode.store(mode, Ordering::Relaxed);
                self.compressor_release.store(release.to_bits(), Ordering::Relaxed);
                self.pedalboard_gain.store(gain.to_bits(), Ordering::Relaxed);
                self.noisegate_channel.store(channel, Ordering::Relaxed);
                self.noisegate_decay.store(decay.to_bits(), Ordering::Relaxed);
                self.noisegate_threshold.store(threshold.to_bits(), Ordering::Relaxed);
            }
            None => {
                log::warn!("invalid audio processor state file, using defaults");
                self.reset_defaults();
            }
        }
    }

    /// Writes all six values back, one per line, truncating.
    pub fn store(&self) -> std::io::Result<()> {
        let mut file = std::fs::File::create(&self.path)?;
        writeln!(file, "{}", self.compressor_mode())?;
        writeln!(file, "{}", self.compressor_release())?;
        writeln!(file, "{}", self.pedalboard_gain())?;
        writeln!(file, "{}", self.noisegate_channel())?;
        writeln!(file, "{}", self.noisegate_decay())?;
        writeln!(file, "{}", self.noisegate_threshold())?;
        Ok(())
    }

    /// Called from the host reader thread whenever it wakes.
    pub fn flush_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.store() {
                log::error!("cannot store audio processor state: {}", e);
            }
        }
    }

    pub fn compressor_mode(&self) -> i32 {
        self.compressor_mode.load(Ordering::Relaxed)
    }

    pub fn compressor_release(&self) -> f32 {
        f32::from_bits(self.compressor_release.load(Ordering::Relaxed))
    }

    pub fn pedalboard_gain(&self) -> f32 {
        f32::from_bits(self.pedalboard_gain.load(Ordering::Relaxed))
    }

    pub fn noisegate_channel(&self) -> i32 {
        self.noisegate_channel.load(Ordering::Relaxed)
    }

    pub fn noisegate_decay(&self) -> f32 {
        f32::from_bits(self.noisegate_decay.load(Ordering::Relaxed))
    }

    pub fn noisegate_threshold(&self) -> f32 {
        f32::from_bits(self.noisegate_threshold.load(Ordering::Relaxed))
    }

    pub fn set_compressor_mode(&self, mode: i32) -> bool {
        if !in_range_i(mode, COMPRESSOR_MODE_RANGE) {
            return false;
        }
        self.compressor_mode.store(mode, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_compressor_release(&self, value: f32) -> bool {
        if !in_range_f(value, COMPRESSOR_RELEASE_RANGE) {
            return false;
        }
        self.compressor_release.store(value.to_bits(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_pedalboard_gain(&self, value: f32) -> bool {
        if !in_range_f(value, PEDALBOARD_GAIN_RANGE) {
            return false;
        }
        self.pedalboard_gain.store(value.to_bits(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_noisegate_channel(&self, channel: i32) -> bool {
        if !in_range_i(channel, NOISEGATE_CHANNEL_RANGE) {
            return false;
        }
        self.noisegate_channel.store(channel, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_noisegate_decay(&self, value: f32) -> bool {
        if !in_range_f(value, NOISEGATE_DECAY_RANGE) {
            return false;
        }
        self.noisegate_decay.store(value.to_bits(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn set_noisegate_threshold(&self, value: f32) -> bool {
        if !in_range_f(value, NOISEGATE_THRESHOLD_RANGE) {
            return false;
        }
        self.noisegate_threshold.store(value.to_bits(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// An update that originated on the host side: adopt the value and mark
    /// for flushing, but do not echo it back over the ring.
    pub fn update_from_host(&self, event: EventType, value: &str) {
        let ok = match event {
            EventType::CompressorMode => {
                value.parse().map(|v| self.set_compressor_mode(v)).unwrap_or(false)
            }
            EventType::CompressorRelease => {
                value.parse().map(|v| self.set_compressor_release(v)).unwrap_or(false)
            }
            EventType::PedalboardGain => {
                value.parse().map(|v| self.set_pedalboard_gain(v)).unwrap_or(false)
            }
            EventType::NoisegateChannel => {
                value.parse().map(|v| self.set_noisegate_channel(v)).unwrap_or(false)
            }
            EventType::NoisegateDecay => {
                value.parse().map(|v| self.set_noisegate_decay(v)).unwrap_or(false)
            }
            EventType::NoisegateThreshold => {
                value.parse().map(|v| self.set_noisegate_threshold(v)).unwrap_or(false)
            }
            _ => false,
        };
        if !ok {
            log::debug!("rejected host value {:?} for {:?}", value, event);
        }
    }

    /// Pushes all six values to the host, in the state-file order. Used
    /// after the host asks for a restart sync.
    pub fn push_all(&self, host: &HostChannel) {
        host.send_event(EventType::CompressorMode, 0, 0, self.compressor_mode().to_string().as_bytes());
        host.send_event(
            EventType::CompressorRelease,
            0,
            0,
            self.compressor_release().to_string().as_bytes(),
        );
        host.send_event(EventType::PedalboardGain, 0, 0, self.pedalboard_gain().to_string().as_bytes());
        host.send_event(
            EventType::NoisegateChannel,
            0,
            0,
            self.noisegate_channel().to_string().as_bytes(),
        );
        host.send_event(EventType::NoisegateDecay, 0, 0, self.noisegate_decay().to_string().as_bytes());
        host.send_event(
            EventType::NoisegateThreshold,
            0,
            0,
            self.noisegate_threshold().to_string().as_bytes(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state(content: Option<&str>) -> (tempfile::TempDir, AudioProc) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audioproc.txt");
        if let Some(content) = content {
            std::fs::write(&path, content).unwrap();
        }
        (dir, AudioProc::new(path))
    }

    #[test]
    fn valid_file_loads_every_value() {
        let (_dir, state) = temp_state(Some("2\n250\n-6.5\n1\n25\n-40\n"));
        state.load();

        assert_eq!(state.compressor_mode(), 2);
        assert_eq!(state.compressor_release(), 250.0);
        assert_eq!(state.pedalboard_gain(), -6.5);
        assert_eq!(state.noisegate_channel(), 1);
        assert_eq!(state.noisegate_decay(), 25.0);
        assert_eq!(state.noisegate_threshold(), -40.0);
    }

    #[test]
    fn one_bad_value_invalidates_the_whole_file() {
        // decay below range: everything reverts to defaults
        let (_dir, state) = temp_state(Some("2\n250\n-6.5\n1\n0.5\n-40\n"));
        state.load();

        assert_eq!(state.compressor_mode(), DEFAULT_COMPRESSOR_MODE);
        assert_eq!(state.compressor_release(), DEFAULT_COMPRESSOR_RELEASE);
        assert_eq!(state.noisegate_decay(), DEFAULT_NOISEGATE_DECAY);
    }

    #[test]
    fn garbage_and_missing_files_keep_defaults() {
        let (_dir, state) = temp_state(Some("not\na\nstate\nfile\n"));
        state.load();
        assert_eq!(state.compressor_mode(), DEFAULT_COMPRESSOR_MODE);

        let (_dir, state) = temp_state(None);
        state.load();
        assert_eq!(state.noisegate_threshold(), DEFAULT_NOISEGATE_THRESHOLD);
    }

    #[test]
    fn store_then_load_roundtrips() {
        let (_dir, state) = temp_state(None);
        assert!(state.set_compressor_mode(3));
        assert!(state.set_compressor_release(123.5));
        assert!(state.set_noisegate_threshold(-33.0));
        state.store().unwrap();

        state.reset_defaults();
        state.load();
        assert_eq!(state.compressor_mode(), 3);
        assert_eq!(state.compressor_release(), 123.5);
        assert_eq!(state.noisegate_threshold(), -33.0);
    }

    #[test]
    fn setters_enforce_ranges() {
        let (_dir, state) = temp_state(None);
        assert!(!state.set_compressor_mode(5));
        assert!(!state.set_compressor_release(7.0));
        assert!(!state.set_pedalboard_gain(21.0));
        assert!(!state.set_noisegate_channel(-1));
        assert!(!state.set_noisegate_decay(0.0));
        assert!(!state.set_noisegate_threshold(0.0));
        assert_eq!(state.compressor_mode(), DEFAULT_COMPRESSOR_MODE);
    }

    #[test]
    fn flush_writes_only_when_dirty() {
        let (_dir, state) = temp_state(None);

        state.flush_if_dirty();
        assert!(!state.path.exists());

        assert!(state.set_pedalboard_gain(-3.0));
        state.flush_if_dirty();
        let content = std::fs::read_to_string(&state.path).unwrap();
        assert_eq!(content, format!("{}\n100\n-3\n0\n10\n-60\n", DEFAULT_COMPRESSOR_MODE));
    }
}
