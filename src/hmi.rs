//! HMI display cache and page state machine.
//!
//! The host keeps pushing display updates for every page while the HMI only
//! shows one page and sub-page at a time. Updates for the visible view are
//! rendered immediately (unless nothing changed); everything else lands in
//! a per-(page, sub-page, actuator) cache and is replayed after the HMI
//! switches views. The replay is delayed a few processing cycles so the
//! panel has settled before the refresh burst arrives.

use crate::api::*;
use crate::audioproc::AudioProc;
use crate::framing;
use crate::host::HostChannel;
use crate::port::SerialIo;
use crate::ring::EventRecord;

use num_traits::FromPrimitive;

/// How many `process()` cycles to wait before replaying after a view
/// change. Not part of the protocol; tuned for the panel firmware.
pub const DEFAULT_REPLAY_DELAY: u8 = 10;

/// Last known payload per display field of one actuator. An empty field has
/// never been written (payloads always carry the actuator prefix, so a real
/// payload is never empty).
#[derive(Default)]
struct CacheEntry {
    led_blink: String,
    led_brightness: String,
    indicator: String,
    label: String,
    value: String,
    unit: String,
}

pub struct HmiState {
    active_page: u8,
    active_subpage: u8,
    change_tick: u8,
    replay_delay: u8,
    io_values_requested: bool,
    cache: Vec<Option<Box<CacheEntry>>>,
}

/// Returns the serial command and quoting for a renderable event kind.
fn render_style(event: EventType) -> Option<(&'static str, bool)> {
    match event {
        EventType::LedBlink => Some((CMD_LED_BLINK, false)),
        EventType::LedBrightness => Some((CMD_LED_BRIGHTNESS, false)),
        EventType::Name => Some((CMD_NAME, true)),
        EventType::Unit => Some((CMD_UNIT, true)),
        EventType::Value => Some((CMD_VALUE, true)),
        EventType::WidgetIndicator => Some((CMD_INDICATOR, false)),
        EventType::Popup => Some((CMD_POPUP, true)),
        _ => None,
    }
}

/// Parses the decimal actuator prefix of a display payload. The digits run
/// up to the first space (or the end) and nothing else is accepted.
fn parse_actuator(msg: &str) -> Option<u8> {
    let digits = msg.split(' ').next().unwrap_or("");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: u8 = digits.parse().ok()?;
    if id >= NUM_ACTUATORS {
        return None;
    }
    Some(id)
}

impl HmiState {
    pub fn new() -> HmiState {
        HmiState {
            active_page: 0,
            active_subpage: 0,
            change_tick: 0,
            replay_delay: DEFAULT_REPLAY_DELAY,
            io_values_requested: false,
            cache: (0..usize::from(NUM_PAGES) * usize::from(NUM_SUBPAGES) * usize::from(NUM_ACTUATORS))
                .map(|_| None)
                .collect(),
        }
    }

    /// Overrides the replay delay, in `process()` cycles.
    pub fn set_replay_delay(&mut self, ticks: u8) {
        self.replay_delay = ticks;
    }

    pub fn active_page(&self) -> u8 {
        self.active_page
    }

    pub fn active_subpage(&self) -> u8 {
        self.active_subpage
    }

    fn index(page: u8, subpage: u8, actuator: u8) -> usize {
        (usize::from(page) * usize::from(NUM_SUBPAGES) + usize::from(subpage))
            * usize::from(NUM_ACTUATORS)
            + usize::from(actuator)
    }

    /// The HMI reported a page switch. Switching page also drops back to
    /// sub-page 0; a sub-page switch leaves the page alone.
    pub fn set_page(&mut self, page: u8) -> bool {
        if page >= NUM_PAGES {
            return false;
        }
        if page != self.active_page {
            self.active_page = page;
            self.active_subpage = 0;
            self.change_tick = 1;
        }
        true
    }

    pub fn set_subpage(&mut self, subpage: u8) -> bool {
        if subpage >= NUM_SUBPAGES {
            return false;
        }
        if subpage != self.active_subpage {
            self.active_subpage = subpage;
            self.change_tick = 1;
        }
        true
    }

    /// Handles one display event from the host. Returns `false` only when
    /// the serial port died while rendering.
    pub fn handle_event(
        &mut self,
        port: &mut dyn SerialIo,
        event: EventType,
        page: u8,
        subpage: u8,
        msg: &str,
    ) -> bool {
        let (cmd, quoted) = match render_style(event) {
            Some(style) => style,
            None => return true,
        };

        if page >= NUM_PAGES || subpage >= NUM_SUBPAGES {
            log::debug!("display event for out-of-range view {}/{}", page, subpage);
            return true;
        }
        let actuator = match parse_actuator(msg) {
            Some(id) => id,
            None => {
                log::debug!("display event with bad actuator prefix {:?}", msg);
                return true;
            }
        };

        // actuators shared across sub-pages always live in sub-page 0 and
        // always match the active view's sub-page
        let (subpage, subpage_matches) = if actuator >= SHARED_ACTUATOR_MIN {
            (0, true)
        } else {
            (subpage, subpage == self.active_subpage)
        };
        let matches = page == self.active_page && subpage_matches;

        // popups are transient: no cache slot, no suppression
        let changed = if event == EventType::Popup {
            true
        } else {
            let entry = self.cache[Self::index(page, subpage, actuator)]
                .get_or_insert_with(Default::default);
            let (slot, cap) = match event {
                EventType::LedBlink => (&mut entry.led_blink, CACHE_LED_SIZE),
                EventType::LedBrightness => (&mut entry.led_brightness, CACHE_LED_SIZE),
                EventType::Name => (&mut entry.label, CACHE_TEXT_SIZE),
                EventType::Unit => (&mut entry.unit, CACHE_TEXT_SIZE),
                EventType::Value => (&mut entry.value, CACHE_TEXT_SIZE),
                EventType::WidgetIndicator => (&mut entry.indicator, CACHE_LED_SIZE),
                _ => unreachable!(),
            };
            let mut new = msg.to_owned();
            let mut cut = cap.min(new.len());
            while !new.is_char_boundary(cut) {
                cut -= 1;
            }
            new.truncate(cut);
            let changed = *slot != new;
            *slot = new;
            changed
        };

        if !(matches && changed) {
            return true;
        }
        match framing::encode_msg(cmd, msg.as_bytes(), quoted) {
            Some(frame) => framing::write_or_close(port, &frame),
            None => true,
        }
    }

    /// Drops the cached entry addressed by `msg`'s actuator prefix.
    pub fn unassign(&mut self, page: u8, subpage: u8, msg: &str) {
        if page >= NUM_PAGES || subpage >= NUM_SUBPAGES {
            return;
        }
        if let Some(actuator) = parse_actuator(msg) {
            let subpage = if actuator >= SHARED_ACTUATOR_MIN { 0 } else { subpage };
            self.cache[Self::index(page, subpage, actuator)] = None;
        }
    }

    /// Host restart: back to the first view, forget everything, and queue a
    /// push of the current audio-processor values.
    pub fn host_restarted(&mut self) {
        self.io_values_requested = true;
        self.active_page = 0;
        self.active_subpage = 0;
        self.change_tick = 0;
        for slot in self.cache.iter_mut() {
            *slot = None;
        }
    }

    /// Host-driven view change: adopt its page/sub-page and start over.
    pub fn host_set_pages(&mut self, page: u8, subpage: u8) {
        if page < NUM_PAGES {
            self.active_page = page;
        }
        if subpage < NUM_SUBPAGES {
            self.active_subpage = subpage;
        }
        for slot in self.cache.iter_mut() {
            *slot = None;
        }
    }

    /// Advances the replay tick and, once it expires, renders every cached
    /// entry of the now-active view. Returns `false` when the port died.
    pub fn process_tick(&mut self, port: &mut dyn SerialIo) -> bool {
        if self.change_tick == 0 {
            return true;
        }
        self.change_tick += 1;
        if self.change_tick < self.replay_delay {
            return true;
        }
        self.change_tick = 0;
        self.replay(port)
    }

    fn replay(&mut self, port: &mut dyn SerialIo) -> bool {
        for actuator in 0..NUM_ACTUATORS {
            let subpage = if actuator >= SHARED_ACTUATOR_MIN { 0 } else { self.active_subpage };
            let entry = match &self.cache[Self::index(self.active_page, subpage, actuator)] {
                Some(entry) => entry,
                None => continue,
            };

            // fixed render order, it mirrors how the host assigns a control
            let fields: [(&str, &str, bool); 6] = [
                (CMD_LED_BLINK, &entry.led_blink, false),
                (CMD_LED_BRIGHTNESS, &entry.led_brightness, false),
                (CMD_NAME, &entry.label, true),
                (CMD_UNIT, &entry.unit, true),
                (CMD_VALUE, &entry.value, true),
                (CMD_INDICATOR, &entry.indicator, false),
            ];
            for (cmd, payload, quoted) in fields.iter() {
                if payload.is_empty() {
                    continue;
                }
                if let Some(frame) = framing::encode_msg(cmd, payload.as_bytes(), *quoted) {
                    if !framing::write_or_close(port, &frame) {
                        return false;
                    }
                    // absorb the HMI's reply before the next render
                    framing::drain_until_nul(port);
                }
            }
        }
        true
    }

    /// One full processing step, called from the main loop between serial
    /// reads: replay tick, queued audio-processor push, then drain whatever
    /// the host posted since the last step.
    pub fn process(
        &mut self,
        port: &mut dyn SerialIo,
        host: &HostChannel,
        audioproc: &AudioProc,
    ) -> bool {
        if !self.process_tick(port) {
            return false;
        }

        if self.io_values_requested {
            self.io_values_requested = false;
            audioproc.push_all(host);
        }

        if host.take_msgs() {
            while let Some(record) = host.read_event() {
                if !self.dispatch_host_event(port, &record, audioproc) {
                    return false;
                }
            }
        }
        true
    }

    fn dispatch_host_event(
        &mut self,
        port: &mut dyn SerialIo,
        record: &EventRecord,
        audioproc: &AudioProc,
    ) -> bool {
        let event = match EventType::from_u8(record.event) {
            Some(event) => event,
            None => {
                log::debug!("unknown host event {}", record.event);
                return true;
            }
        };
        let msg = String::from_utf8_lossy(&record.msg);

        match event {
            EventType::SpecialReq => match msg.as_ref() {
                "restart" => self.host_restarted(),
                "pages" => self.host_set_pages(record.page, record.subpage),
                other => log::debug!("unknown special request {:?}", other),
            },
            EventType::Unassign => self.unassign(record.page, record.subpage, &msg),
            EventType::CompressorMode
            | EventType::CompressorRelease
            | EventType::NoisegateChannel
            | EventType::NoisegateDecay
            | EventType::NoisegateThreshold
            | EventType::PedalboardGain => audioproc.update_from_host(event, &msg),
            _ => return self.handle_event(port, event, record.page, record.subpage, &msg),
        }
        true
    }
}
