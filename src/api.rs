//! Shared protocol definitions: serial wire constants, the request command
//! set, the host event set and per-device policy constants.

/// Every wire command starts with this prefix.
pub const CMD_PREFIX: &str = "sys_";
/// Wire commands are exactly this many bytes, prefix included.
pub const CMD_LENGTH: usize = 7;
/// The payload size field is two lowercase hex digits.
pub const DATA_SIZE_LENGTH: usize = 2;
/// `CMD SS ` -- command, space, size field, space.
pub const HEADER_LENGTH: usize = CMD_LENGTH + 1 + DATA_SIZE_LENGTH + 1;
/// One serial frame, terminating NUL included, fits in this many bytes.
pub const BUFFER_SIZE: usize = 0xff;
/// Largest payload that still fits the carrier together with header and NUL.
pub const MAX_DATA_SIZE: usize = BUFFER_SIZE - HEADER_LENGTH - 1;

/// Reply prefix for a successful request; data payloads append to it.
pub const RESP_OK: &str = "r 0";
/// Reply for a failed request.
pub const RESP_ERROR: &str = "r -1";

/// Name of the shared memory region holding the host ring pair.
pub const SHM_NAME: &str = "/sys_msgs";

/// Flag file names, relative to the data directory.
pub const FLAG_USB_MULTI_GADGET: &str = "enable-usb-multi-gadget";
pub const FLAG_USB_WINDOWS_COMPAT: &str = "enable-usb-windows-compat";
pub const FLAG_NOISE_REMOVAL: &str = "noise-removal-active";

// ------------------------------------------------------------------------
// device policy ("Dwarf" variant)

/// Number of HMI pages.
pub const NUM_PAGES: u8 = 8;
/// Number of sub-pages per page.
pub const NUM_SUBPAGES: u8 = 3;
/// Number of actuators addressable per page view.
pub const NUM_ACTUATORS: u8 = 6;
/// Actuators at or above this index are shared across all sub-pages.
pub const SHARED_ACTUATOR_MIN: u8 = 3;
/// Factory default for the compressor mode on this variant.
pub const DEFAULT_COMPRESSOR_MODE: i32 = 1;

/// Cache capacity for the LED and indicator payloads.
pub const CACHE_LED_SIZE: usize = 31;
/// Cache capacity for the label, value and unit payloads.
pub const CACHE_TEXT_SIZE: usize = 23;

// ------------------------------------------------------------------------
// requests (HMI -> daemon)

/// A request arriving from the HMI, identified by its 7-byte wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// input/output gain get or postponed set
    Gain,
    /// headphone gain get or postponed set
    HeadphoneGain,
    /// CV/Exp input mode toggle
    CvInputMode,
    /// expression pedal mode toggle
    ExpPedalMode,
    /// CV/headphone output mode toggle
    CvOutputMode,
    /// persist current mixer state
    AmixerSave,
    /// bluetooth status for the HMI
    BluetoothStatus,
    /// start bluetooth discovery
    BluetoothDiscovery,
    /// query a systemd unit state
    Systemctl,
    /// query a component version
    Version,
    /// read the device serial tag
    Serial,
    /// USB gadget mode flags
    UsbMode,
    /// noise removal flag
    NoiseRemoval,
    /// reply, reset the HMI and reboot
    Reboot,
    CompressorMode,
    CompressorRelease,
    PedalboardGain,
    NoisegateChannel,
    NoisegateDecay,
    NoisegateThreshold,
    /// HMI switched to another page
    PageChange,
    /// HMI switched to another sub-page
    SubpageChange,
}

impl Command {
    /// Maps the first [`CMD_LENGTH`] bytes of a frame to a command.
    pub fn from_wire(cmd: &[u8]) -> Option<Command> {
        match cmd {
            b"sys_gai" => Some(Command::Gain),
            b"sys_hpg" => Some(Command::HeadphoneGain),
            b"sys_cvi" => Some(Command::CvInputMode),
            b"sys_exp" => Some(Command::ExpPedalMode),
            b"sys_cvo" => Some(Command::CvOutputMode),
            b"sys_ams" => Some(Command::AmixerSave),
            b"sys_bti" => Some(Command::BluetoothStatus),
            b"sys_btd" => Some(Command::BluetoothDiscovery),
            b"sys_ctl" => Some(Command::Systemctl),
            b"sys_ver" => Some(Command::Version),
            b"sys_ser" => Some(Command::Serial),
            b"sys_usb" => Some(Command::UsbMode),
            b"sys_nrm" => Some(Command::NoiseRemoval),
            b"sys_rbt" => Some(Command::Reboot),
            b"sys_cmo" => Some(Command::CompressorMode),
            b"sys_crl" => Some(Command::CompressorRelease),
            b"sys_pbg" => Some(Command::PedalboardGain),
            b"sys_ngc" => Some(Command::NoisegateChannel),
            b"sys_ngd" => Some(Command::NoisegateDecay),
            b"sys_ngt" => Some(Command::NoisegateThreshold),
            b"sys_pag" => Some(Command::PageChange),
            b"sys_sub" => Some(Command::SubpageChange),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------
// renders (daemon -> HMI), driven by host events

pub const CMD_LED_BLINK: &str = "sys_clb";
pub const CMD_LED_BRIGHTNESS: &str = "sys_cbr";
pub const CMD_NAME: &str = "sys_nam";
pub const CMD_UNIT: &str = "sys_uni";
pub const CMD_VALUE: &str = "sys_val";
pub const CMD_INDICATOR: &str = "sys_ind";
pub const CMD_POPUP: &str = "sys_pop";

// ------------------------------------------------------------------------
// host events (shared memory ring)

/// Typed events exchanged with the audio host over the ring. The
/// discriminant is the first byte of each ring record.
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// out-of-band request, payload selects the action ("restart", "pages")
    SpecialReq,
    /// drop the cached entry for one actuator
    Unassign,
    LedBlink,
    LedBrightness,
    Name,
    Unit,
    Value,
    WidgetIndicator,
    /// transient message, never cached
    Popup,
    CompressorMode,
    CompressorRelease,
    NoisegateChannel,
    NoisegateDecay,
    NoisegateThreshold,
    PedalboardGain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_seven_bytes() {
        for cmd in &[
            "sys_gai", "sys_hpg", "sys_cvi", "sys_exp", "sys_cvo", "sys_ams", "sys_bti",
            "sys_btd", "sys_ctl", "sys_ver", "sys_ser", "sys_usb", "sys_nrm", "sys_rbt",
            "sys_cmo", "sys_crl", "sys_pbg", "sys_ngc", "sys_ngd", "sys_ngt", "sys_pag",
            "sys_sub", CMD_LED_BLINK, CMD_LED_BRIGHTNESS, CMD_NAME, CMD_UNIT, CMD_VALUE,
            CMD_INDICATOR, CMD_POPUP,
        ] {
            assert_eq!(cmd.len(), CMD_LENGTH, "{}", cmd);
            assert!(cmd.starts_with(CMD_PREFIX), "{}", cmd);
        }
    }

    #[test]
    fn known_commands_resolve() {
        assert_eq!(Command::from_wire(b"sys_ver"), Some(Command::Version));
        assert_eq!(Command::from_wire(b"sys_bti"), Some(Command::BluetoothStatus));
        assert_eq!(Command::from_wire(b"sys_fuk"), None);
    }

    #[test]
    fn event_types_roundtrip_over_their_wire_byte() {
        use num_traits::{FromPrimitive, ToPrimitive};
        for ev in &[
            EventType::SpecialReq,
            EventType::Unassign,
            EventType::LedBlink,
            EventType::Popup,
            EventType::PedalboardGain,
        ] {
            let byte = ev.to_u8().unwrap();
            assert_eq!(EventType::from_u8(byte), Some(*ev));
        }
        assert_eq!(EventType::from_u8(0xfe), None);
    }
}
