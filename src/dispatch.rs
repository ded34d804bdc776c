//! Request dispatcher: classifies one decoded frame, performs the side
//! effect and writes the `r …` reply.
//!
//! Every handler returns whether the main loop should keep running. A
//! `false` means the port died mid-reply (or a reboot is in flight); per
//! protocol a success the peer never received must not be silently
//! swallowed, so the loop stops instead.

use crate::api::*;
use crate::audioproc::AudioProc;
use crate::daemon::Daemon;
use crate::framing;

pub fn handle_message(d: &mut Daemon, msg: &[u8]) -> bool {
    let arg = if msg.len() > HEADER_LENGTH {
        match std::str::from_utf8(&msg[HEADER_LENGTH..]) {
            Ok(arg) => arg,
            Err(_) => {
                log::error!("request payload is not valid text");
                return reply_error(d);
            }
        }
    } else {
        ""
    };

    let command = match Command::from_wire(&msg[..CMD_LENGTH]) {
        Some(command) => command,
        None => {
            log::error!("unknown message {:?}", String::from_utf8_lossy(msg));
            return reply_error(d);
        }
    };
    log::debug!("handling {:?} with arg {:?}", command, arg);

    match command {
        Command::Gain => gain(d, arg),
        Command::HeadphoneGain => {
            if arg.is_empty() {
                let out = d.runner.run_capture(&["mod-amixer", "hp", "xvol"]);
                reply_capture(d, out)
            } else {
                d.mixer.headphone(arg);
                reply_ok(d)
            }
        }
        Command::CvInputMode => {
            if arg.is_empty() {
                let out = d.runner.run_capture(&["mod-amixer", "cvexp"]);
                reply_capture(d, out)
            } else {
                d.mixer.cv_exp_toggle(arg);
                reply_ok(d)
            }
        }
        Command::ExpPedalMode => {
            if arg.is_empty() {
                let out = d.runner.run_capture(&["mod-amixer", "exppedal"]);
                reply_capture(d, out)
            } else {
                d.mixer.exp_mode(arg);
                reply_ok(d)
            }
        }
        Command::CvOutputMode => {
            if arg.is_empty() {
                let out = d.runner.run_capture(&["mod-amixer", "cvhp"]);
                reply_capture(d, out)
            } else {
                d.mixer.cv_headphone_toggle(arg);
                reply_ok(d)
            }
        }
        Command::AmixerSave => {
            let ok = d.runner.run(&["mod-amixer", "save"]);
            reply_status(d, ok)
        }
        Command::BluetoothStatus => {
            let out = d.runner.run_capture(&["mod-bluetooth", "hmi"]);
            reply_capture(d, out)
        }
        Command::BluetoothDiscovery => {
            let ok = d.runner.run(&["mod-bluetooth", "discovery"]);
            reply_status(d, ok)
        }
        Command::Systemctl => {
            if arg.is_empty() {
                return reply_error(d);
            }
            let out = d.runner.run_capture(&["systemctl", "is-active", arg]);
            reply_capture(d, out)
        }
        Command::Version => {
            if arg.is_empty() {
                return reply_error(d);
            }
            let out = d.runner.run_capture(&["mod-version", arg]);
            reply_capture(d, out)
        }
        Command::Serial => match std::fs::read_to_string(&d.paths.tag) {
            Ok(tag) => {
                let tag = tag.strip_suffix('\n').unwrap_or(&tag).to_owned();
                reply_data(d, &tag)
            }
            Err(e) => {
                log::error!("cannot read serial tag: {}", e);
                reply_error(d)
            }
        },
        Command::UsbMode => usb_mode(d, arg),
        Command::NoiseRemoval => noise_removal(d, arg),
        Command::Reboot => {
            // reply first: the HMI needs the confirmation before the link
            // goes away underneath it
            reply_ok(d);
            d.runner.run(&["hmi-reset"]);
            d.runner.run(&["reboot"]);
            false
        }
        Command::CompressorMode => getset_int(
            d,
            arg,
            EventType::CompressorMode,
            AudioProc::compressor_mode,
            AudioProc::set_compressor_mode,
        ),
        Command::CompressorRelease => getset_float(
            d,
            arg,
            EventType::CompressorRelease,
            AudioProc::compressor_release,
            AudioProc::set_compressor_release,
        ),
        Command::PedalboardGain => getset_float(
            d,
            arg,
            EventType::PedalboardGain,
            AudioProc::pedalboard_gain,
            AudioProc::set_pedalboard_gain,
        ),
        Command::NoisegateChannel => getset_int(
            d,
            arg,
            EventType::NoisegateChannel,
            AudioProc::noisegate_channel,
            AudioProc::set_noisegate_channel,
        ),
        Command::NoisegateDecay => getset_float(
            d,
            arg,
            EventType::NoisegateDecay,
            AudioProc::noisegate_decay,
            AudioProc::set_noisegate_decay,
        ),
        Command::NoisegateThreshold => getset_float(
            d,
            arg,
            EventType::NoisegateThreshold,
            AudioProc::noisegate_threshold,
            AudioProc::set_noisegate_threshold,
        ),
        Command::PageChange => match arg.trim().parse::<u8>() {
            Ok(page) if d.hmi.set_page(page) => reply_ok(d),
            _ => reply_error(d),
        },
        Command::SubpageChange => match arg.trim().parse::<u8>() {
            Ok(subpage) if d.hmi.set_subpage(subpage) => reply_ok(d),
            _ => reply_error(d),
        },
    }
}

// ------------------------------------------------------------------------
// replies

fn reply(d: &mut Daemon, msg: &str) -> bool {
    framing::write_or_close(&mut *d.port, msg.as_bytes())
}

fn reply_ok(d: &mut Daemon) -> bool {
    reply(d, RESP_OK)
}

fn reply_error(d: &mut Daemon) -> bool {
    reply(d, RESP_ERROR)
}

fn reply_data(d: &mut Daemon, data: &str) -> bool {
    reply(d, &format!("{} {}", RESP_OK, data))
}

fn reply_status(d: &mut Daemon, ok: bool) -> bool {
    if ok {
        reply_ok(d)
    } else {
        reply_error(d)
    }
}

fn reply_capture(d: &mut Daemon, output: Option<String>) -> bool {
    match output {
        Some(out) => reply_data(d, &out),
        None => reply_error(d),
    }
}

// ------------------------------------------------------------------------
// handlers

/// `<io> <channel>[ <value>]` with io 0=in/1=out and channel 0-2.
fn gain(d: &mut Daemon, arg: &str) -> bool {
    let bytes = arg.as_bytes();
    if bytes.len() < 3 || bytes[1] != b' ' {
        return reply_error(d);
    }
    let (io, channel) = (bytes[0], bytes[2]);
    if (io != b'0' && io != b'1') || !(b'0'..=b'2').contains(&channel) {
        return reply_error(d);
    }
    let input = io == b'0';

    if bytes.len() == 3 {
        let io_arg = if input { "in" } else { "out" };
        let channel_arg = (channel as char).to_string();
        let out = d.runner.run_capture(&["mod-amixer", io_arg, &channel_arg, "xvol"]);
        return reply_capture(d, out);
    }

    if bytes[3] != b' ' || bytes.len() == 4 {
        return reply_error(d);
    }
    d.mixer.gain(input, channel as char, &arg[4..]);
    reply_ok(d)
}

fn flag_exists(d: &Daemon, name: &str) -> bool {
    d.paths.data_dir.join(name).exists()
}

fn create_flag(d: &Daemon, name: &str) -> bool {
    match std::fs::File::create(d.paths.data_dir.join(name)) {
        Ok(_) => true,
        Err(e) => {
            log::error!("cannot create {}: {}", name, e);
            false
        }
    }
}

fn delete_flag(d: &Daemon, name: &str) -> bool {
    match std::fs::remove_file(d.paths.data_dir.join(name)) {
        Ok(()) => true,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            log::error!("cannot delete {}: {}", name, e);
            false
        }
    }
}

fn usb_mode(d: &mut Daemon, arg: &str) -> bool {
    match arg {
        "" => {
            let multi = flag_exists(d, FLAG_USB_MULTI_GADGET);
            let windows = flag_exists(d, FLAG_USB_WINDOWS_COMPAT);
            let mode = if multi && windows {
                "2"
            } else if multi {
                "1"
            } else {
                "0"
            };
            reply_data(d, mode)
        }
        "0" => {
            let ok = delete_flag(d, FLAG_USB_MULTI_GADGET) & delete_flag(d, FLAG_USB_WINDOWS_COMPAT);
            reply_status(d, ok)
        }
        "1" => {
            let ok = create_flag(d, FLAG_USB_MULTI_GADGET) & delete_flag(d, FLAG_USB_WINDOWS_COMPAT);
            reply_status(d, ok)
        }
        "2" => {
            let ok = create_flag(d, FLAG_USB_MULTI_GADGET) & create_flag(d, FLAG_USB_WINDOWS_COMPAT);
            reply_status(d, ok)
        }
        _ => reply_error(d),
    }
}

fn noise_removal(d: &mut Daemon, arg: &str) -> bool {
    match arg {
        "" => {
            let mode = if flag_exists(d, FLAG_NOISE_REMOVAL) { "1" } else { "0" };
            reply_data(d, mode)
        }
        "0" => reply_status(d, delete_flag(d, FLAG_NOISE_REMOVAL)),
        "1" => reply_status(d, create_flag(d, FLAG_NOISE_REMOVAL)),
        _ => reply_error(d),
    }
}

fn getset_int(
    d: &mut Daemon,
    arg: &str,
    event: EventType,
    get: fn(&AudioProc) -> i32,
    set: fn(&AudioProc, i32) -> bool,
) -> bool {
    if arg.is_empty() {
        let value = get(&d.audioproc).to_string();
        return reply_data(d, &value);
    }
    match arg.trim().parse::<i32>() {
        Ok(value) if set(&d.audioproc, value) => {
            let value = get(&d.audioproc).to_string();
            d.host.send_event(event, 0, 0, value.as_bytes());
            reply_ok(d)
        }
        _ => reply_error(d),
    }
}

fn getset_float(
    d: &mut Daemon,
    arg: &str,
    event: EventType,
    get: fn(&AudioProc) -> f32,
    set: fn(&AudioProc, f32) -> bool,
) -> bool {
    if arg.is_empty() {
        let value = get(&d.audioproc).to_string();
        return reply_data(d, &value);
    }
    match arg.trim().parse::<f32>() {
        Ok(value) if set(&d.audioproc, value) => {
            let value = get(&d.audioproc).to_string();
            d.host.send_event(event, 0, 0, value.as_bytes());
            reply_ok(d)
        }
        _ => reply_error(d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Paths;
    use crate::exec::RecordingRunner;
    use crate::framing::read_response;
    use crate::port::{fake_pair, FakePort};
    use std::sync::Arc;

    struct Fixture {
        daemon: Daemon,
        hmi_side: FakePort,
        runner: Arc<RecordingRunner>,
        _dir: tempfile::TempDir,
    }

    fn fixture(tag: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            data_dir: dir.path().to_owned(),
            tag: dir.path().join("tag"),
            audioproc: dir.path().join("audioproc.txt"),
        };
        let runner = Arc::new(RecordingRunner::new());
        let (hmi_side, sys_side) = fake_pair();
        let shm_name = format!("/sys_msgs_dispatch_{}_{}", tag, std::process::id());
        let daemon =
            Daemon::new(Box::new(sys_side), paths, runner.clone(), &shm_name).unwrap();
        Fixture { daemon, hmi_side, runner, _dir: dir }
    }

    fn request(fx: &mut Fixture, frame: &[u8]) -> (bool, Option<String>) {
        let keep_going = handle_message(&mut fx.daemon, frame);
        (keep_going, read_response(&mut fx.hmi_side))
    }

    #[test]
    fn version_wraps_captured_stdout() {
        let mut fx = fixture("version");
        fx.runner.set_output("mod-version version", "v1.10.0");

        let (keep_going, resp) = request(&mut fx, b"sys_ver 07 version");
        assert!(keep_going);
        assert_eq!(resp.as_deref(), Some("r 0 v1.10.0"));
    }

    #[test]
    fn failed_capture_replies_error() {
        let mut fx = fixture("capture_fail");
        let (keep_going, resp) = request(&mut fx, b"sys_ver 04 :`[!");
        assert!(keep_going);
        assert_eq!(resp.as_deref(), Some("r -1"));
        assert_eq!(fx.runner.calls(), vec![vec!["mod-version", ":`[!"]]);
    }

    #[test]
    fn unknown_command_replies_error() {
        let mut fx = fixture("unknown");
        let (keep_going, resp) = request(&mut fx, b"sys_fuk");
        assert!(keep_going);
        assert_eq!(resp.as_deref(), Some("r -1"));
    }

    #[test]
    fn gain_getter_runs_amixer() {
        let mut fx = fixture("gain_get");
        fx.runner.set_output("mod-amixer in 1 xvol", "-12.0 dB");

        let (_, resp) = request(&mut fx, b"sys_gai 03 0 1");
        assert_eq!(resp.as_deref(), Some("r 0 -12.0 dB"));
    }

    #[test]
    fn gain_setter_is_postponed_and_acked() {
        let mut fx = fixture("gain_set");
        let (_, resp) = request(&mut fx, b"sys_gai 06 1 2 -3");
        assert_eq!(resp.as_deref(), Some("r 0"));
    }

    #[test]
    fn malformed_gain_argument_replies_error() {
        let mut fx = fixture("gain_bad");
        for frame in
            [&b"sys_gai 01 0"[..], b"sys_gai 03 3 1", b"sys_gai 03 0 7", b"sys_gai 04 0 1 "]
        {
            let (_, resp) = request(&mut fx, frame);
            assert_eq!(resp.as_deref(), Some("r -1"), "{:?}", frame);
        }
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn usb_mode_flags_follow_the_setter() {
        let mut fx = fixture("usb");

        let (_, resp) = request(&mut fx, b"sys_usb");
        assert_eq!(resp.as_deref(), Some("r 0 0"));

        let (_, resp) = request(&mut fx, b"sys_usb 01 2");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_usb");
        assert_eq!(resp.as_deref(), Some("r 0 2"));

        let (_, resp) = request(&mut fx, b"sys_usb 01 1");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_usb");
        assert_eq!(resp.as_deref(), Some("r 0 1"));

        let (_, resp) = request(&mut fx, b"sys_usb 01 0");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_usb");
        assert_eq!(resp.as_deref(), Some("r 0 0"));
    }

    #[test]
    fn noise_removal_flag_roundtrips() {
        let mut fx = fixture("noise");

        let (_, resp) = request(&mut fx, b"sys_nrm");
        assert_eq!(resp.as_deref(), Some("r 0 0"));

        let (_, resp) = request(&mut fx, b"sys_nrm 01 1");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_nrm");
        assert_eq!(resp.as_deref(), Some("r 0 1"));

        let (_, resp) = request(&mut fx, b"sys_nrm 01 0");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_nrm");
        assert_eq!(resp.as_deref(), Some("r 0 0"));
    }

    #[test]
    fn serial_tag_is_read_and_stripped() {
        let mut fx = fixture("serial");
        std::fs::write(&fx.daemon.paths.tag, "MDW-2023-01\n").unwrap();

        let (_, resp) = request(&mut fx, b"sys_ser");
        assert_eq!(resp.as_deref(), Some("r 0 MDW-2023-01"));
    }

    #[test]
    fn audio_values_get_set_and_validate() {
        let mut fx = fixture("audio");

        let (_, resp) = request(&mut fx, b"sys_cmo");
        assert_eq!(resp.as_deref(), Some("r 0 1"));

        let (_, resp) = request(&mut fx, b"sys_cmo 01 3");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_cmo");
        assert_eq!(resp.as_deref(), Some("r 0 3"));

        // floats render in their shortest form
        let (_, resp) = request(&mut fx, b"sys_ngt 03 -45");
        assert_eq!(resp.as_deref(), Some("r 0"));
        let (_, resp) = request(&mut fx, b"sys_ngt");
        assert_eq!(resp.as_deref(), Some("r 0 -45"));

        // out of range and unparsable both refuse
        let (_, resp) = request(&mut fx, b"sys_cmo 01 9");
        assert_eq!(resp.as_deref(), Some("r -1"));
        let (_, resp) = request(&mut fx, b"sys_crl 04 fast");
        assert_eq!(resp.as_deref(), Some("r -1"));
    }

    #[test]
    fn page_change_requires_a_valid_value() {
        let mut fx = fixture("page");

        let (_, resp) = request(&mut fx, b"sys_pag 01 2");
        assert_eq!(resp.as_deref(), Some("r 0"));

        let (_, resp) = request(&mut fx, b"sys_pag");
        assert_eq!(resp.as_deref(), Some("r -1"));

        let (_, resp) = request(&mut fx, b"sys_pag 01 9");
        assert_eq!(resp.as_deref(), Some("r -1"));
    }

    #[test]
    fn reboot_replies_then_stops_the_loop() {
        let mut fx = fixture("reboot");
        fx.runner.set_output("hmi-reset", "");
        fx.runner.set_output("reboot", "");

        let (keep_going, resp) = request(&mut fx, b"sys_rbt");
        assert!(!keep_going);
        assert_eq!(resp.as_deref(), Some("r 0"));
        assert_eq!(fx.runner.calls(), vec![vec!["hmi-reset"], vec!["reboot"]]);
    }
}
