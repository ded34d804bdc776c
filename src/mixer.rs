//! Postponed mixer writes. Turning a gain knob on the HMI produces far more
//! requests than `mod-amixer` invocations can keep up with, so set requests
//! park in a single pending slot and a worker thread materializes only the
//! most recent value per target. Changing target flushes the previous
//! request first so no destination is left behind.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::exec::Runner;

/// Which mixer control a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerControl {
    XVol,
    CvExp,
    ExpPedal,
    CvHp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerRequest {
    input: bool,
    channel: char,
    control: MixerControl,
    value: String,
}

impl MixerRequest {
    fn same_target(&self, other: &MixerRequest) -> bool {
        self.input == other.input && self.channel == other.channel && self.control == other.control
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = vec!["mod-amixer".to_owned()];
        match self.control {
            MixerControl::XVol => {
                if self.channel == 'h' {
                    argv.push("hp".to_owned());
                } else {
                    argv.push(if self.input { "in" } else { "out" }.to_owned());
                    argv.push(self.channel.to_string());
                }
                argv.push("xvol".to_owned());
            }
            MixerControl::CvExp => argv.push("cvexp".to_owned()),
            MixerControl::ExpPedal => argv.push("exppedal".to_owned()),
            MixerControl::CvHp => argv.push("cvhp".to_owned()),
        }
        argv.push(self.value.clone());
        argv
    }
}

enum WorkerOp {
    Kick,
    Quit,
}

pub struct MixerCoalescer {
    pending: Arc<Mutex<Option<MixerRequest>>>,
    runner: Arc<dyn Runner>,
    tx: Sender<WorkerOp>,
    worker: Option<thread::JoinHandle<()>>,
}

fn execute(runner: &dyn Runner, req: &MixerRequest) {
    let argv = req.argv();
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    if !runner.run(&argv) {
        log::warn!("mixer request {:?} failed", argv);
    }
}

impl MixerCoalescer {
    pub fn new(runner: Arc<dyn Runner>) -> MixerCoalescer {
        let pending = Arc::new(Mutex::new(None));
        let (tx, rx) = channel();

        let worker = thread::Builder::new()
            .name("sys-mixer".into())
            .spawn({
                let pending: Arc<Mutex<Option<MixerRequest>>> = Arc::clone(&pending);
                let runner = Arc::clone(&runner);
                move || {
                    for op in rx.iter() {
                        match op {
                            WorkerOp::Quit => break,
                            WorkerOp::Kick => {
                                let req = pending.lock().unwrap().take();
                                if let Some(req) = req {
                                    execute(&*runner, &req);
                                }
                            }
                        }
                    }
                }
            })
            .expect("cannot spawn mixer worker");

        MixerCoalescer { pending, runner, tx, worker: Some(worker) }
    }

    fn submit(&self, req: MixerRequest) {
        let mut slot = self.pending.lock().unwrap();

        // materialize the previously parked value if it addresses another
        // destination, it must not be lost to coalescing
        if let Some(prev) = slot.as_ref() {
            if !prev.same_target(&req) {
                execute(&*self.runner, prev);
            }
        }

        log::debug!("postponing mixer set {:?} = {}", req.control, req.value);
        *slot = Some(req);
        let _ = self.tx.send(WorkerOp::Kick);
    }

    pub fn gain(&self, input: bool, channel: char, value: &str) {
        self.submit(MixerRequest {
            input,
            channel,
            control: MixerControl::XVol,
            value: value.to_owned(),
        });
    }

    pub fn headphone(&self, value: &str) {
        self.submit(MixerRequest {
            input: false,
            channel: 'h',
            control: MixerControl::XVol,
            value: value.to_owned(),
        });
    }

    pub fn cv_exp_toggle(&self, value: &str) {
        self.submit(MixerRequest {
            input: false,
            channel: '0',
            control: MixerControl::CvExp,
            value: value.to_owned(),
        });
    }

    pub fn exp_mode(&self, value: &str) {
        self.submit(MixerRequest {
            input: false,
            channel: '0',
            control: MixerControl::ExpPedal,
            value: value.to_owned(),
        });
    }

    pub fn cv_headphone_toggle(&self, value: &str) {
        self.submit(MixerRequest {
            input: false,
            channel: '0',
            control: MixerControl::CvHp,
            value: value.to_owned(),
        });
    }
}

impl Drop for MixerCoalescer {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerOp::Quit);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use std::sync::mpsc::Receiver;

    /// Wraps the recorder so each execution blocks until the test releases
    /// it, pinning down where the worker is while a burst lands.
    struct GatedRunner {
        inner: RecordingRunner,
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl Runner for GatedRunner {
        fn run(&self, argv: &[&str]) -> bool {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.run(argv);
            true
        }

        fn run_capture(&self, argv: &[&str]) -> Option<String> {
            self.inner.run_capture(argv)
        }
    }

    #[test]
    fn bursts_coalesce_to_the_last_value() {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let runner = Arc::new(GatedRunner {
            inner: RecordingRunner::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });

        {
            let mixer = MixerCoalescer::new(runner.clone());

            // park one value and wait for the worker to start handling it
            mixer.gain(true, '1', "0");
            entered_rx.recv().unwrap();

            // the whole burst lands while the worker is busy
            mixer.gain(true, '1', "-3");
            mixer.gain(true, '1', "-6");
            mixer.gain(true, '1', "-9");
            release_tx.send(()).unwrap();

            // only the newest parked value is materialized
            entered_rx.recv().unwrap();
            release_tx.send(()).unwrap();
        }

        let calls = runner.inner.calls();
        assert_eq!(
            calls,
            vec![
                vec!["mod-amixer", "in", "1", "xvol", "0"],
                vec!["mod-amixer", "in", "1", "xvol", "-9"],
            ]
        );
    }

    #[test]
    fn target_change_flushes_the_previous_request() {
        let runner = Arc::new(RecordingRunner::new());
        {
            let mixer = MixerCoalescer::new(runner.clone());
            mixer.gain(false, '2', "4");
            mixer.headphone("-12");
        }

        let calls = runner.calls();
        let out: Vec<Vec<String>> = calls
            .iter()
            .filter(|c| c[1] == "out")
            .cloned()
            .collect();
        let hp: Vec<Vec<String>> = calls.iter().filter(|c| c[1] == "hp").cloned().collect();

        // the out/2 value was materialized exactly once despite never being
        // the last submission
        assert_eq!(out, vec![vec!["mod-amixer", "out", "2", "xvol", "4"]]);
        assert_eq!(hp, vec![vec!["mod-amixer", "hp", "xvol", "-12"]]);
    }

    #[test]
    fn toggle_controls_use_their_own_argv() {
        let runner = Arc::new(RecordingRunner::new());
        {
            let mixer = MixerCoalescer::new(runner.clone());
            mixer.cv_exp_toggle("1");
        }

        assert_eq!(runner.calls(), vec![vec!["mod-amixer", "cvexp", "1"]]);
    }
}
