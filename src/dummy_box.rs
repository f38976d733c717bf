//! A simulated controller box, so the whole engine can be exercised without
//! the hardware plugged in.
//!
//! [`DummyBox`] is a [`Connector`] that lists one matching port (plus a
//! decoy that does not match). Ports it opens understand the same byte
//! protocol as the real box: data bytes after `MAIL_TOUT` and `CROSSMODEL`
//! are swallowed, information queries get a line of text back, and arming
//! the interrupt with `ENABLE_EXT_INT0` produces a 36-byte reaction packet.
//! Packets come from a script first, then from a seeded random generator,
//! unless the box was told to hold them until [`DummyBox::respond`].

use log::{debug, trace};
use rand::prelude::*;
use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    command::Command,
    link::{Connector, LinkSettings, Transport, REACTION_PACKET_LEN},
};

/// The path the dummy box shows up under. Matches the default signature.
pub const DUMMY_PORT: &str = "/dev/cu.usbserial-XMOD0";

/// A port that is always present but never the box.
const DECOY_PORT: &str = "/dev/ttyS0";

const BOX_COUNT: usize = 16;

/// Where reaction packets come from once the script runs out.
enum Presses {
    Random { rng: StdRng, probability: f64 },
    Held,
}

struct BoxState {
    plugged_in: bool,
    /// Bumped on every unplug, so handles from before go dead.
    generation: u64,
    failing_opens: u32,
    open_count: usize,
    list_count: usize,
    written: Vec<u8>,
    outgoing: VecDeque<u8>,
    /// Data bytes still expected for the last command.
    pending_data: usize,
    script: VecDeque<[u8; REACTION_PACKET_LEN]>,
    presses: Presses,
    fail_next_read: bool,
}

struct Shared {
    state: Mutex<BoxState>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BoxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A controller box that lives in memory. Clones share the same box.
#[derive(Clone)]
pub struct DummyBox {
    shared: Arc<Shared>,
}

/// Configures a [`DummyBox`].
pub struct DummyBoxBuilder {
    plugged_in: bool,
    failing_opens: u32,
    script: Vec<[u8; REACTION_PACKET_LEN]>,
    seed: u64,
    press_probability: f64,
    hold: bool,
}

impl DummyBoxBuilder {
    /// Whether the box is present from the start. Defaults to `true`.
    pub fn plugged_in(mut self, plugged_in: bool) -> Self {
        self.plugged_in = plugged_in;
        self
    }

    /// The first `n` opens fail as if the port were busy.
    pub fn failing_opens(mut self, n: u32) -> Self {
        self.failing_opens = n;
        self
    }

    /// Packets to answer the first trials with, in order.
    pub fn script(mut self, packets: Vec<[u8; REACTION_PACKET_LEN]>) -> Self {
        self.script = packets;
        self
    }

    /// Seed for the random button presses.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Chance that any one box responds in a random trial.
    pub fn press_probability(mut self, probability: f64) -> Self {
        self.press_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Once the script is used up, wait for [`DummyBox::respond`] instead
    /// of making presses up.
    pub fn hold_packets(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Finishes the box.
    pub fn build(self) -> DummyBox {
        let presses = if self.hold {
            Presses::Held
        } else {
            Presses::Random {
                rng: StdRng::seed_from_u64(self.seed),
                probability: self.press_probability,
            }
        };
        DummyBox {
            shared: Arc::new(Shared {
                state: Mutex::new(BoxState {
                    plugged_in: self.plugged_in,
                    generation: 0,
                    failing_opens: self.failing_opens,
                    open_count: 0,
                    list_count: 0,
                    written: Vec::new(),
                    outgoing: VecDeque::new(),
                    pending_data: 0,
                    script: self.script.into(),
                    presses,
                    fail_next_read: false,
                }),
                arrived: Condvar::new(),
            }),
        }
    }
}

impl DummyBox {
    /// A plugged-in box that makes up presses from a fixed seed.
    pub fn builder() -> DummyBoxBuilder {
        DummyBoxBuilder {
            plugged_in: true,
            failing_opens: 0,
            script: Vec::new(),
            seed: 0x584d4f44,
            press_probability: 0.6,
            hold: false,
        }
    }

    /// The device path the box shows up under.
    pub fn port_path(&self) -> PathBuf {
        PathBuf::from(DUMMY_PORT)
    }

    /// Pulls the cable. Open handles fail from now on.
    pub fn unplug(&self) {
        let mut state = self.shared.lock();
        state.plugged_in = false;
        state.generation += 1;
        state.outgoing.clear();
        state.pending_data = 0;
        debug!("dummy box unplugged");
        self.shared.arrived.notify_all();
    }

    /// Puts the cable back. The box has to be opened again.
    pub fn plug_in(&self) {
        self.shared.lock().plugged_in = true;
        debug!("dummy box plugged in");
    }

    /// Delivers a reaction packet right now, as if the trial just ended.
    pub fn respond(&self, packet: [u8; REACTION_PACKET_LEN]) {
        self.shared.lock().outgoing.extend(packet);
        self.shared.arrived.notify_all();
    }

    /// Makes the next read fail with an I/O error.
    pub fn fail_next_read(&self) {
        self.shared.lock().fail_next_read = true;
        self.shared.arrived.notify_all();
    }

    /// Every byte the host sent, in order.
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().written.clone()
    }

    /// How many times the box was opened successfully.
    pub fn open_count(&self) -> usize {
        self.shared.lock().open_count
    }

    /// How many times the ports were listed.
    pub fn list_count(&self) -> usize {
        self.shared.lock().list_count
    }

    /// How many times `ENABLE_EXT_INT0` went out, i.e. trials started.
    pub fn trials_armed(&self) -> usize {
        let arm = Command::EnableExtInt0.byte();
        let state = self.shared.lock();
        // Walk the stream the way the box does, so data bytes equal to the
        // arm command are not counted.
        let mut pending = 0;
        let mut armed = 0;
        for &b in &state.written {
            if pending > 0 {
                pending -= 1;
                continue;
            }
            pending = data_bytes_after(b);
            if b == arm {
                armed += 1;
            }
        }
        armed
    }
}

impl Connector for DummyBox {
    fn available_ports(&self) -> io::Result<Vec<PathBuf>> {
        let mut state = self.shared.lock();
        state.list_count += 1;
        let mut ports = vec![PathBuf::from(DECOY_PORT)];
        if state.plugged_in {
            ports.push(PathBuf::from(DUMMY_PORT));
        }
        Ok(ports)
    }

    fn open(&self, path: &Path, settings: &LinkSettings) -> io::Result<Box<dyn Transport>> {
        let mut state = self.shared.lock();
        if path != Path::new(DUMMY_PORT) || !state.plugged_in {
            return Err(io::Error::new(ErrorKind::NotFound, "no such device"));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(io::Error::new(ErrorKind::PermissionDenied, "port is busy"));
        }
        state.open_count += 1;
        state.outgoing.clear();
        state.pending_data = 0;
        Ok(Box::new(DummyTransport {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
            read_timeout: settings.receive_timeout,
        }))
    }
}

/// An open handle on a [`DummyBox`].
struct DummyTransport {
    shared: Arc<Shared>,
    generation: u64,
    read_timeout: Option<Duration>,
}

impl DummyTransport {
    fn check_alive(&self, state: &BoxState) -> io::Result<()> {
        if !state.plugged_in || state.generation != self.generation {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device was unplugged"));
        }
        Ok(())
    }
}

fn data_bytes_after(byte: u8) -> usize {
    match Command::from_byte(byte) {
        Some(Command::MailTout) => 2,
        Some(Command::CrossModel) => 4,
        _ => 0,
    }
}

fn info_reply(cmd: Command) -> &'static str {
    match cmd {
        Command::GetSource => "Source: xmod.c\r\n",
        Command::GetVersion => "Version: 2.0 (dummy)\r\n",
        Command::GetCreated => "Created: 01.09.14\r\n",
        Command::GetModified => "Modified: 19.10.26\r\n",
        Command::GetBoxes => "Boxes: 16\r\n",
        Command::GetKeys => "Keys: 3\r\n",
        _ => "",
    }
}

fn random_packet(rng: &mut StdRng, probability: f64) -> [u8; REACTION_PACKET_LEN] {
    let mut packet = [0; REACTION_PACKET_LEN];
    for b in 0..BOX_COUNT {
        if !rng.gen_bool(probability) {
            continue;
        }
        let code: u8 = rng.gen_range(1..=3);
        packet[b / 4] |= code << ((b % 4) * 2);
        let raw: u16 = rng.gen_range(150..2500);
        let [lo, hi] = raw.to_le_bytes();
        packet[4 + 2 * b] = lo;
        packet[5 + 2 * b] = hi;
    }
    packet
}

impl BoxState {
    fn take_byte(&mut self, byte: u8) {
        self.written.push(byte);
        if self.pending_data > 0 {
            self.pending_data -= 1;
            return;
        }
        self.pending_data = data_bytes_after(byte);

        let Some(cmd) = Command::from_byte(byte) else {
            trace!("dummy box ignoring unknown byte {:#04x}", byte);
            return;
        };
        if cmd.is_info_query() {
            self.outgoing.extend(info_reply(cmd).bytes());
        } else if cmd == Command::EnableExtInt0 {
            self.arm();
        }
    }

    fn arm(&mut self) {
        let packet = match self.script.pop_front() {
            Some(packet) => packet,
            None => match &mut self.presses {
                Presses::Random { rng, probability } => random_packet(rng, *probability),
                Presses::Held => return,
            },
        };
        self.outgoing.extend(packet);
    }
}

impl Read for DummyTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        loop {
            self.check_alive(&state)?;
            if state.fail_next_read {
                state.fail_next_read = false;
                return Err(io::Error::new(ErrorKind::Other, "line noise"));
            }
            if !state.outgoing.is_empty() {
                let n = buf.len().min(state.outgoing.len());
                for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            state = match self.read_timeout {
                None => self
                    .shared
                    .arrived
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    let (state, result) = self
                        .shared
                        .arrived
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() && state.outgoing.is_empty() {
                        return Err(io::Error::new(ErrorKind::TimedOut, "no reply"));
                    }
                    state
                }
            };
        }
    }
}

impl Write for DummyTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        self.check_alive(&state)?;
        for &byte in buf {
            state.take_byte(byte);
        }
        self.shared.arrived.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_alive(&self.shared.lock())
    }
}

impl Transport for DummyTransport {
    fn discard_buffers(&mut self) -> io::Result<()> {
        let mut state = self.shared.lock();
        self.check_alive(&state)?;
        state.outgoing.clear();
        Ok(())
    }
}
