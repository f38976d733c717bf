//! The serial connection to the controller box.
//!
//! [`HardwareLink`] is a cheap, cloneable handle. Behind it sits at most one
//! open port. Finding and opening that port goes through a [`Connector`],
//! so the real serial backend ([`SerialConnector`]) and the simulated box in
//! [`crate::dummy_box`] can be swapped freely.
//!
//! The link keeps itself alive: a watcher thread notices when the device
//! disappears from the system, and any I/O failure on the handle closes it.
//! Either way the link goes `Disconnected` and a background reconnect
//! starts. While a run is in progress the run thread holds the port
//! exclusively through a [`LinkSession`]; everybody else gets
//! [`LinkError::Busy`].

use log::{debug, error, info, warn};
use serial2::{CharSize, FlowControl, Parity, SerialPort, StopBits};
use std::{
    borrow::Cow,
    fmt,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    command::{trial_timing_sequence, Command, TimingField, WireByte},
    event::{EventSink, Report, ReportLabel, XmodEvent},
};

/// Size of the per-trial reaction packet.
pub const REACTION_PACKET_LEN: usize = 36;

/// A byte stream to the controller box.
pub trait Transport: Read + Write + Send {
    /// Throws away anything waiting in the input and output buffers.
    fn discard_buffers(&mut self) -> io::Result<()>;
}

/// Finds and opens [`Transport`]s.
pub trait Connector: Send + Sync {
    /// Lists the serial devices currently present.
    fn available_ports(&self) -> io::Result<Vec<PathBuf>>;

    /// Opens and configures the device at `path`.
    fn open(&self, path: &Path, settings: &LinkSettings) -> io::Result<Box<dyn Transport>>;
}

/// How to find and talk to the controller box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Substring of the device path that identifies the controller box.
    pub device_signature: String,
    /// Line speed; the box runs at 19200 8N1.
    pub baud_rate: u32,
    /// Pause before the next attempt when connecting fails.
    pub retry_interval: Duration,
    /// Automatic attempts after the device was lost.
    pub reconnect_attempts: u32,
    /// Pause after every byte sent, so the box can keep up.
    pub inter_byte_pause: Duration,
    /// `None` blocks forever.
    pub receive_timeout: Option<Duration>,
    /// How often to check that the device is still there. `None` disables
    /// the watcher.
    pub watch_interval: Option<Duration>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            device_signature: "usbserial".to_owned(),
            baud_rate: 19200,
            retry_interval: Duration::from_millis(1000),
            reconnect_attempts: 5,
            inter_byte_pause: Duration::from_millis(40),
            receive_timeout: None,
            watch_interval: Some(Duration::from_millis(1000)),
        }
    }
}

/// [`Connector`] for real serial devices, backed by [`serial2`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Transport for SerialPort {
    fn discard_buffers(&mut self) -> io::Result<()> {
        SerialPort::discard_buffers(self)
    }
}

impl Connector for SerialConnector {
    fn available_ports(&self) -> io::Result<Vec<PathBuf>> {
        SerialPort::available_ports()
    }

    fn open(&self, path: &Path, settings: &LinkSettings) -> io::Result<Box<dyn Transport>> {
        let baud_rate = settings.baud_rate;
        let mut port = SerialPort::open(path, |mut s: serial2::Settings| {
            s.set_raw();
            s.set_baud_rate(baud_rate)?;
            s.set_char_size(CharSize::Bits8);
            s.set_stop_bits(StopBits::One);
            s.set_parity(Parity::None);
            s.set_flow_control(FlowControl::None);
            Ok(s)
        })?;

        // No timeout means a very long one (about 584,942,417,355 years)
        port.set_read_timeout(settings.receive_timeout.unwrap_or(Duration::MAX))?;
        port.set_write_timeout(Duration::MAX)?;
        Ok(Box::new(port))
    }
}

/// Where the link is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No port is open.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A port is open and usable.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        write!(f, "{}", name)
    }
}

/// The result of a successful call to [`HardwareLink::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A port was opened.
    Connected(PathBuf),
    /// Nothing to do, the port was already open.
    AlreadyConnected,
    /// Somebody else is connecting right now; this call did nothing.
    AlreadyConnecting,
}

/// Errors talking to the controller box.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum LinkError {
    /// There is no open port.
    NotConnected,

    /// The port is in use by a running experiment.
    Busy,

    /// Listing the serial devices failed.
    Discovery(io::Error),

    /// No device matches the signature.
    DeviceNotFound { signature: String },

    /// The device was found but could not be opened or configured.
    OpenFailed { path: PathBuf, source: io::Error },

    /// Every connection attempt failed.
    ConnectionFailed { attempts: u32 },

    /// Writing to the port failed.
    WriteFailed(io::Error),

    /// Reading from the port failed.
    ReadFailed(io::Error),

    /// The port stopped delivering before the expected number of bytes.
    BufferError { expected: usize, received: usize },

    /// The configured receive timeout elapsed.
    TimedOut { received: usize },

    /// A timing does not fit the box's 16-bit timers.
    TimingOutOfRange { field: TimingField, value: i32 },
}

impl LinkError {
    /// True for errors that mean the handle itself is dead.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, LinkError::WriteFailed(_) | LinkError::ReadFailed(_))
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LinkError as LE;
        let msg = match self {
            LE::NotConnected => Cow::from("not connected to the control box"),
            LE::Busy => Cow::from("serial port is in use by a running experiment"),
            LE::Discovery(error) => Cow::from(format!("could not list serial ports: {}", error)),
            LE::DeviceNotFound { signature } => {
                Cow::from(format!("no serial port matching {:?}", signature))
            }
            LE::OpenFailed { path, source } => {
                Cow::from(format!("could not open {}: {}", path.display(), source))
            }
            LE::ConnectionFailed { attempts } => {
                Cow::from(format!("could not connect after {} attempts", attempts))
            }
            LE::WriteFailed(error) => Cow::from(format!("write error: {}", error)),
            LE::ReadFailed(error) => Cow::from(format!("reading error: {}", error)),
            LE::BufferError { expected, received } => Cow::from(format!(
                "buffer size error: expected {} bytes, received {}",
                expected, received
            )),
            LE::TimedOut { received } => {
                Cow::from(format!("timed out after receiving {} bytes", received))
            }
            LE::TimingOutOfRange { field, value } => {
                Cow::from(format!("{} of {} ms does not fit in 16 bits", field, value))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Discovery(e) | LinkError::WriteFailed(e) | LinkError::ReadFailed(e) => {
                Some(e)
            }
            LinkError::OpenFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<(TimingField, i32)> for LinkError {
    fn from((field, value): (TimingField, i32)) -> Self {
        LinkError::TimingOutOfRange { field, value }
    }
}

struct OpenPort {
    path: PathBuf,
    transport: Box<dyn Transport>,
}

struct Inner {
    connector: Box<dyn Connector>,
    settings: LinkSettings,
    port: Mutex<Option<OpenPort>>,
    device_path: Mutex<Option<PathBuf>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    watching: AtomicBool,
    events: EventSink,
}

/// Handle to the controller box connection. Clones share the connection.
#[derive(Clone)]
pub struct HardwareLink {
    inner: Arc<Inner>,
}

impl fmt::Debug for HardwareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareLink")
            .field("state", &self.state())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn try_lock<T>(m: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match m.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Holds the `reconnecting` flag for as long as it lives.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl HardwareLink {
    /// Creates a link that is not yet connected. Call [`Self::connect`] or
    /// [`Self::spawn_connect`] to find the box.
    pub fn new(connector: impl Connector + 'static, settings: LinkSettings, events: EventSink) -> Self {
        HardwareLink {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                settings,
                port: Mutex::new(None),
                device_path: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                watching: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// A link over real serial ports.
    pub fn serial(settings: LinkSettings, events: EventSink) -> Self {
        Self::new(SerialConnector, settings, events)
    }

    /// The settings the link was built with.
    pub fn settings(&self) -> &LinkSettings {
        &self.inner.settings
    }

    /// True while a port is open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Where the connection stands right now.
    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.inner.reconnecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// The device the link is connected to.
    pub fn device_path(&self) -> Option<PathBuf> {
        lock(&self.inner.device_path).clone()
    }

    /// Looks for the controller box and opens it, trying up to
    /// `max_attempts` times (at least once) with the retry interval in
    /// between. When every attempt fails, [`XmodEvent::ConnectionFailed`]
    /// is emitted once and nothing more is tried.
    pub fn connect(&self, max_attempts: u32) -> Result<ConnectOutcome, LinkError> {
        if self.is_connected() {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        let Some(_guard) = ConnectGuard::acquire(&self.inner.reconnecting) else {
            debug!("connection attempt already in flight, ignoring");
            return Ok(ConnectOutcome::AlreadyConnecting);
        };

        let events = &self.inner.events;
        let settings = &self.inner.settings;
        events.emit(XmodEvent::Connection(ConnectionState::Connecting));

        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.open_device() {
                Ok(port) => {
                    let path = port.path.clone();
                    self.install(port);
                    return Ok(ConnectOutcome::Connected(path));
                }
                Err(e) => {
                    let remaining = attempts - attempt;
                    let mut report = Report::warning(ReportLabel::Connection, "Serial port unavailable")
                        .message("Could not connect to control box")
                        .detail(e.to_string());
                    if remaining > 0 {
                        report = report.advice(format!(
                            "Retrying in {:.1}s ({} automatic connection attempts remaining)",
                            settings.retry_interval.as_secs_f32(),
                            remaining
                        ));
                        events.report(report);
                        thread::sleep(settings.retry_interval);
                    } else {
                        events.report(report);
                    }
                }
            }
        }

        error!("giving up on the control box after {} attempts", attempts);
        events.emit(XmodEvent::ConnectionFailed { attempts });
        events.report(
            Report::error(ReportLabel::Connection, "Please connect to serial port")
                .message(format!("Could not connect after {} attempts", attempts))
                .advice("Please connect the control box, then check the connection"),
        );
        events.emit(XmodEvent::Connection(ConnectionState::Disconnected));
        Err(LinkError::ConnectionFailed { attempts })
    }

    /// Runs [`Self::connect`] on its own thread.
    pub fn spawn_connect(
        &self,
        max_attempts: u32,
    ) -> Option<JoinHandle<Result<ConnectOutcome, LinkError>>> {
        let link = self.clone();
        let spawned = thread::Builder::new()
            .name("xmod-connect".to_owned())
            .spawn(move || link.connect(max_attempts));
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("could not start the connection thread: {}", e);
                None
            }
        }
    }

    /// The "check connection" button: flash the LEDs if we have a port,
    /// otherwise go looking for one in the background.
    pub fn check_connection(&self) -> Result<(), LinkError> {
        if self.is_connected() {
            self.flash_led()
        } else {
            self.spawn_connect(self.inner.settings.reconnect_attempts);
            Err(LinkError::NotConnected)
        }
    }

    /// Takes the port for exclusive use until the session is dropped.
    pub fn session(&self) -> Result<LinkSession<'_>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let port = try_lock(&self.inner.port).ok_or(LinkError::Busy)?;
        if port.is_none() {
            return Err(LinkError::NotConnected);
        }
        Ok(LinkSession { link: self, port })
    }

    /// Sends one command byte. See [`LinkSession::send_command`].
    pub fn send_command(&self, cmd: Command) -> Result<(), LinkError> {
        self.session()?.send_command(cmd)
    }

    /// Sends the nine-byte timing sequence that arms one trial.
    pub fn send_trial_timing(
        &self,
        reaction_timeout_ms: i32,
        monitor_on_ms: i32,
        monitor_off_ms: i32,
    ) -> Result<(), LinkError> {
        self.session()?
            .send_trial_timing(reaction_timeout_ms, monitor_on_ms, monitor_off_ms)
    }

    /// Reads exactly `n` bytes.
    pub fn receive(&self, n: usize) -> Result<Vec<u8>, LinkError> {
        self.session()?.receive(n)
    }

    /// Makes every response box blink, to show the link works.
    pub fn flash_led(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.send_command(Command::FlashLed)
    }

    /// Switches the participants' monitors on.
    pub fn monitors_on(&self) -> Result<(), LinkError> {
        self.send_command(Command::AdjustOn)
    }

    /// And off.
    pub fn monitors_off(&self) -> Result<(), LinkError> {
        self.send_command(Command::AdjustOff)
    }

    /// Asks the box about itself. See [`LinkSession::query_info`].
    pub fn query_info(&self) -> Result<String, LinkError> {
        self.session()?.query_info()
    }

    /// Closes the port. Fails with [`LinkError::Busy`] during a run.
    pub fn close(&self) -> Result<(), LinkError> {
        let mut port = try_lock(&self.inner.port).ok_or(LinkError::Busy)?;
        let was_open = port.take().is_some();
        lock(&self.inner.device_path).take();
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if was_open || was_connected {
            info!("serial port closed");
            self.inner
                .events
                .emit(XmodEvent::Connection(ConnectionState::Disconnected));
        }
        Ok(())
    }

    fn open_device(&self) -> Result<OpenPort, LinkError> {
        let inner = &self.inner;
        let signature = &inner.settings.device_signature;
        let ports = inner.connector.available_ports().map_err(LinkError::Discovery)?;
        let path = ports
            .into_iter()
            .find(|p| p.to_string_lossy().contains(signature.as_str()))
            .ok_or_else(|| LinkError::DeviceNotFound {
                signature: signature.clone(),
            })?;

        debug!("opening {}", path.display());
        let transport = inner
            .connector
            .open(&path, &inner.settings)
            .map_err(|source| LinkError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        Ok(OpenPort { path, transport })
    }

    fn install(&self, port: OpenPort) {
        let path = port.path.clone();
        *lock(&self.inner.port) = Some(port);
        *lock(&self.inner.device_path) = Some(path.clone());
        self.inner.connected.store(true, Ordering::SeqCst);

        info!("serial port {} successfully set up", path.display());
        let events = &self.inner.events;
        events.emit(XmodEvent::Connection(ConnectionState::Connected));
        events.report(
            Report::info(ReportLabel::Connection, "Connected to serial port")
                .message(path.display().to_string()),
        );
        self.start_watcher();
    }

    /// Marks the link as lost and starts reconnecting. Whoever calls this
    /// is responsible for dropping the dead handle.
    fn lost_connection(&self, why: &str) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.device_path).take();
        warn!("serial port lost: {}", why);

        let events = &self.inner.events;
        events.emit(XmodEvent::Connection(ConnectionState::Disconnected));
        events.report(
            Report::warning(ReportLabel::Connection, "Serial port disconnected")
                .message(why.to_owned())
                .advice("Attempting to reconnect..."),
        );
        self.spawn_connect(self.inner.settings.reconnect_attempts);
    }

    fn start_watcher(&self) {
        let Some(interval) = self.inner.settings.watch_interval else {
            return;
        };
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("xmod-port-watch".to_owned())
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                HardwareLink { inner }.check_device_present();
            });
        if let Err(e) = spawned {
            warn!("could not start the port watcher: {}", e);
            self.inner.watching.store(false, Ordering::SeqCst);
        }
    }

    fn check_device_present(&self) {
        if !self.is_connected() {
            return;
        }
        let Some(path) = self.device_path() else {
            return;
        };
        match self.inner.connector.available_ports() {
            Ok(ports) if !ports.contains(&path) => {
                // A running session will trip over the dead handle itself.
                if let Some(mut port) = try_lock(&self.inner.port) {
                    port.take();
                }
                self.lost_connection(&format!("{} was unplugged", path.display()));
            }
            Ok(_) => {}
            Err(e) => debug!("could not list serial ports: {}", e),
        }
    }
}

/// Exclusive access to the open port. Drop it to give the port back.
pub struct LinkSession<'a> {
    link: &'a HardwareLink,
    port: MutexGuard<'a, Option<OpenPort>>,
}

impl LinkSession<'_> {
    /// Discards pending I/O and sends a single command byte.
    pub fn send_command(&mut self, cmd: Command) -> Result<(), LinkError> {
        debug!("sending {}", cmd);
        self.send(WireByte::Command(cmd))
    }

    /// Sends the nine-byte sequence that configures the next trial and arms
    /// the audio-triggered interrupt.
    pub fn send_trial_timing(
        &mut self,
        reaction_timeout_ms: i32,
        monitor_on_ms: i32,
        monitor_off_ms: i32,
    ) -> Result<(), LinkError> {
        let sequence = trial_timing_sequence(reaction_timeout_ms, monitor_on_ms, monitor_off_ms)?;
        debug!(
            "sending trial timing: timeout {} ms, monitor on {} ms, off {} ms",
            reaction_timeout_ms, monitor_on_ms, monitor_off_ms
        );
        for byte in sequence {
            self.send(byte)?;
        }
        Ok(())
    }

    /// Blocks until exactly `n` bytes have arrived.
    pub fn receive(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0; n];
        let result = self.read_exact_into(&mut buf);
        self.checked(result)?;
        Ok(buf)
    }

    /// Blocks until exactly `N` bytes have arrived.
    pub fn receive_array<const N: usize>(&mut self) -> Result<[u8; N], LinkError> {
        let mut buf = [0; N];
        let result = self.read_exact_into(&mut buf);
        self.checked(result)?;
        Ok(buf)
    }

    /// Sends every information query in turn and collects the text replies.
    /// The first failure ends the query.
    pub fn query_info(&mut self) -> Result<String, LinkError> {
        let mut info = String::from("Controller Info:");
        for cmd in Command::INFO_QUERIES {
            self.send_command(cmd)?;
            let result = self.read_text();
            let reply = self.checked(result)?;
            info.push('\n');
            info.push_str(reply.trim_end());
        }
        Ok(info)
    }

    fn transport(&mut self) -> Result<&mut (dyn Transport + 'static), LinkError> {
        match self.port.as_mut() {
            Some(port) => Ok(port.transport.as_mut()),
            None => Err(LinkError::NotConnected),
        }
    }

    fn send(&mut self, byte: WireByte) -> Result<(), LinkError> {
        let result = self.write_byte(byte);
        self.checked(result)?;
        let pause = self.link.inner.settings.inter_byte_pause;
        if !pause.is_zero() {
            spin_sleep::sleep(pause);
        }
        Ok(())
    }

    fn write_byte(&mut self, byte: WireByte) -> Result<(), LinkError> {
        let transport = self.transport()?;
        if let WireByte::Command(_) = byte {
            transport.discard_buffers().map_err(LinkError::WriteFailed)?;
        }
        transport
            .write_all(&[byte.byte()])
            .map_err(LinkError::WriteFailed)?;
        transport.flush().map_err(LinkError::WriteFailed)
    }

    fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        let transport = self.transport()?;
        let mut filled = 0;
        while filled < buf.len() {
            match transport.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(LinkError::BufferError {
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(LinkError::TimedOut { received: filled })
                }
                Err(e) => return Err(LinkError::ReadFailed(e)),
            }
        }
        Ok(())
    }

    /// Reads whatever text the box sends in one go.
    fn read_text(&mut self) -> Result<String, LinkError> {
        let transport = self.transport()?;
        let mut buf = [0; 256];
        let n = loop {
            match transport.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(LinkError::TimedOut { received: 0 })
                }
                Err(e) => return Err(LinkError::ReadFailed(e)),
            }
        };
        if n == 0 {
            return Err(LinkError::BufferError {
                expected: 1,
                received: 0,
            });
        }
        // The box speaks ASCII; anything else is shown byte for byte.
        Ok(buf[..n].iter().map(|&b| b as char).collect())
    }

    /// Drops the handle and starts reconnecting when `result` says the
    /// transport is dead.
    fn checked<T>(&mut self, result: Result<T, LinkError>) -> Result<T, LinkError> {
        if let Err(e) = &result {
            if e.is_transport_failure() {
                if let Some(port) = self.port.take() {
                    warn!("closing {} after I/O failure", port.path.display());
                }
                self.link.lost_connection(&e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_box::DummyBox;
    use std::sync::mpsc::Receiver;

    fn quick_settings() -> LinkSettings {
        LinkSettings {
            retry_interval: Duration::from_millis(5),
            inter_byte_pause: Duration::ZERO,
            watch_interval: None,
            ..LinkSettings::default()
        }
    }

    fn connected_link(dummy: &DummyBox) -> (HardwareLink, Receiver<XmodEvent>) {
        let (events, rx) = EventSink::channel();
        let link = HardwareLink::new(dummy.clone(), quick_settings(), events);
        assert!(matches!(link.connect(1), Ok(ConnectOutcome::Connected(_))));
        (link, rx)
    }

    fn count_failures(rx: &Receiver<XmodEvent>) -> usize {
        rx.try_iter()
            .filter(|e| matches!(e, XmodEvent::ConnectionFailed { .. }))
            .count()
    }

    #[test]
    fn connects_to_matching_port() {
        let dummy = DummyBox::builder().build();
        let (link, rx) = connected_link(&dummy);

        assert!(link.is_connected());
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(link.device_path(), Some(dummy.port_path()));
        assert_eq!(dummy.open_count(), 1);

        let states: Vec<ConnectionState> = rx
            .try_iter()
            .filter_map(|e| match e {
                XmodEvent::Connection(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        assert!(matches!(link.connect(3), Ok(ConnectOutcome::AlreadyConnected)));
        assert_eq!(dummy.open_count(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let dummy = DummyBox::builder().plugged_in(false).build();
        let (events, rx) = EventSink::channel();
        let link = HardwareLink::new(dummy.clone(), quick_settings(), events);

        assert!(matches!(
            link.connect(3),
            Err(LinkError::ConnectionFailed { attempts: 3 })
        ));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(count_failures(&rx), 1);

        // nothing keeps trying behind our back
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count_failures(&rx), 0);
        assert_eq!(dummy.list_count(), 3);
    }

    #[test]
    fn retries_until_open_succeeds() {
        let dummy = DummyBox::builder().failing_opens(2).build();
        let (events, rx) = EventSink::channel();
        let link = HardwareLink::new(dummy.clone(), quick_settings(), events);

        assert!(matches!(link.connect(5), Ok(ConnectOutcome::Connected(_))));
        assert_eq!(dummy.open_count(), 1);
        assert_eq!(count_failures(&rx), 0);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let dummy = DummyBox::builder().plugged_in(false).build();
        let link = HardwareLink::new(dummy.clone(), quick_settings(), EventSink::discard());
        assert!(matches!(
            link.connect(0),
            Err(LinkError::ConnectionFailed { attempts: 1 })
        ));
    }

    #[test]
    fn concurrent_connect_is_a_no_op() {
        let dummy = DummyBox::builder().plugged_in(false).build();
        let settings = LinkSettings {
            retry_interval: Duration::from_millis(100),
            ..quick_settings()
        };
        let link = HardwareLink::new(dummy.clone(), settings, EventSink::discard());

        let first = link.spawn_connect(3).unwrap();
        while link.state() != ConnectionState::Connecting {
            thread::yield_now();
        }
        assert!(matches!(link.connect(3), Ok(ConnectOutcome::AlreadyConnecting)));
        assert!(matches!(
            first.join().unwrap(),
            Err(LinkError::ConnectionFailed { attempts: 3 })
        ));
    }

    #[test]
    fn ignores_ports_without_signature() {
        let dummy = DummyBox::builder().build();
        let settings = LinkSettings {
            device_signature: "no-such-device".to_owned(),
            ..quick_settings()
        };
        let link = HardwareLink::new(dummy.clone(), settings, EventSink::discard());

        assert!(link.connect(1).is_err());
        assert_eq!(dummy.open_count(), 0);
    }

    #[test]
    fn commands_need_a_connection() {
        let dummy = DummyBox::builder().build();
        let link = HardwareLink::new(dummy, quick_settings(), EventSink::discard());

        assert!(matches!(link.flash_led(), Err(LinkError::NotConnected)));
        assert!(matches!(
            link.send_command(Command::AdjustOn),
            Err(LinkError::NotConnected)
        ));
        assert!(matches!(link.receive(36), Err(LinkError::NotConnected)));
    }

    #[test]
    fn flash_led_writes_one_byte() {
        let dummy = DummyBox::builder().build();
        let (link, _rx) = connected_link(&dummy);

        link.flash_led().unwrap();
        assert_eq!(dummy.written(), vec![Command::FlashLed.byte()]);
    }

    #[test]
    fn check_connection_flashes_when_connected() {
        let dummy = DummyBox::builder().build();
        let (link, _rx) = connected_link(&dummy);

        link.check_connection().unwrap();
        assert_eq!(dummy.written(), vec![Command::FlashLed.byte()]);
        assert_eq!(dummy.open_count(), 1);
    }

    #[test]
    fn check_connection_reconnects_in_background() {
        let dummy = DummyBox::builder().plugged_in(false).build();
        let settings = LinkSettings {
            reconnect_attempts: 200,
            ..quick_settings()
        };
        let link = HardwareLink::new(dummy.clone(), settings, EventSink::discard());

        assert!(matches!(link.check_connection(), Err(LinkError::NotConnected)));
        assert_eq!(dummy.open_count(), 0);

        dummy.plug_in();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !link.is_connected() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(link.is_connected());
        assert_eq!(dummy.open_count(), 1);
        assert!(dummy.written().is_empty());
    }

    #[test]
    fn trial_timing_on_the_wire() {
        let dummy = DummyBox::builder().build();
        let (link, _rx) = connected_link(&dummy);

        link.send_trial_timing(2100, 300, 1234).unwrap();
        assert_eq!(
            dummy.written(),
            vec![0x01, 52, 8, 0x20, 44, 1, 210, 4, 0x02]
        );

        assert!(matches!(
            link.send_trial_timing(-5, 0, 0),
            Err(LinkError::TimingOutOfRange {
                field: TimingField::ReactionTimeout,
                value: -5
            })
        ));
    }

    #[test]
    fn receives_reaction_packet_after_arming() {
        let mut packet = [0u8; REACTION_PACKET_LEN];
        packet[0] = 0b01;
        packet[4] = 0xF4;
        packet[5] = 0x01;
        let dummy = DummyBox::builder().script(vec![packet]).build();
        let (link, _rx) = connected_link(&dummy);

        let mut session = link.session().unwrap();
        session.send_trial_timing(1000, 0, 0).unwrap();
        let received: [u8; REACTION_PACKET_LEN] = session.receive_array().unwrap();
        assert_eq!(received, packet);
    }

    #[test]
    fn session_is_exclusive() {
        let dummy = DummyBox::builder().build();
        let (link, _rx) = connected_link(&dummy);

        let session = link.session().unwrap();
        assert!(matches!(link.flash_led(), Err(LinkError::Busy)));
        assert!(matches!(link.close(), Err(LinkError::Busy)));
        drop(session);
        assert!(link.flash_led().is_ok());
    }

    #[test]
    fn query_info_collects_replies() {
        let dummy = DummyBox::builder().build();
        let (link, _rx) = connected_link(&dummy);

        let info = link.query_info().unwrap();
        assert!(info.starts_with("Controller Info:"));
        assert_eq!(info.lines().count(), 1 + Command::INFO_QUERIES.len());
        assert_eq!(dummy.written(), (0x07..=0x0C).collect::<Vec<u8>>());
    }

    #[test]
    fn read_failure_drops_the_port_and_reconnects() {
        let dummy = DummyBox::builder().build();
        let (link, rx) = connected_link(&dummy);

        dummy.fail_next_read();
        assert!(matches!(link.receive(36), Err(LinkError::ReadFailed(_))));

        // the reconnect thread finds the (still plugged in) box again
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !link.is_connected() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(link.is_connected());
        assert_eq!(dummy.open_count(), 2);
        assert!(rx
            .try_iter()
            .any(|e| e == XmodEvent::Connection(ConnectionState::Disconnected)));
    }

    #[test]
    fn watcher_notices_unplug() {
        let dummy = DummyBox::builder().build();
        let (events, rx) = EventSink::channel();
        let settings = LinkSettings {
            watch_interval: Some(Duration::from_millis(5)),
            reconnect_attempts: 2,
            ..quick_settings()
        };
        let link = HardwareLink::new(dummy.clone(), settings, events);
        link.connect(1).unwrap();

        dummy.unplug();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut saw_disconnect = false;
        let mut saw_failure = false;
        while !(saw_disconnect && saw_failure) && std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(XmodEvent::Connection(ConnectionState::Disconnected)) => saw_disconnect = true,
                Ok(XmodEvent::ConnectionFailed { attempts }) => {
                    assert_eq!(attempts, 2);
                    saw_failure = true;
                }
                _ => {}
            }
        }
        assert!(saw_disconnect);
        assert!(saw_failure);
        assert!(!link.is_connected());
    }

    #[test]
    fn close_disconnects() {
        let dummy = DummyBox::builder().build();
        let (link, rx) = connected_link(&dummy);
        let _ = rx.try_iter().count();

        link.close().unwrap();
        assert!(!link.is_connected());
        assert_eq!(link.device_path(), None);
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![XmodEvent::Connection(ConnectionState::Disconnected)]
        );
        assert!(matches!(link.flash_led(), Err(LinkError::NotConnected)));
    }
}
