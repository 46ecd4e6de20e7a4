//! Request/response correlation over a single shared UDP socket.
//!
//! The charger does not echo any correlation id, so every outstanding request registers a
//! waiter keyed by the command code it expects back (by default the code it was sent
//! with) and, optionally, a predicate over the parsed reply. Each inbound datagram is
//! validated once and handed to every waiter whose key and predicate match it. Datagrams
//! nobody waits for are only published as [`Event`]s.
//!
//! # Example
//!
//! ```no_run
//! use evcharger_lib::session::{CommandSession, Expect, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), evcharger_lib::Error> {
//!     let session = CommandSession::new(SessionConfig::new("192.168.1.20"));
//!     let reply = session.request("6e", Expect::response()).await?;
//!     println!("fault status payload: {}", reply.data);
//!     Ok(())
//! }
//! ```

use crate::event::Event;
use crate::protocol::{self, Command, Credential, HexReader, Message};
use crate::transport::{Transport, UdpTransport};
use crate::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_PORT: u16 = 28376;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const EVENT_CAPACITY: usize = 64;

/// Where and how to talk to the charger.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Charger address, may be a broadcast address like `255.255.255.255`.
    pub host: String,
    pub port: u16,
    /// Local port the socket is bound to, the charger answers to it.
    pub local_port: u16,
    /// Decimal password, the factory default is used when unset or invalid.
    pub password: Option<String>,
    /// Response timeout per command, zero waits forever.
    pub timeout: Duration,
}

impl SessionConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::from("255.255.255.255"),
            port: DEFAULT_PORT,
            local_port: DEFAULT_PORT,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// Describes the response a request waits for.
#[derive(Default)]
pub struct Expect {
    command: Option<String>,
    predicate: Option<Predicate>,
}

impl Expect {
    /// A response carrying the same command code as the request.
    pub fn response() -> Self {
        Self::default()
    }

    /// Overrides the expected response command code.
    pub fn command(mut self, command: Command) -> Self {
        self.command = Some(command.code());
        self
    }

    /// Only accepts responses for which `predicate` holds.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }
}

struct Waiter {
    id: u64,
    command: String,
    predicate: Option<Predicate>,
    reply: oneshot::Sender<Message>,
}

impl Waiter {
    fn matches(&self, message: &Message) -> bool {
        self.command == message.command
            && self
                .predicate
                .as_ref()
                .map_or(true, |predicate| predicate(message))
    }
}

struct Shared<T> {
    transport: T,
    waiters: Mutex<Vec<Waiter>>,
    events: broadcast::Sender<Event>,
}

impl<T: Transport> Shared<T> {
    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn forget(&self, id: u64) {
        self.waiters.lock().retain(|waiter| waiter.id != id);
    }

    fn dispatch(&self, datagram: &[u8]) {
        let raw = String::from_utf8_lossy(datagram);
        log::trace!("receive frame: {raw}");
        let Some(message) = protocol::parse(&raw) else {
            self.emit(Event::Malformed(raw.into_owned()));
            return;
        };
        match message.kind() {
            Some(Command::Error) => {
                let code = HexReader::new(&message.data).u8();
                log::warn!("Charger reported error {code:#04x}");
                self.emit(Event::ChargerError(code));
            }
            Some(Command::Heartbeat) => self.emit(Event::Heartbeat),
            _ => {}
        }

        // predicates run without the lock held, they may call back into the session
        let waiters = std::mem::take(&mut *self.waiters.lock());
        let (matched, pending): (Vec<Waiter>, Vec<Waiter>) = waiters
            .into_iter()
            .partition(|waiter| waiter.matches(&message));
        // requests that gave up meanwhile could not remove themselves
        self.waiters
            .lock()
            .extend(pending.into_iter().filter(|waiter| !waiter.reply.is_closed()));
        for waiter in matched {
            log::trace!("frame resolves request #{}", waiter.id);
            if waiter.reply.send(message.clone()).is_err() {
                log::debug!("request #{} was abandoned", waiter.id);
            }
        }
        self.emit(Event::Message(message));
    }

    async fn receive(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                Ok(datagram) => self.dispatch(&datagram),
                Err(err) => {
                    log::warn!("Receiving failed, closing transport: {err}");
                    self.transport.close();
                    break;
                }
            }
        }
    }
}

/// Removes the waiter when the request finishes, whatever the outcome.
struct WaiterGuard<'a, T: Transport> {
    shared: &'a Shared<T>,
    id: u64,
}

impl<T: Transport> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.forget(self.id);
    }
}

/// Owns the transport and all outstanding requests of one charger.
pub struct CommandSession<T: Transport = UdpTransport> {
    shared: Arc<Shared<T>>,
    host: String,
    port: u16,
    local_port: u16,
    timeout: Duration,
    credential: Mutex<Credential>,
    connecting: tokio::sync::Mutex<()>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl CommandSession<UdpTransport> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_transport(UdpTransport::new(), config)
    }
}

impl<T: Transport> CommandSession<T> {
    pub fn with_transport(transport: T, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                waiters: Mutex::new(Vec::new()),
                events,
            }),
            credential: Mutex::new(Credential::parse(config.password.as_deref())),
            host: config.host,
            port: config.port,
            local_port: config.local_port,
            timeout: config.timeout,
            connecting: tokio::sync::Mutex::new(()),
            receiver: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.shared.emit(event);
    }

    pub fn credential(&self) -> Credential {
        *self.credential.lock()
    }

    pub fn set_credential(&self, credential: Credential) {
        log::debug!("credential updated");
        *self.credential.lock() = credential;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the response timeout, `Duration::ZERO` disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.receiver
            .lock()
            .as_ref()
            .is_some_and(|receiver| !receiver.is_finished())
    }

    /// Number of requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.shared.waiters.lock().len()
    }

    /// Binds the transport and starts receiving, unless that already happened.
    ///
    /// Callers arriving while a connect is in flight wait for it and share its socket.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.shared.transport.bind(self.local_port).await?;
        let handle = tokio::spawn(Arc::clone(&self.shared).receive());
        *self.receiver.lock() = Some(handle);
        log::debug!("connected to {}:{}", self.host, self.port);
        Ok(())
    }

    /// Closes the transport. Outstanding requests are left to time out.
    pub fn disconnect(&self) {
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }
        self.shared.transport.close();
    }

    async fn transmit(&self, frame: &str) -> Result<()> {
        log::trace!("send frame: {frame}");
        self.shared
            .transport
            .send(frame.as_bytes(), &self.host, self.port)
            .await?;
        Ok(())
    }

    /// Sends `command` (code and payload) without waiting for a response.
    pub async fn send(&self, command: &str) -> Result<()> {
        let frame = protocol::compile(command, &self.credential());
        self.connect().await?;
        self.transmit(&frame).await
    }

    /// Sends `command` (code and payload) and waits for the response described by `expect`.
    pub async fn request(&self, command: &str, expect: Expect) -> Result<Message> {
        let frame = protocol::compile(command, &self.credential());
        self.connect().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expected = match expect.command {
            Some(code) => code,
            None => command.get(..2).unwrap_or_default().to_ascii_lowercase(),
        };
        log::trace!("request #{id} waits for command {expected}");
        let (reply, response) = oneshot::channel();
        self.shared.waiters.lock().push(Waiter {
            id,
            command: expected,
            predicate: expect.predicate,
            reply,
        });
        let _guard = WaiterGuard {
            shared: &self.shared,
            id,
        };

        self.transmit(&frame).await?;

        let response = if self.timeout.is_zero() {
            response.await
        } else {
            match tokio::time::timeout(self.timeout, response).await {
                Ok(response) => response,
                Err(_) => {
                    log::debug!("request #{id} timed out after {:?}", self.timeout);
                    return Err(Error::Timeout(self.timeout));
                }
            }
        };
        response.map_err(|_| Error::ConnectionClosed)
    }
}

impl<T: Transport> Drop for CommandSession<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
