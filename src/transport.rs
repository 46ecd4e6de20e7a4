//! Datagram transport used by the [`CommandSession`](crate::session::CommandSession).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest datagram the charger sends.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Binds the local socket. Called once per connection.
    async fn bind(&self, port: u16) -> io::Result<()>;
    /// Sends one datagram. Hosts ending in `.255` are treated as broadcast addresses.
    async fn send(&self, bytes: &[u8], host: &str, port: u16) -> io::Result<()>;
    /// Waits for the next inbound datagram.
    async fn recv(&self) -> io::Result<Vec<u8>>;
    fn close(&self);
}

/// [`Transport`] over a tokio [`UdpSocket`].
#[derive(Debug, Default)]
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket.read().clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "UDP socket not bound")
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn bind(&self, port: u16) -> io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        log::debug!("UDP socket bound to {}", socket.local_addr()?);
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    async fn send(&self, bytes: &[u8], host: &str, port: u16) -> io::Result<()> {
        let socket = self.socket()?;
        if host.ends_with(".255") {
            socket.set_broadcast(true)?;
        }
        socket.send_to(bytes, (host, port)).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let socket = self.socket()?;
        let mut buffer = vec![0; MAX_DATAGRAM_SIZE];
        let (size, peer) = socket.recv_from(&mut buffer).await?;
        log::trace!("received {size} bytes from {peer}");
        buffer.truncate(size);
        Ok(buffer)
    }

    fn close(&self) {
        if self.socket.write().take().is_some() {
            log::debug!("UDP socket closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex};

    type Responder = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

    /// In-memory transport answering every sent frame through a responder function.
    pub(crate) struct MockTransport {
        pub sent: parking_lot::Mutex<Vec<String>>,
        pub binds: AtomicUsize,
        pub closes: AtomicUsize,
        pub fail_send: AtomicBool,
        responder: Responder,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    impl MockTransport {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
        {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                sent: parking_lot::Mutex::new(Vec::new()),
                binds: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_send: AtomicBool::new(false),
                responder: Box::new(responder),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
            }
        }

        pub fn silent() -> Self {
            Self::new(|_| Vec::new())
        }

        pub fn deliver(&self, datagram: &str) {
            let _ = self.inbound_tx.send(datagram.as_bytes().to_vec());
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn bind(&self, _port: u16) -> io::Result<()> {
            // let concurrent connect attempts pile up on the in-flight one
            tokio::task::yield_now().await;
            self.binds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, bytes: &[u8], _host: &str, _port: u16) -> io::Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "network unreachable"));
            }
            let frame = String::from_utf8_lossy(bytes).into_owned();
            for reply in (self.responder)(&frame) {
                self.deliver(&reply);
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn recv(&self) -> io::Result<Vec<u8>> {
            self.inbound_rx.lock().await.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "mock transport closed")
            })
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
