use crate::c2::agent::AgentRegistry;
use crate::c2::cert::{EphemeralCertificate, KeyKind};
use crate::c2::C2Error;
use crate::hexdump::hexdump;
use crate::protocol::{self, Delegate, Handler};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;

const READ_BUFFER_SIZE: usize = 2048;

/// Read deadline per poll cycle. This is the cooperative-cancellation
/// interval: shutdown and handler-requested closes are observed once
/// per expiry rather than interrupting a blocked read.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

enum Outbound {
    Data(Vec<u8>),
    Shutdown,
}

/// A running emulated C2 server: one listener, one protocol family, one
/// connection task per accepted client.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind a listener and start accepting agents speaking the named
    /// protocol. TLS protocols get an ephemeral self-signed certificate
    /// scoped to this server's lifetime.
    pub async fn bind(
        protocol_name: &str,
        address: &str,
        registry: Arc<AgentRegistry>,
        key_kind: KeyKind,
    ) -> Result<Server, C2Error> {
        let probe = protocol::from_name(protocol_name)
            .ok_or_else(|| C2Error::UnknownProtocol(protocol_name.to_string()))?;

        let acceptor = if probe.needs_tls() {
            let cert = EphemeralCertificate::generate(key_kind)?;
            debug!("Generated ephemeral certificate\n{}", cert.cert_pem);

            let config = cert.server_config()?;
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("Server listening on {local_addr} ({protocol_name})");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            protocol_name.to_string(),
            registry,
            shutdown_rx,
        ));

        Ok(Server {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gracefully stop: close the listener and wait for every live
    /// connection to observe cancellation. In-flight connections are
    /// never interrupted mid-read.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    protocol_name: String,
    registry: Arc<AgentRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = match protocol::from_name(&protocol_name) {
                        Some(h) => h,
                        None => break,
                    };

                    info!("connection from {peer}");

                    connections.spawn(run_connection(
                        stream,
                        peer,
                        handler,
                        acceptor.clone(),
                        Arc::clone(&registry),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("accept error {e}"),
            },
        }
    }

    // Stop accepting immediately; drain live connections.
    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// Connection-side half of the handler contract: outbound bytes go to
/// the writer task, agent sightings go to the registry (with a
/// peer-address fallback identity), and close requests flip a flag the
/// read loop polls.
struct ConnectionDelegate {
    outbound: mpsc::UnboundedSender<Outbound>,
    peer: SocketAddr,
    registry: Arc<AgentRegistry>,
    handler: Weak<dyn Handler>,
    close_requested: Arc<AtomicBool>,
}

impl Delegate for ConnectionDelegate {
    fn send_data(&self, data: &[u8]) {
        let _ = self.outbound.send(Outbound::Data(data.to_vec()));
    }

    fn agent_connected(&self, id: &str) {
        // Default the agent ID to a hash of the peer address if the
        // protocol has nothing better to offer.
        let id = if id.is_empty() {
            hex::encode(Sha256::digest(self.peer.to_string().as_bytes()))
        } else {
            id.to_string()
        };

        self.registry.add_agent(&id, self.peer, self.handler.clone());
    }

    fn close_connection(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<AgentRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half): (BoxedReader, BoxedWriter) = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => {
                let (r, w) = tokio::io::split(tls);
                (Box::new(r), Box::new(w))
            }
            Err(e) => {
                warn!("[{peer}] TLS handshake failed: {e}");
                return;
            }
        },
        None => {
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let close_requested = Arc::new(AtomicBool::new(false));

    handler.set_delegate(Arc::new(ConnectionDelegate {
        outbound: outbound_tx.clone(),
        peer,
        registry,
        handler: Arc::downgrade(&handler),
        close_requested: Arc::clone(&close_requested),
    }));

    let writer = tokio::spawn(write_loop(write_half, outbound_rx));

    handler.accept();
    read_loop(read_half, &handler, shutdown, &close_requested).await;

    // Tear down in order: the handler first (closes its queue and
    // unblocks the decode thread), then the writer after any final
    // protocol bytes the teardown produced.
    handler.close();
    let _ = outbound_tx.send(Outbound::Shutdown);
    let _ = writer.await;

    info!("[{peer}] connection closed");
}

async fn read_loop(
    mut read_half: BoxedReader,
    handler: &Arc<dyn Handler>,
    shutdown: watch::Receiver<bool>,
    close_requested: &AtomicBool,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if *shutdown.borrow() || close_requested.load(Ordering::SeqCst) {
            return;
        }

        match timeout(READ_TIMEOUT, read_half.read(&mut buf)).await {
            // No data yet; go around and poll cancellation again.
            Err(_) => continue,
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => handler.receive_data(&buf[..n]),
            Ok(Err(e)) => {
                warn!("read error {e}");
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: BoxedWriter,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = outbound_rx.recv().await {
        match message {
            Outbound::Data(data) => {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!("write error {e}");
                    break;
                }

                debug!("sent\n{}", hexdump(&data));
            }
            Outbound::Shutdown => break,
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn wait_for_agents(registry: &AgentRegistry, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.len() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} agents"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_rejected() {
        let registry = Arc::new(AgentRegistry::new());
        let result = Server::bind("acidbox", "127.0.0.1:0", registry, KeyKind::default()).await;

        assert!(matches!(result, Err(C2Error::UnknownProtocol(_))));
    }

    #[tokio::test]
    async fn test_generic_server_registers_agent_without_replying() {
        let registry = Arc::new(AgentRegistry::new());
        let server = Server::bind(
            "generic",
            "127.0.0.1:0",
            Arc::clone(&registry),
            KeyKind::default(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        client.write_all(b"hello").await.unwrap();

        wait_for_agents(&registry, 1).await;

        // Identity falls back to a hash of the peer address.
        let expected = hex::encode(Sha256::digest(client_addr.to_string().as_bytes()));
        assert!(registry.agent_by_id(&expected).is_some());

        // The generic handler never replies.
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_millis(300), client.read(&mut buf)).await;
        assert!(read.is_err(), "generic protocol must stay silent");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeat_beacons_do_not_duplicate_agents() {
        let registry = Arc::new(AgentRegistry::new());
        let server = Server::bind(
            "generic",
            "127.0.0.1:0",
            Arc::clone(&registry),
            KeyKind::default(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"beacon-1").await.unwrap();
        wait_for_agents(&registry, 1).await;

        client.write_all(b"beacon-2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_hotcroissant_beacon_over_the_wire() {
        let registry = Arc::new(AgentRegistry::new());
        let server = Server::bind(
            "hotcroissant",
            "127.0.0.1:0",
            Arc::clone(&registry),
            KeyKind::default(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        // A captured-format beacon frame built with the same codec the
        // handler uses, delivered in two arbitrary chunks.
        let frame = crate::protocol::hotcroissant::test_beacon_frame(b"AGENT-A");
        let (a, b) = frame.split_at(5);
        client.write_all(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(b).await.unwrap();

        wait_for_agents(&registry, 1).await;
        let expected = hex::encode(Sha256::digest(b"AGENT-A"));
        assert!(registry.agent_by_id(&expected).is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_live_connections() {
        let registry = Arc::new(AgentRegistry::new());
        let server = Server::bind(
            "generic",
            "127.0.0.1:0",
            Arc::clone(&registry),
            KeyKind::default(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        wait_for_agents(&registry, 1).await;

        server.shutdown().await;

        // The server closes the socket once the read loop observes
        // cancellation; the client sees EOF.
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection should close after shutdown")
            .unwrap();
        assert_eq!(n, 0);
    }
}
