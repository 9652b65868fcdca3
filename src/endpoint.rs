//! The demultiplexing edge of the transport: a [`Listener`] owns the UDP
//!  socket and the mapping from remote address to connection, routing every
//!  inbound datagram to the connection it belongs to; [`dial`] is the
//!  initiating counterpart. Undecodable datagrams are dropped here - the
//!  connections themselves only ever see well-formed segments.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::segment::{Segment, SegmentFlags};
use crate::socket::DatagramSocket;
use crate::state_machine::State;
use crate::stats::{StatsSnapshot, TransferStats};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;

const MAX_DATAGRAM_LEN: usize = 65535;

pub struct Listener {
    socket: Arc<UdpSocket>,
    connections: Arc<Mutex<FxHashMap<SocketAddr, Arc<Connection>>>>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Connection>>>,
    stats: Arc<TransferStats>,
    recv_task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> anyhow::Result<Listener> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening on {:?}", socket.local_addr());

        let connections: Arc<Mutex<FxHashMap<SocketAddr, Arc<Connection>>>> = Default::default();
        let stats = Arc::new(TransferStats::default());
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            connections.clone(),
            accept_tx,
            config,
            stats.clone(),
        ));

        Ok(Listener {
            socket,
            connections,
            accept_rx: Mutex::new(accept_rx),
            stats,
            recv_task,
        })
    }

    /// The next connection a peer has initiated towards this listener. The
    ///  returned connection is still mid-handshake; it becomes readable and
    ///  writable once the handshake completes.
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Aggregate counters across all connections of this listener.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop routing datagrams and release the datagram handle. Existing
    ///  connections stay alive but will no longer receive anything.
    pub async fn close(&self) {
        self.recv_task.abort();
        self.socket.close().await;
    }

    /// The currently tracked connections, for diagnostics.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    connections: Arc<Mutex<FxHashMap<SocketAddr, Arc<Connection>>>>,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    config: Arc<Config>,
    stats: Arc<TransferStats>,
) {
    info!("starting receive loop");

    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);

        let segment = match Segment::deser(&mut &buf[..num_read]) {
            Ok(segment) => segment,
            Err(_) => {
                stats.record_decode_failure();
                warn!("received undecodable datagram from {:?}, dropping", from);
                continue;
            }
        };
        stats.record_segment_received(num_read);

        let connection = {
            let mut connections = connections.lock().await;
            match connections.get(&from) {
                Some(connection) => connection.clone(),
                None => {
                    // only a SYN may start a new connection
                    if !segment.flags.contains(SegmentFlags::SYN) {
                        debug!("segment from unknown peer {:?} without SYN, dropping", from);
                        continue;
                    }

                    let connection = match Connection::new(
                        Arc::new(socket.clone()),
                        from,
                        config.clone(),
                        stats.clone(),
                    ) {
                        Ok(connection) => connection,
                        Err(e) => {
                            error!("could not set up connection for {:?}: {}", from, e);
                            continue;
                        }
                    };
                    if connection.open_passive().await.is_err() {
                        continue;
                    }

                    if accept_tx.try_send(connection.clone()).is_err() {
                        warn!("accept backlog full, refusing connection from {:?}", from);
                        continue;
                    }

                    debug!("new connection from {:?}", from);
                    connections.insert(from, connection.clone());
                    connection
                }
            }
        };

        connection.handle_segment(segment).instrument(span).await;

        // fully closed connections are forgotten; a later SYN from the same
        //  address starts fresh
        if connection.state() == State::Closed {
            debug!("connection to {:?} is closed, dropping it from the routing table", from);
            connections.lock().await.remove(&from);
        }
    }
}

/// Open a connection to a listener at `addr`: bind an ephemeral UDP socket,
///  start the handshake and wait for it to complete within the configured
///  budget.
pub async fn dial(addr: impl ToSocketAddrs, config: Config) -> anyhow::Result<Arc<Connection>> {
    config.validate()?;
    let config = Arc::new(config);

    let remote = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow!("address did not resolve"))?;

    let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

    let stats = Arc::new(TransferStats::default());
    let connection = Connection::new(Arc::new(socket.clone()), remote, config.clone(), stats.clone())?;
    let pump = spawn_peer_receive_loop(socket, Arc::downgrade(&connection), remote, stats);

    let handshake = async {
        connection.open_active().await?;
        connection.wait_established(config.handshake_timeout).await
    };
    if let Err(e) = handshake.await {
        pump.abort();
        return Err(e.into());
    }
    Ok(connection)
}

/// The receive pump for a single-peer socket (the dialing side): decode, drop
///  strangers and feed the connection until it closes or goes away.
pub(crate) fn spawn_peer_receive_loop(
    socket: Arc<UdpSocket>,
    connection: Weak<Connection>,
    remote: SocketAddr,
    stats: Arc<TransferStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            if from != remote {
                debug!("datagram from unexpected peer {:?}, dropping", from);
                continue;
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);

            let segment = match Segment::deser(&mut &buf[..num_read]) {
                Ok(segment) => segment,
                Err(_) => {
                    stats.record_decode_failure();
                    warn!("received undecodable datagram from {:?}, dropping", from);
                    continue;
                }
            };
            stats.record_segment_received(num_read);

            let Some(connection) = connection.upgrade() else {
                break;
            };
            connection.handle_segment(segment).instrument(span).await;

            if connection.state() == State::Closed {
                debug!("connection to {:?} is closed, stopping the receive pump", remote);
                break;
            }
        }
    })
}
