//! [`RelayServer`] – accepts the relay link on the actuator host.
//!
//! One client is served at a time. Per connection a reader task decodes
//! lines and hands them to the processing loop over a channel; the reader
//! trips the [`KillSwitch`] itself the moment it sees a killswitch record, so
//! a brake pulse that is currently being timed is cut short without waiting
//! for the loop to get there.
//!
//! * client disconnects → [`CommandSink::stop_all`], accept the next client.
//! * killswitch (from the link or local) → [`CommandSink::hard_stop_all`],
//!   close the connection and return from [`RelayServer::run`].

use std::net::SocketAddr;

use neogrip_kernel::KillSwitch;
use neogrip_types::{NeoError, RelayMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::decode_line;
use crate::sink::CommandSink;

const INBOX_DEPTH: usize = 64;

/// How a served connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Disconnected,
    Killswitch,
}

pub struct RelayServer {
    listener: TcpListener,
    killswitch: KillSwitch,
}

impl RelayServer {
    /// Bind the relay listener.
    ///
    /// # Errors
    ///
    /// [`NeoError::Connectivity`] if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs, killswitch: KillSwitch) -> Result<Self, NeoError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NeoError::Connectivity(format!("relay bind: {e}")))?;
        info!(addr = ?listener.local_addr().ok(), "relay server listening");
        Ok(Self {
            listener,
            killswitch,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NeoError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until a killswitch arrives.
    ///
    /// # Errors
    ///
    /// Actuator failures from `sink` are fatal and returned as is. Accept
    /// errors are logged and the loop keeps going.
    pub async fn run<S>(&self, sink: &mut S) -> Result<(), NeoError>
    where
        S: CommandSink + ?Sized,
    {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.killswitch.tripped() => None,
                res = self.listener.accept() => Some(res),
            };
            let Some(accepted) = accepted else {
                info!("killswitch tripped while idle");
                return sink.hard_stop_all();
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "relay accept error");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "set_nodelay failed");
            }
            info!(peer = %peer, "relay client connected");

            match self.serve(stream, peer, sink).await? {
                Outcome::Killswitch => {
                    sink.hard_stop_all()?;
                    warn!(peer = %peer, "killswitch: all actuators hard-stopped, relay closed");
                    return Ok(());
                }
                Outcome::Disconnected => {
                    info!(peer = %peer, "relay client disconnected, stopping hand");
                    sink.stop_all().await?;
                }
            }
        }
    }

    async fn serve<S>(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        sink: &mut S,
    ) -> Result<Outcome, NeoError>
    where
        S: CommandSink + ?Sized,
    {
        // The write half is held only to keep the socket open until we return.
        let (read_half, _write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel(INBOX_DEPTH);
        let reader = tokio::spawn(read_loop(read_half, tx, self.killswitch.clone(), peer));

        let outcome = self.process(&mut rx, sink).await;
        reader.abort();
        outcome
    }

    async fn process<S>(
        &self,
        rx: &mut mpsc::Receiver<RelayMessage>,
        sink: &mut S,
    ) -> Result<Outcome, NeoError>
    where
        S: CommandSink + ?Sized,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.killswitch.tripped() => return Ok(Outcome::Killswitch),
                next = rx.recv() => next,
            };
            match next {
                Some(RelayMessage::Command(event)) => {
                    sink.apply(&event).await?;
                }
                Some(RelayMessage::Killswitch) => return Ok(Outcome::Killswitch),
                None => return Ok(Outcome::Disconnected),
            }
        }
    }
}

async fn read_loop<R>(
    reader: R,
    tx: mpsc::Sender<RelayMessage>,
    killswitch: KillSwitch,
    peer: SocketAddr,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(peer = %peer, error = %e, "relay read error");
                return;
            }
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %peer, error = %e, "skipping non-UTF-8 relay line");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line) {
            Ok(RelayMessage::Killswitch) => {
                warn!(peer = %peer, "killswitch received");
                killswitch.trip();
                let _ = tx.send(RelayMessage::Killswitch).await;
                return;
            }
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "skipping relay record");
            }
        }
    }
}
