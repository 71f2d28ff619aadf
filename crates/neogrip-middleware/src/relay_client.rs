//! [`RelayClient`] – forwards command events to the actuator host.
//!
//! The connection's write half belongs to a single writer task fed through a
//! bounded channel, so command lines and the killswitch line can never
//! interleave. The writer checks the [`KillSwitch`] before every queued
//! command; once it trips, exactly one killswitch record is written and
//! flushed, the connection is shut down and nothing else is sent.

use std::net::SocketAddr;

use neogrip_kernel::KillSwitch;
use neogrip_types::{CommandEvent, NeoError, RelayMessage};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::encode_line;

/// Commands buffered between the session and the writer task.
const QUEUE_DEPTH: usize = 64;

pub struct RelayClient {
    tx: mpsc::Sender<CommandEvent>,
    killswitch: KillSwitch,
    writer: JoinHandle<Result<(), NeoError>>,
}

impl RelayClient {
    /// Connect to a relay server over TCP.
    ///
    /// # Errors
    ///
    /// [`NeoError::Connectivity`] if the connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs, killswitch: KillSwitch) -> Result<Self, NeoError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NeoError::Connectivity(format!("relay connect: {e}")))?;
        stream.set_nodelay(true)?;
        let peer: SocketAddr = stream.peer_addr()?;
        info!(peer = %peer, "connected to actuator host");
        Ok(Self::spawn(stream, killswitch))
    }

    /// Start the writer task on an already-open byte stream.
    pub fn spawn<W>(writer: W, killswitch: KillSwitch) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let writer = tokio::spawn(write_loop(writer, rx, killswitch.clone()));
        Self {
            tx,
            killswitch,
            writer,
        }
    }

    /// Queue `event` for sending.
    ///
    /// # Errors
    ///
    /// [`NeoError::Connectivity`] once the killswitch has tripped or the
    /// writer has stopped.
    pub async fn forward(&self, event: CommandEvent) -> Result<(), NeoError> {
        if self.killswitch.is_tripped() {
            return Err(NeoError::Connectivity(
                "relay closed by killswitch".to_string(),
            ));
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| NeoError::Connectivity("relay writer stopped".to_string()))
    }

    /// Stop accepting commands, let the writer drain, and return its result.
    pub async fn finish(self) -> Result<(), NeoError> {
        drop(self.tx);
        self.writer
            .await
            .map_err(|e| NeoError::Connectivity(format!("relay writer task: {e}")))?
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<CommandEvent>,
    killswitch: KillSwitch,
) -> Result<(), NeoError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = killswitch.tripped() => {
                let line = encode_line(&RelayMessage::Killswitch)?;
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
                info!("killswitch sent to actuator host");
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "relay shutdown after killswitch");
                }
                return Ok(());
            }
            next = rx.recv() => match next {
                Some(event) => {
                    let line = encode_line(&RelayMessage::Command(event))?;
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(error = %e, "relay write failed");
                        return Err(e.into());
                    }
                    writer.flush().await?;
                }
                None => {
                    writer.flush().await?;
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "relay shutdown");
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_line;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn read_lines<R: tokio::io::AsyncRead + Unpin>(reader: R) -> Vec<String> {
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn forwards_commands_in_order() {
        let (near, far) = tokio::io::duplex(4096);
        let client = RelayClient::spawn(near, KillSwitch::new());

        client.forward(CommandEvent::new("push", 0.7)).await.unwrap();
        client.forward(CommandEvent::new("pull", 0.2)).await.unwrap();
        client.finish().await.unwrap();

        let lines = read_lines(far).await;
        assert_eq!(lines.len(), 2);
        let acts: Vec<String> = lines
            .iter()
            .map(|l| match decode_line(l).unwrap() {
                RelayMessage::Command(ev) => ev.act,
                RelayMessage::Killswitch => panic!("unexpected killswitch"),
            })
            .collect();
        assert_eq!(acts, vec!["push", "pull"]);
    }

    #[tokio::test]
    async fn killswitch_is_sent_exactly_once_and_last() {
        let (near, far) = tokio::io::duplex(4096);
        let ks = KillSwitch::new();
        let client = RelayClient::spawn(near, ks.clone());

        client.forward(CommandEvent::new("push", 0.7)).await.unwrap();
        client.forward(CommandEvent::new("push", 0.8)).await.unwrap();
        ks.trip();
        ks.trip();

        let err = client.forward(CommandEvent::new("pull", 0.9)).await.unwrap_err();
        assert!(matches!(err, NeoError::Connectivity(_)));
        client.finish().await.unwrap();

        let lines = read_lines(far).await;
        let kills = lines
            .iter()
            .filter(|l| decode_line(l).unwrap() == RelayMessage::Killswitch)
            .count();
        assert_eq!(kills, 1);
        assert_eq!(lines.last().unwrap(), r#"{"act":"KILLSWITCH"}"#);
        assert!(lines.len() <= 3);
    }

    #[tokio::test]
    async fn killswitch_with_empty_queue_sends_only_the_abort() {
        let (near, far) = tokio::io::duplex(4096);
        let ks = KillSwitch::new();
        let client = RelayClient::spawn(near, ks.clone());
        tokio::task::yield_now().await;

        ks.trip();
        client.finish().await.unwrap();

        assert_eq!(read_lines(far).await, vec![r#"{"act":"KILLSWITCH"}"#.to_string()]);
    }

    #[tokio::test]
    async fn write_failure_surfaces_on_finish() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let client = RelayClient::spawn(near, KillSwitch::new());
        // The first forward may still be queued before the writer notices.
        let _ = client.forward(CommandEvent::new("push", 0.7)).await;
        let res = client.finish().await;
        assert!(matches!(res, Err(NeoError::Connectivity(_))));
    }

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_lines(stream).await
        });

        let client = RelayClient::connect(addr, KillSwitch::new()).await.unwrap();
        client.forward(CommandEvent::new("push", 0.9)).await.unwrap();
        client.finish().await.unwrap();

        let lines = server.await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"type\":\"com\""));
    }
}
