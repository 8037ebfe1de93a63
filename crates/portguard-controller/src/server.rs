//! Switch channel listener
//!
//! Switch agents connect over TCP and exchange one JSON object per line. Each
//! connection gets a reader loop that turns messages into [`SwitchEvent`]s and
//! a writer task that drains the connection's outbound queue.

use async_trait::async_trait;
use portguard_common::wire::{decode_line, encode_line, ControllerMessage, SwitchMessage};
use portguard_common::{
    ChannelError, DatapathId, FlowMod, MeterMod, PacketOut, PortStatsRequest, SessionId,
};
use portguard_core::{SwitchEvent, SwitchHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Time a new connection gets to send `hello`
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound messages buffered per connection
const OUTBOUND_QUEUE: usize = 256;

/// Connection failure
#[derive(Error, Debug)]
pub enum ServerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection did not open with a valid hello
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Controller stopped consuming events
    #[error("controller event channel closed")]
    ControllerGone,
}

/// [`SwitchHandle`] over a connection's outbound queue
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<ControllerMessage>,
}

impl ChannelHandle {
    async fn send(&self, message: ControllerMessage) -> Result<(), ChannelError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl SwitchHandle for ChannelHandle {
    async fn send_flow_mod(&self, flow: FlowMod) -> Result<(), ChannelError> {
        self.send(ControllerMessage::FlowMod(flow)).await
    }

    async fn send_meter_mod(&self, meter: MeterMod) -> Result<(), ChannelError> {
        self.send(ControllerMessage::MeterMod(meter)).await
    }

    async fn send_stats_request(&self, request: PortStatsRequest) -> Result<(), ChannelError> {
        self.send(ControllerMessage::PortStatsRequest(request)).await
    }

    async fn send_packet_out(&self, packet: PacketOut) -> Result<(), ChannelError> {
        self.send(ControllerMessage::PacketOut(packet)).await
    }
}

/// TCP listener feeding the controller's event channel
pub struct SwitchServer {
    listener: TcpListener,
    events: mpsc::Sender<SwitchEvent>,
}

impl SwitchServer {
    /// Bind the listener
    pub async fn bind(
        addr: SocketAddr,
        events: mpsc::Sender<SwitchEvent>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, events })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        tracing::info!(addr = %self.local_addr()?, "switch channel listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let events = self.events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, peer_addr, events).await {
                            tracing::warn!(
                                peer = %peer_addr,
                                error = %e,
                                "switch connection ended with error"
                            );
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("switch channel closed");
        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    events: mpsc::Sender<SwitchEvent>,
) -> Result<(), ServerError> {
    socket.set_nodelay(true)?;
    let (reader, writer) = tokio::io::split(socket);
    let mut lines = BufReader::new(reader).lines();

    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut lines, peer_addr));
    let (dpid, features) = match hello.await {
        Ok(hello) => hello?,
        Err(_) => return Err(ServerError::Handshake("no hello received".into())),
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let handle = ChannelHandle { outbound: outbound_tx };
    tokio::spawn(write_loop(writer, outbound_rx, dpid));

    let session = SessionId::next();
    tracing::info!(%dpid, %session, peer = %peer_addr, "switch handshake complete");

    events
        .send(SwitchEvent::Connected {
            dpid,
            session,
            handle: Arc::new(handle.clone()),
            features,
        })
        .await
        .map_err(|_| ServerError::ControllerGone)?;

    let result = read_loop(&mut lines, dpid, &handle, &events).await;

    // The writer stops once every handle clone is gone.
    if events
        .send(SwitchEvent::Disconnected { dpid, session })
        .await
        .is_err()
    {
        tracing::debug!(%dpid, %session, "controller gone before disconnect");
    }
    result
}

async fn read_hello<R>(
    lines: &mut tokio::io::Lines<R>,
    peer_addr: SocketAddr,
) -> Result<(DatapathId, portguard_common::SwitchFeatures), ServerError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<SwitchMessage>(&line) {
            Ok(SwitchMessage::Hello { dpid, features }) => return Ok((dpid, features)),
            Ok(other) => {
                return Err(ServerError::Handshake(format!(
                    "expected hello, got {}",
                    message_name(&other)
                )))
            }
            Err(e) => {
                tracing::warn!(
                    peer = %peer_addr,
                    error = %e,
                    "unparsable line before hello skipped"
                );
            }
        }
    }
    Err(ServerError::Handshake("connection closed before hello".into()))
}

async fn read_loop<R>(
    lines: &mut tokio::io::Lines<R>,
    dpid: DatapathId,
    handle: &ChannelHandle,
    events: &mpsc::Sender<SwitchEvent>,
) -> Result<(), ServerError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let message = match decode_line::<SwitchMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%dpid, error = %e, "unparsable switch message skipped");
                continue;
            }
        };

        let event = match message {
            SwitchMessage::PacketIn(packet) => SwitchEvent::PacketIn { dpid, packet },
            SwitchMessage::PortStatsReply { body, .. } => SwitchEvent::stats_reply(dpid, body),
            SwitchMessage::EchoRequest { token } => {
                if handle.send(ControllerMessage::EchoReply { token }).await.is_err() {
                    break;
                }
                continue;
            }
            SwitchMessage::Hello { dpid: other, .. } => {
                tracing::warn!(%dpid, announced = %other, "repeated hello ignored");
                continue;
            }
        };

        events.send(event).await.map_err(|_| ServerError::ControllerGone)?;
    }
    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<ControllerMessage>,
    dpid: DatapathId,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(%dpid, error = %e, "failed to encode controller message");
                continue;
            }
        };

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(%dpid, error = %e, "switch write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(%dpid, error = %e, "switch flush failed");
            break;
        }
    }
}

fn message_name(message: &SwitchMessage) -> &'static str {
    match message {
        SwitchMessage::Hello { .. } => "hello",
        SwitchMessage::PacketIn(_) => "packet_in",
        SwitchMessage::PortStatsReply { .. } => "port_stats_reply",
        SwitchMessage::EchoRequest { .. } => "echo_request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portguard_common::{FlowMatch, PortCounters, PortStatsEntry, SwitchFeatures};

    async fn start() -> (SocketAddr, mpsc::Receiver<SwitchEvent>, watch::Sender<bool>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = SwitchServer::bind("127.0.0.1:0".parse().unwrap(), events_tx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run(shutdown_rx));
        (addr, events_rx, shutdown_tx)
    }

    async fn send_line(stream: &mut TcpStream, message: &SwitchMessage) {
        stream.write_all(encode_line(message).unwrap().as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_loopback() {
        let (addr, mut events, _shutdown) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"garbage\n").await.unwrap();
        send_line(
            &mut stream,
            &SwitchMessage::Hello {
                dpid: DatapathId(1),
                features: SwitchFeatures::default(),
            },
        )
        .await;

        let (handle, session) = match events.recv().await.unwrap() {
            SwitchEvent::Connected { dpid, handle, session, .. } => {
                assert_eq!(dpid, DatapathId(1));
                (handle, session)
            }
            other => panic!("unexpected event {:?}", other),
        };

        // controller → switch
        handle
            .send_flow_mod(FlowMod::add(400, FlowMatch::in_port(3), Vec::new()))
            .await
            .unwrap();

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        match decode_line::<ControllerMessage>(&line).unwrap() {
            ControllerMessage::FlowMod(flow) => {
                assert!(flow.is_drop());
                assert_eq!(flow.priority, 400);
            }
            other => panic!("unexpected message {:?}", other),
        }

        // keepalive answered directly
        writer
            .write_all(encode_line(&SwitchMessage::EchoRequest { token: 9 }).unwrap().as_bytes())
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(
            decode_line::<ControllerMessage>(&line).unwrap(),
            ControllerMessage::EchoReply { token: 9 }
        );

        // switch → controller
        let reply = SwitchMessage::PortStatsReply {
            xid: 1,
            body: vec![PortStatsEntry::new(3, PortCounters::bytes(10, 20))],
        };
        writer.write_all(encode_line(&reply).unwrap().as_bytes()).await.unwrap();
        match events.recv().await.unwrap() {
            SwitchEvent::PortStatsReply { dpid, entries, .. } => {
                assert_eq!(dpid, DatapathId(1));
                assert_eq!(entries[0].rx_bytes, Some(10));
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(writer);
        drop(lines);
        match events.recv().await.unwrap() {
            SwitchEvent::Disconnected { dpid, session: closed } => {
                assert_eq!(dpid, DatapathId(1));
                assert_eq!(closed, session);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_message_must_be_hello() {
        let (addr, mut events, _shutdown) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send_line(&mut stream, &SwitchMessage::EchoRequest { token: 1 }).await;

        // server closes the connection without reporting a switch
        let mut buf = String::new();
        let read = BufReader::new(&mut stream).read_line(&mut buf).await.unwrap();
        assert_eq!(read, 0);
        assert!(events.try_recv().is_err());
    }
}
