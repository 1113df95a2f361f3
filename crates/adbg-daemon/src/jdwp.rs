//! Minimal JDWP client
//!
//! Just enough of the Java Debug Wire Protocol to resume a VM that was
//! started suspended (`am start -D`): the handshake, the packet framing and
//! the `VirtualMachine.Resume` command. No retries happen here; callers decide
//! whether to redo the whole connect, handshake and resume sequence.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use adbg_core::prelude::*;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Sent by the debugger and echoed verbatim by the VM.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// `length | id | flags | command set | command` for commands and
/// `length | id | flags | error code` for replies are both 11 bytes.
pub const HEADER_LEN: usize = 11;

pub const COMMAND_SET_VIRTUAL_MACHINE: u8 = 1;
pub const COMMAND_RESUME: u8 = 9;

/// Bit 7 of the flags byte marks a reply packet.
pub const FLAG_REPLY: u8 = 0x80;

/// Upper bound on an incoming packet. Resume replies are empty and events
/// stay far below this, so anything larger is a corrupt stream.
pub const MAX_PACKET_LEN: usize = 1 << 20;

/// Only one command is ever in flight, so a constant id suffices.
const REQUEST_ID: u32 = 0;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// A command packet sent to the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn resume(id: u32) -> Self {
        Self {
            id,
            command_set: COMMAND_SET_VIRTUAL_MACHINE,
            command: COMMAND_RESUME,
            payload: Vec::new(),
        }
    }

    /// Big-endian wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(length as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(0);
        buf.push(self.command_set);
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// A packet read from the VM. Replies carry an error code; VM-initiated
/// commands (events) reuse the same bytes as command set and command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub id: u32,
    pub flags: u8,
    pub error_code: u16,
    pub payload: Vec<u8>,
}

impl ReplyPacket {
    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }
}

/// Read one framed packet.
pub async fn read_packet<R>(reader: &mut R) -> Result<ReplyPacket>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];
    let error_code = u16::from_be_bytes([header[9], header[10]]);

    if length < HEADER_LEN {
        return Err(Error::protocol(format!(
            "packet length {} is shorter than the header",
            length
        )));
    }

    if length > MAX_PACKET_LEN {
        return Err(Error::protocol(format!(
            "packet length {} exceeds the {} byte limit",
            length, MAX_PACKET_LEN
        )));
    }

    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload).await?;

    Ok(ReplyPacket {
        id,
        flags,
        error_code,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connection state of a [`JdwpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JdwpState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    CommandInFlight,
}

/// A handshaken JDWP connection.
#[derive(Debug)]
pub struct JdwpClient {
    address: String,
    stream: Option<TcpStream>,
    state: JdwpState,
    reply_timeout: Duration,
}

impl JdwpClient {
    /// Connect to `host:port` and perform the handshake.
    ///
    /// Fails with `ConnectionFailed` on socket errors and `HandshakeFailed`
    /// if the echo is wrong or missing after `handshake_timeout`. The
    /// connection is closed on failure.
    pub async fn connect(
        host: &str,
        port: u16,
        handshake_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        let mut client = Self {
            address: address.clone(),
            stream: None,
            state: JdwpState::Connecting,
            reply_timeout,
        };

        debug!("Connecting to JDWP at {}", address);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::connection(&address, e))?;
        let _ = stream.set_nodelay(true);
        client.stream = Some(stream);

        client.state = JdwpState::Handshaking;
        if let Err(e) = client.handshake(handshake_timeout).await {
            warn!("JDWP handshake with {} failed: {}", address, e);
            client.disconnect().await;
            return Err(e);
        }

        client.state = JdwpState::Ready;
        debug!("JDWP handshake with {} complete", address);
        Ok(client)
    }

    async fn handshake(&mut self, handshake_timeout: Duration) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::handshake("not connected"))?;

        stream
            .write_all(HANDSHAKE)
            .await
            .map_err(|e| Error::handshake(e.to_string()))?;

        let mut reply = [0u8; HANDSHAKE.len()];
        match timeout(handshake_timeout, stream.read_exact(&mut reply)).await {
            Err(_) => Err(Error::handshake("timed out waiting for reply")),
            Ok(Err(e)) => Err(Error::handshake(e.to_string())),
            Ok(Ok(_)) if &reply != HANDSHAKE => Err(Error::handshake(format!(
                "unexpected reply {:?}",
                String::from_utf8_lossy(&reply)
            ))),
            Ok(Ok(_)) => Ok(()),
        }
    }

    pub fn state(&self) -> JdwpState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resume every thread of the VM.
    pub async fn resume(&mut self) -> Result<()> {
        self.send_command(CommandPacket::resume(REQUEST_ID))
            .await
            .map(|_| ())
    }

    /// Send `packet` and wait for the reply carrying its id.
    ///
    /// Packets with other ids (VM events) are skipped. A non-zero error code
    /// fails with `RemoteCommand`.
    pub async fn send_command(&mut self, packet: CommandPacket) -> Result<ReplyPacket> {
        if self.state != JdwpState::Ready {
            return Err(Error::protocol(format!(
                "cannot send command in state {:?}",
                self.state
            )));
        }
        let address = self.address.clone();
        let deadline = Instant::now() + self.reply_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::protocol("not connected"))?;

        self.state = JdwpState::CommandInFlight;
        trace!(
            "JDWP command set {} command {} id {}",
            packet.command_set,
            packet.command,
            packet.id
        );

        let result = async {
            stream
                .write_all(&packet.encode())
                .await
                .map_err(|e| Error::connection(&address, e))?;

            loop {
                let reply = match timeout_at(deadline, read_packet(stream)).await {
                    Err(_) => return Err(Error::protocol("timed out waiting for reply")),
                    Ok(Err(Error::Io(e))) => return Err(Error::connection(&address, e)),
                    Ok(other) => other?,
                };

                if reply.id != packet.id {
                    debug!("Ignoring JDWP packet with id {}", reply.id);
                    continue;
                }
                if !reply.is_reply() {
                    warn!(
                        "JDWP packet {} is missing the reply flag (flags {:#04x})",
                        reply.id, reply.flags
                    );
                }
                if reply.error_code != 0 {
                    return Err(Error::RemoteCommand {
                        code: reply.error_code,
                    });
                }
                return Ok(reply);
            }
        }
        .await;

        match &result {
            Ok(_) | Err(Error::RemoteCommand { .. }) => self.state = JdwpState::Ready,
            Err(_) => {
                self.state = JdwpState::Ready;
                self.disconnect().await;
            }
        }
        result
    }

    /// Close the connection. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing JDWP connection to {}", self.address);
            let _ = stream.shutdown().await;
        }
        self.state = JdwpState::Disconnected;
    }
}
