//! Half-duplex command transmitter
//!
//! The command channel allows exactly one request in flight. Each local tick
//! the transmitter first tries to drain the reply to its previous request
//! without blocking; if that reply hasn't arrived yet the tick's command is
//! skipped rather than queued behind it.

use crate::error::ClientError;
use log::{trace, warn};
use std::io;
use std::time::Duration;
use sync_shared::{wire, ClientCommand, ClientId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Longest reply line the client will buffer
const MAX_REPLY_BYTES: usize = 4096;

/// One request/reply stream to the server
#[allow(async_fn_in_trait)]
pub trait RequestChannel {
    /// Returns a complete reply line if one is already available
    fn try_recv_reply(&mut self) -> io::Result<Option<String>>;

    /// Waits for the next reply line
    async fn recv_reply(&mut self) -> io::Result<String>;

    async fn send_request(&mut self, frame: &str) -> io::Result<()>;
}

/// [`RequestChannel`] over the client's dedicated TCP command stream
pub struct TcpRequestChannel {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl TcpRequestChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }

    fn buffer(&mut self, data: &[u8]) -> io::Result<()> {
        if self.pending.len() + data.len() > MAX_REPLY_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "reply too long"));
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the command channel")
}

impl RequestChannel for TcpRequestChannel {
    fn try_recv_reply(&mut self) -> io::Result<Option<String>> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Err(closed()),
                Ok(n) => self.buffer(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn recv_reply(&mut self) -> io::Result<String> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(closed());
            }
            self.buffer(&buf[..n])?;
        }
    }

    async fn send_request(&mut self, frame: &str) -> io::Result<()> {
        self.stream.write_all(frame.as_bytes()).await
    }
}

/// Whether a tick's command went out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Previous reply still outstanding; nothing was written
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitStats {
    pub sent: u64,
    pub skipped: u64,
    pub acknowledged: u64,
}

pub struct CommandTransmitter<C> {
    channel: C,
    outstanding: bool,
    stats: TransmitStats,
}

impl<C: RequestChannel> CommandTransmitter<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            outstanding: false,
            stats: TransmitStats::default(),
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn stats(&self) -> TransmitStats {
        self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn on_reply(&mut self, reply: &str) {
        if reply != wire::ACK {
            warn!("Unexpected reply on command channel: {:?}", reply);
        }
        self.outstanding = false;
        self.stats.acknowledged += 1;
    }

    /// Sends `cmd` unless the previous request is still unanswered
    pub async fn send_command(&mut self, cmd: &ClientCommand) -> Result<SendOutcome, ClientError> {
        if self.outstanding {
            match self.channel.try_recv_reply()? {
                Some(reply) => self.on_reply(&reply),
                None => {
                    self.stats.skipped += 1;
                    trace!("Reply outstanding, skipping tick {}", cmd.tick);
                    return Ok(SendOutcome::Skipped);
                }
            }
        }

        let frame = wire::encode_command(cmd).map_err(ClientError::Encode)?;
        self.channel.send_request(&frame).await?;
        self.outstanding = true;
        self.stats.sent += 1;
        Ok(SendOutcome::Sent)
    }

    /// Blocks up to `limit` for the reply to the outstanding request
    pub async fn wait_for_reply(&mut self, limit: Duration) -> Result<(), ClientError> {
        if !self.outstanding {
            return Ok(());
        }
        let reply = timeout(limit, self.channel.recv_reply())
            .await
            .map_err(|_| ClientError::Timeout("command reply"))??;
        self.on_reply(&reply);
        Ok(())
    }

    /// Says goodbye on the channel, waiting up to `limit` for each reply
    pub async fn disconnect(&mut self, client_id: ClientId, limit: Duration) -> Result<(), ClientError> {
        self.wait_for_reply(limit).await?;
        self.channel
            .send_request(&wire::encode_disconnect(client_id))
            .await?;
        self.outstanding = true;
        self.wait_for_reply(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::Event;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    /// Channel whose replies become available `delay` ticks after the request
    struct DelayedChannel {
        now: u32,
        delay: u32,
        reply_at: Option<u32>,
        frames: Vec<String>,
    }

    impl DelayedChannel {
        fn new(delay: u32) -> Self {
            Self {
                now: 0,
                delay,
                reply_at: None,
                frames: Vec::new(),
            }
        }
    }

    impl RequestChannel for DelayedChannel {
        fn try_recv_reply(&mut self) -> io::Result<Option<String>> {
            match self.reply_at {
                Some(at) if at <= self.now => {
                    self.reply_at = None;
                    Ok(Some(wire::ACK.to_string()))
                }
                _ => Ok(None),
            }
        }

        async fn recv_reply(&mut self) -> io::Result<String> {
            match self.reply_at.take() {
                Some(_) => Ok(wire::ACK.to_string()),
                None => Err(io::Error::new(io::ErrorKind::Other, "nothing outstanding")),
            }
        }

        async fn send_request(&mut self, frame: &str) -> io::Result<()> {
            assert!(self.reply_at.is_none(), "second request while one is outstanding");
            self.reply_at = Some(self.now + self.delay);
            self.frames.push(frame.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_skips_while_reply_outstanding() {
        let mut transmitter = CommandTransmitter::new(DelayedChannel::new(2));
        let mut outcomes = Vec::new();

        for tick in 0..10 {
            transmitter.channel_mut().now = tick;
            let cmd = ClientCommand::new(0, tick, 0, 1.0, 2.0);
            outcomes.push(transmitter.send_command(&cmd).await.unwrap());
        }

        for (tick, outcome) in outcomes.iter().enumerate() {
            let expected = if tick % 2 == 0 {
                SendOutcome::Sent
            } else {
                SendOutcome::Skipped
            };
            assert_eq!(*outcome, expected, "tick {}", tick);
        }

        let stats = transmitter.stats();
        assert_eq!((stats.sent, stats.skipped, stats.acknowledged), (5, 5, 4));
        assert!(transmitter.is_outstanding());
    }

    #[tokio::test]
    async fn test_immediate_replies_never_skip() {
        let mut transmitter = CommandTransmitter::new(DelayedChannel::new(0));

        for tick in 0..5 {
            let cmd = ClientCommand::new(0, tick, 0, 0.0, 0.0);
            assert_eq!(transmitter.send_command(&cmd).await.unwrap(), SendOutcome::Sent);
        }
        assert_eq!(transmitter.stats().skipped, 0);
    }

    #[tokio::test]
    async fn test_unencodable_command_is_not_sent() {
        let mut transmitter = CommandTransmitter::new(DelayedChannel::new(0));
        let cmd = ClientCommand::new(0, 1, 0, 0.0, 0.0).with_event(Event::new("has space"));

        let err = transmitter.send_command(&cmd).await.unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
        assert!(!transmitter.is_outstanding());
        assert!(transmitter.channel().frames.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_outstanding_reply() {
        let mut transmitter = CommandTransmitter::new(DelayedChannel::new(5));
        transmitter
            .send_command(&ClientCommand::new(7, 1, 0, 0.0, 0.0))
            .await
            .unwrap();

        assert_ok!(transmitter.disconnect(7, Duration::from_millis(100)).await);
        assert!(!transmitter.is_outstanding());
        assert_eq!(transmitter.channel().frames.last().unwrap(), "DISCONNECT 7\n");
    }

    #[tokio::test]
    async fn test_tcp_channel_drains_split_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut channel = TcpRequestChannel::new(client);
        assert!(channel.try_recv_reply().unwrap().is_none());

        server.write_all(b"Ackno").await.unwrap();
        server.write_all(b"wledged\nAcknowledged\n").await.unwrap();

        assert_eq!(channel.recv_reply().await.unwrap(), "Acknowledged");
        assert_eq!(channel.recv_reply().await.unwrap(), "Acknowledged");

        drop(server);
        assert_eq!(
            channel.recv_reply().await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
