//! Per-client command channel
//!
//! Each registered client gets a dedicated TCP endpoint at
//! `command_base_port + client_id`. The channel is strictly half-duplex: the
//! client writes one frame, the server writes exactly one reply line, and only
//! then may the client write again. Every request is answered, malformed ones
//! included, because a missing reply would leave the client waiting forever.

use crate::state::ServerState;
use log::{debug, info, trace, warn};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use sync_shared::wire::{self, Request};
use sync_shared::{ClientId, MAX_EVENTS_PER_COMMAND};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

/// Longest line accepted on a command channel
const MAX_LINE_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    WaitRequest,
    Process,
    Closed,
}

/// What handling one request did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Command applied to the client's player state
    Applied,
    /// Frame discarded; still acknowledged
    Ignored,
    /// Client said goodbye; acknowledge and close
    Disconnect,
}

async fn read_line_capped<R>(reader: &mut R, buf: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(MAX_LINE_BYTES).read_line(buf).await?;
    if read as u64 == MAX_LINE_BYTES && !buf.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line too long",
        ));
    }
    Ok(read)
}

/// Reads one request frame
///
/// A `CMD` header declares how many event lines follow; those are read as
/// part of the same frame. Returns `None` once the peer closes the stream.
///
/// A header declaring more than `MAX_EVENTS_PER_COMMAND` events is an
/// `InvalidData` error, since its event lines can't be skipped without
/// reading them and the frame boundary is lost.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = String::new();
    if read_line_capped(reader, &mut frame).await? == 0 {
        return Ok(None);
    }

    let tokens: Vec<&str> = frame.split_whitespace().collect();
    let event_lines = match tokens.as_slice() {
        ["CMD", _, _, _, _, _, count] => count.parse::<usize>().unwrap_or(0),
        _ => 0,
    };

    if event_lines > MAX_EVENTS_PER_COMMAND {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("command declares {} events", event_lines),
        ));
    }
    for _ in 0..event_lines {
        if read_line_capped(reader, &mut frame).await? == 0 {
            break;
        }
    }

    Ok(Some(frame))
}

/// Applies one decoded request on behalf of `client_id`
///
/// A channel only ever changes its own client's session, so frames naming
/// another client id are ignored.
pub async fn handle_request(
    state: &ServerState,
    client_id: ClientId,
    port: u16,
    text: &str,
) -> RequestOutcome {
    let request = match wire::decode_request(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Discarding malformed frame from client {}: {}", client_id, e);
            return RequestOutcome::Ignored;
        }
    };

    match request {
        Request::Command(cmd) if cmd.client_id != client_id => {
            warn!(
                "Client {} sent a command for client {}, ignoring",
                client_id, cmd.client_id
            );
            RequestOutcome::Ignored
        }
        Request::Command(cmd) => {
            {
                let mut sessions = state.sessions.lock().await;
                sessions.apply_command(client_id, port, &cmd, Instant::now());
            }

            let tick = cmd.tick;
            for event in cmd.events {
                state.events.raise(event, tick).await;
            }
            RequestOutcome::Applied
        }
        Request::Disconnect { client_id: id } if id != client_id => {
            warn!(
                "Client {} tried to disconnect client {}, ignoring",
                client_id, id
            );
            RequestOutcome::Ignored
        }
        Request::Disconnect { .. } => {
            state.sessions.lock().await.remove(client_id);
            info!("Client {} disconnected cleanly", client_id);
            RequestOutcome::Disconnect
        }
    }
}

async fn drop_session(state: &ServerState, client_id: ClientId) {
    state.sessions.lock().await.remove(client_id);
}

async fn accept_client(
    state: &ServerState,
    client_id: ClientId,
    listener: &TcpListener,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    let wait = state.config.idle_timeout;
    tokio::select! {
        accepted = timeout(wait, listener.accept()) => match accepted {
            Ok(Ok((stream, addr))) => {
                debug!("Client {} connected its command channel from {}", client_id, addr);
                Some(stream)
            }
            Ok(Err(e)) => {
                warn!("Accept failed for client {}: {}", client_id, e);
                None
            }
            Err(_) => {
                info!("Client {} never opened its command channel", client_id);
                None
            }
        },
        _ = shutdown.changed() => None,
    }
}

/// Serves one client's command channel until disconnect, transport failure
/// or shutdown. Returns the client id for bookkeeping.
pub async fn run_command_channel(
    state: Arc<ServerState>,
    client_id: ClientId,
    port: u16,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> ClientId {
    info!("Listening for client {} on port {}", client_id, port);

    let Some(stream) = accept_client(&state, client_id, &listener, &mut shutdown).await else {
        drop_session(&state, client_id).await;
        return client_id;
    };
    drop(listener);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for client {}: {}", client_id, e);
    }
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut channel_state = ChannelState::WaitRequest;

    while channel_state != ChannelState::Closed {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };

        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) => {
                info!("Client {} closed its command channel", client_id);
                drop_session(&state, client_id).await;
                break;
            }
            Err(e) => {
                warn!("Lost connection to client {}: {}", client_id, e);
                drop_session(&state, client_id).await;
                break;
            }
        };

        channel_state = ChannelState::Process;
        trace!("Client {} channel {:?}", client_id, channel_state);
        let outcome = handle_request(&state, client_id, port, &text).await;

        let reply = format!("{}\n", wire::ACK);
        if let Err(e) = writer.write_all(reply.as_bytes()).await {
            warn!("Lost connection to client {} ({})", client_id, e);
            drop_session(&state, client_id).await;
            break;
        }

        channel_state = match outcome {
            RequestOutcome::Disconnect => ChannelState::Closed,
            RequestOutcome::Applied | RequestOutcome::Ignored => ChannelState::WaitRequest,
        };
    }

    info!("Closed handler for client {}", client_id);
    client_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use sync_shared::{wire, ClientCommand, Event};

    fn state_with_clients(ids: &[ClientId]) -> ServerState {
        let state = ServerState::new(ServerConfig::default());
        let mut sessions = state.sessions.try_lock().unwrap();
        for id in ids {
            sessions.register(*id, 5556 + *id as u16, Instant::now());
        }
        drop(sessions);
        state
    }

    #[tokio::test]
    async fn test_command_updates_only_its_client() {
        let state = state_with_clients(&[0, 1]);

        let outcome = handle_request(&state, 0, 5556, "CMD 0 1 0 10.0 20.0 0").await;
        assert_eq!(outcome, RequestOutcome::Applied);

        let sessions = state.sessions.lock().await;
        let player = sessions.player(0).unwrap();
        assert_eq!((player.x, player.y, player.tick), (10.0, 20.0, 1));
        assert!(sessions.player(1).is_none());
    }

    #[tokio::test]
    async fn test_malformed_command_leaves_state_untouched() {
        let state = state_with_clients(&[0]);
        handle_request(&state, 0, 5556, "CMD 0 1 0 10.0 20.0 0").await;

        let outcome = handle_request(&state, 0, 5556, "CMD abc").await;
        assert_eq!(outcome, RequestOutcome::Ignored);

        let sessions = state.sessions.lock().await;
        let player = sessions.player(0).unwrap();
        assert_eq!((player.x, player.y), (10.0, 20.0));
    }

    #[tokio::test]
    async fn test_foreign_client_id_is_ignored() {
        let state = state_with_clients(&[0, 1]);

        let outcome = handle_request(&state, 0, 5556, "CMD 1 1 0 10.0 20.0 0").await;
        assert_eq!(outcome, RequestOutcome::Ignored);
        assert!(state.sessions.lock().await.player(1).is_none());

        let outcome = handle_request(&state, 0, 5556, "DISCONNECT 1").await;
        assert_eq!(outcome, RequestOutcome::Ignored);
        assert!(state.sessions.lock().await.contains(1));
    }

    #[tokio::test]
    async fn test_embedded_events_are_scheduled_at_command_tick() {
        let state = state_with_clients(&[0]);
        let cmd = ClientCommand::new(0, 7, 0, 1.0, 1.0)
            .with_event(Event::new("InputPressed").with_param("playerId", 0).with_param("key", 32))
            .with_event(Event::new("Collision").with_param("playerId", 0).with_param("objectId", 2));
        let text = wire::encode_command(&cmd).unwrap();

        assert_eq!(handle_request(&state, 0, 5556, &text).await, RequestOutcome::Applied);
        assert_eq!(state.events.pending().await, 2);

        let mut sessions = state.sessions.lock().await;
        assert_eq!(state.events.dispatch(6, &mut sessions).await, 0);
        assert_eq!(state.events.dispatch(7, &mut sessions).await, 2);
    }

    #[tokio::test]
    async fn test_events_beyond_horizon_are_dropped() {
        let state = state_with_clients(&[0]);
        let cmd = ClientCommand::new(0, u32::MAX - 3, 0, 1.0, 1.0)
            .with_event(Event::new("Death").with_param("playerId", 0));
        let text = wire::encode_command(&cmd).unwrap();

        assert_eq!(handle_request(&state, 0, 5556, &text).await, RequestOutcome::Applied);
        assert_eq!(state.events.pending().await, 0);
        assert_eq!(
            state.sessions.lock().await.player(0).unwrap().tick,
            u32::MAX - 3
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let state = state_with_clients(&[4]);

        let outcome = handle_request(&state, 4, 5560, &wire::encode_disconnect(4)).await;
        assert_eq!(outcome, RequestOutcome::Disconnect);
        assert!(!state.sessions.lock().await.contains(4));
    }

    #[tokio::test]
    async fn test_read_frame_collects_event_lines() {
        let input = b"CMD 0 1 0 1 1 2\nJump 0 0\nDeath 1 1 playerId INT 0\nDISCONNECT 0\n";
        let mut reader = BufReader::new(&input[..]);

        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame, "CMD 0 1 0 1 1 2\nJump 0 0\nDeath 1 1 playerId INT 0\n");
        assert_eq!(wire::decode_command(&frame).unwrap().events.len(), 2);

        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame, "DISCONNECT 0\n");

        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_malformed_header_is_single_line() {
        let input = b"CMD abc\nCMD 0 1 0 1 1 0\n";
        let mut reader = BufReader::new(&input[..]);

        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), "CMD abc\n");
        assert_eq!(
            read_frame(&mut reader).await.unwrap().unwrap(),
            "CMD 0 1 0 1 1 0\n"
        );
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_event_count() {
        let mut input = format!("CMD 0 1 0 1 1 {}\n", MAX_EVENTS_PER_COMMAND + 1);
        for _ in 0..=MAX_EVENTS_PER_COMMAND {
            input.push_str("Jump 0 0\n");
        }
        let mut reader = BufReader::new(input.as_bytes());

        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_endless_line() {
        let input = vec![b'x'; MAX_LINE_BYTES as usize + 10];
        let mut reader = BufReader::new(&input[..]);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
