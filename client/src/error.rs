use std::io;
use sync_shared::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected: {0}")]
    NotConnected(#[from] io::Error),
    #[error("server is full")]
    ServerFull,
    #[error("unexpected handshake reply: {0}")]
    Handshake(WireError),
    #[error("could not encode command: {0}")]
    Encode(WireError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("assigned port {port} is below command base port {base}")]
    BadPort { port: u16, base: u16 },
}
