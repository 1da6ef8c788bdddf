use async_trait::async_trait;
use companion_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("bad frame: {0}")]
    Frame(String),
}

impl From<ProtoError> for LinkError {
    fn from(e: ProtoError) -> Self {
        LinkError::Frame(e.to_string())
    }
}

impl LinkError {
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => LinkError::Refused(e.to_string()),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => LinkError::Closed,
            std::io::ErrorKind::TimedOut => LinkError::Timeout,
            _ => LinkError::Io(e),
        }
    }
}

/// Write half of a connection; one call per message frame.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Vec<u8>, LinkError>;
}

pub type Connection = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens a fresh connection to the ground server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, LinkError>;

    fn describe(&self) -> String;
}
