//! Error types for the Weft node.
use thiserror::Error;

/// Stream- and send-level failures. Contained by the messages service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("malformed frame: {0}")] MalformedFrame(String),
    #[error("frame too large: {size} > {max}")] FrameTooLarge { size: usize, max: usize },
    #[error("stream read timed out")] StreamTimeout,
    #[error("connection ineligible: {0}")] ConnectionIneligible(String),
    #[error("send failed: {0}")] SendFailure(String),
    #[error("send timed out")] SendTimeout,
    #[error("protocol registration failed: {0}")] Registration(String),
    #[error("i/o: {0}")] Io(String),
    #[error("swarm task stopped")] SwarmStopped,
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        // Length-delimited framing reports oversize frames as InvalidData.
        match err.kind() {
            std::io::ErrorKind::InvalidData => NetworkError::MalformedFrame(err.to_string()),
            _ => NetworkError::Io(err.to_string()),
        }
    }
}

/// Fatal failures while bringing a node up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("identity load failure: {0}")] IdentityLoad(String),
    #[error("composition failure: {0}")] Composition(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("backend: {0}")] Backend(String),
    #[error("encode: {0}")] Encode(String),
    #[error("decode record {key}: {reason}")] Decode { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Startup(#[from] StartupError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error("config: {0}")] Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_data_maps_to_malformed_frame() {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "frame size too big");
        assert!(matches!(NetworkError::from(err), NetworkError::MalformedFrame(_)));
    }

    #[test]
    fn other_io_maps_to_io() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(NetworkError::from(err), NetworkError::Io("gone".into()));
    }

    #[test]
    fn node_error_wraps_startup_transparently() {
        let err: NodeError = StartupError::IdentityLoad("bad key".into()).into();
        assert_eq!(err.to_string(), "identity load failure: bad key");
    }
}
