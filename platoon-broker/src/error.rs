use std::io;

use thiserror::Error;

/// Fatal broker failure
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("lead vehicle disconnected during admission")]
    LeadDisconnected,
    #[error("lead vehicle connection failed: {0}")]
    Lead(#[source] io::Error),
    #[error("cannot start lane collector: {0}")]
    Spawn(#[source] io::Error),
}

/// A single registration that did not complete. The ID it would have taken
/// goes to the next registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("expected admission marker, got {0:?}")]
    Marker(Option<u8>),
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
}
