use std::io;

use platoon_protocol::{ProtocolError, VehicleId};
use thiserror::Error;

/// Failure while talking to the broker before the simulation starts
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("broker unreachable at {addr}: {source}")]
    BrokerUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("broker exchange failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("vehicle {0} is missing from the peer table")]
    NotInTable(VehicleId),
    #[error("admission aborted")]
    AdmissionAborted,
}

/// Failure while linking to chain neighbours
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no link port for vehicle {0}")]
    NoPort(VehicleId),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot reach vehicle {peer}: {source}")]
    Connect {
        peer: VehicleId,
        #[source]
        source: io::Error,
    },
    #[error("vehicle {peer} never connected: {source}")]
    Accept {
        peer: VehicleId,
        #[source]
        source: io::Error,
    },
    #[error("cannot configure link: {0}")]
    Socket(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Bootstrap(_) => 1,
            AgentError::Link(_) => 2,
        }
    }

    /// One-line status for the terminal
    pub fn status(&self) -> &'static str {
        match self {
            AgentError::Bootstrap(BootstrapError::BrokerUnreachable { .. }) => "broker unreachable",
            AgentError::Bootstrap(BootstrapError::Protocol(e))
                if e.is_timeout() || matches!(e, ProtocolError::ConnectionClosed) =>
            {
                "broker unreachable"
            }
            AgentError::Bootstrap(BootstrapError::AdmissionAborted) => "admission aborted",
            AgentError::Bootstrap(_) => "bootstrap failed",
            AgentError::Link(_) => "link establishment failed",
        }
    }
}
