//! Links to the vehicles directly in front and behind.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use platoon_protocol::{
    ControlMessage, FrameReader, FrameWriter, PeerConnection, PeerListener, PeerTable,
    ProtocolError, Transport, VehicleId,
};
use tracing::{debug, info, trace, warn};

use crate::config::Timing;
use crate::context::Direction;
use crate::error::LinkError;

/// A neighbour that stops draining its socket fails writes after this long
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub type LinkReader = FrameReader<Box<dyn Read + Send>>;
pub type LinkWriter = FrameWriter<Box<dyn Transport>>;

/// One live neighbour link
pub struct PeerLink {
    pub peer: VehicleId,
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl PeerLink {
    pub fn new(
        peer: VehicleId,
        reader: impl Read + Send + 'static,
        writer: impl Transport + 'static,
    ) -> Self {
        PeerLink {
            peer,
            reader: FrameReader::new(Box::new(reader) as Box<dyn Read + Send>),
            writer: FrameWriter::new(Box::new(writer) as Box<dyn Transport>),
        }
    }

    fn from_connection(
        peer: VehicleId,
        conn: PeerConnection,
        read_timeout: Duration,
    ) -> io::Result<Self> {
        let (reader, writer) = conn.split(read_timeout, WRITE_TIMEOUT)?;
        let reader: TcpStream = reader.into_inner();
        let writer: TcpStream = writer.into_inner();
        Ok(PeerLink::new(peer, reader, writer))
    }
}

/// Predecessor and successor links, either of which may be absent
#[derive(Default)]
pub struct LinkSet {
    pub front: Option<PeerLink>,
    pub back: Option<PeerLink>,
}

impl LinkSet {
    /// Separate the read halves, which go to the listener loops, from the
    /// shared write halves.
    pub fn split(self) -> (Neighbors, Option<(VehicleId, LinkReader)>, Option<(VehicleId, LinkReader)>) {
        let (front_writer, front_reader) = match self.front {
            Some(link) => (Some(link.writer), Some((link.peer, link.reader))),
            None => (None, None),
        };
        let (back_writer, back_reader) = match self.back {
            Some(link) => (Some(link.writer), Some((link.peer, link.reader))),
            None => (None, None),
        };
        (Neighbors::new(front_writer, back_writer), front_reader, back_reader)
    }
}

/// Write halves of both links.
///
/// Each writer sits behind its own lock so frames on one link never
/// interleave. Sending toward an absent neighbour does nothing.
#[derive(Clone, Default)]
pub struct Neighbors {
    front: Option<Arc<Mutex<LinkWriter>>>,
    back: Option<Arc<Mutex<LinkWriter>>>,
}

impl Neighbors {
    pub fn new(front: Option<LinkWriter>, back: Option<LinkWriter>) -> Self {
        Neighbors {
            front: front.map(|w| Arc::new(Mutex::new(w))),
            back: back.map(|w| Arc::new(Mutex::new(w))),
        }
    }

    fn writer(&self, direction: Direction) -> Option<&Arc<Mutex<LinkWriter>>> {
        match direction {
            Direction::Front => self.front.as_ref(),
            Direction::Back => self.back.as_ref(),
        }
    }

    pub fn has(&self, direction: Direction) -> bool {
        self.writer(direction).is_some()
    }

    pub fn send(&self, direction: Direction, msg: &ControlMessage) -> Result<(), ProtocolError> {
        let Some(writer) = self.writer(direction) else {
            return Ok(());
        };
        let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match msg {
            ControlMessage::Position(_) => trace!("-> {} {:?}", direction, msg),
            _ => debug!("-> {} {:?}", direction, msg),
        }
        writer.send(msg)
    }

    /// Shut both links down
    pub fn close_all(&self) {
        for (direction, writer) in [(Direction::Front, &self.front), (Direction::Back, &self.back)] {
            if let Some(writer) = writer {
                let writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Err(e) = writer.close() {
                    debug!("closing {} link: {}", direction, e);
                }
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|source| LinkError::Resolve {
        host: host.to_string(),
        source,
    })?;
    addrs.next().ok_or_else(|| LinkError::Resolve {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no address"),
    })
}

fn peer_port(broker_port: u16, id: VehicleId) -> Result<u16, LinkError> {
    id.link_port(broker_port).ok_or(LinkError::NoPort(id))
}

/// Link to the chain neighbours named in `table`.
///
/// The listener for the successor is bound before connecting to the
/// predecessor, so every vehicle in the chain can link at the same time.
pub fn establish_links(
    table: &PeerTable,
    id: VehicleId,
    broker_port: u16,
    timing: &Timing,
) -> Result<LinkSet, LinkError> {
    let start = Instant::now();
    let remaining = |limit: Duration| limit.saturating_sub(start.elapsed());

    let listener = match (table.successor_of(id), table.get(id)) {
        (Some(_), Some(own)) => {
            let addr = resolve(&own.host, peer_port(broker_port, id)?)?;
            let listener = PeerListener::bind(addr).map_err(|source| LinkError::Bind {
                addr: addr.to_string(),
                source,
            })?;
            info!("waiting for vehicle {} on {}", id.behind(), listener.local_addr());
            Some(listener)
        }
        _ => None,
    };

    let front = match table.predecessor_of(id) {
        Some((peer, addr)) => {
            let target = resolve(&addr.host, peer_port(broker_port, peer)?)?;
            info!("connecting to vehicle {} at {}", peer, target);
            let conn = PeerConnection::connect_with_backoff(
                target,
                &timing.backoff,
                timing.link_timeout,
            )
            .map_err(|source| LinkError::Connect { peer, source })?;
            info!("linked to vehicle {} (front)", peer);
            Some(PeerLink::from_connection(peer, conn, timing.poll)?)
        }
        None => None,
    };

    let back = match (listener, table.successor_of(id)) {
        (Some(listener), Some((peer, _))) => {
            let conn = listener
                .accept_within(timing.poll, timing.link_timeout.map(remaining))
                .map_err(|source| LinkError::Accept { peer, source })?;
            debug!("vehicle {} linked from {}", peer, conn.peer_addr());
            info!("linked to vehicle {} (back)", peer);
            Some(PeerLink::from_connection(peer, conn, timing.poll)?)
        }
        _ => None,
    };

    if front.is_none() && back.is_none() {
        warn!("vehicle {} has no neighbours", id);
    }
    Ok(LinkSet { front, back })
}
