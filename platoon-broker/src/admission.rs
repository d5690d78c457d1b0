//! Serial admission: IDs, the lead's commands, the table broadcast and the
//! start positions.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use platoon_protocol::broker::{start_position, ADMISSION_MARKER, START_POSITION_REQUEST};
use platoon_protocol::{
    AdmissionCommand, PeerAddr, PeerTable, VehicleId, BOOTSTRAP_TIMEOUT, MAX_VEHICLES,
};
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, RegistrationError};

/// One registered vehicle connection
#[derive(Debug)]
pub struct Lane {
    pub id: VehicleId,
    pub addr: PeerAddr,
    pub stream: TcpStream,
}

impl Lane {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }
}

pub struct Broker {
    listener: TcpListener,
    local: SocketAddr,
}

impl Broker {
    pub fn bind(host: &str, port: u16) -> Result<Self, AdmissionError> {
        let addr = format!("{}:{}", host, port);
        let bind_error = |source: io::Error| AdmissionError::Bind {
            addr: addr.clone(),
            source,
        };
        let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(bind_error)?.collect();
        let listener = TcpListener::bind(&candidates[..]).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;
        info!("broker listening on {}", local);
        Ok(Broker { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept one connection and give it `id`
    fn register(&self, id: VehicleId) -> Result<Lane, RegistrationError> {
        let (mut stream, peer) = self.listener.accept().map_err(RegistrationError::Accept)?;
        debug!("connection from {}", peer);
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(BOOTSTRAP_TIMEOUT))?;
        stream.set_write_timeout(Some(BOOTSTRAP_TIMEOUT))?;

        let mut marker = [0u8; 1];
        let marker = match stream.read(&mut marker)? {
            0 => None,
            _ => Some(marker[0]),
        };
        if marker != Some(ADMISSION_MARKER) {
            return Err(RegistrationError::Marker(marker));
        }

        let mut lane = Lane {
            id,
            addr: PeerAddr::from(peer),
            stream,
        };
        lane.send(id.to_string().as_bytes())?;
        info!("vehicle {} registered from {}", id, lane.addr);
        Ok(lane)
    }

    /// Run admission until the lead closes it, then broadcast the table.
    ///
    /// The listener is gone once this returns, so later connection attempts
    /// are refused.
    pub fn admit(self) -> Result<Roster, AdmissionError> {
        let mut lanes = Vec::new();

        let mut lead = loop {
            match self.register(VehicleId::LEAD) {
                Ok(lane) => break lane,
                Err(e) => warn!("lead registration failed: {}", e),
            }
        };
        lead.stream.set_read_timeout(None).map_err(AdmissionError::Lead)?;

        loop {
            let mut command = [0u8; 1];
            match lead.stream.read(&mut command) {
                Ok(0) => return Err(AdmissionError::LeadDisconnected),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(AdmissionError::Lead(e)),
            }

            match AdmissionCommand::from_byte(command[0]) {
                Some(AdmissionCommand::Extend) if lanes.len() + 1 >= MAX_VEHICLES => {
                    info!("max reached ({} vehicles), ignoring extend", MAX_VEHICLES);
                }
                Some(AdmissionCommand::Extend) => {
                    let id = VehicleId((lanes.len() + 2) as u32);
                    match self.register(id) {
                        Ok(lane) => lanes.push(lane),
                        Err(e) => warn!("registration of vehicle {} failed: {}", id, e),
                    }
                }
                Some(AdmissionCommand::Close) => break,
                None => debug!("ignoring admission byte {:#04x}", command[0]),
            }
        }

        drop(self.listener);
        lead.stream
            .set_read_timeout(Some(BOOTSTRAP_TIMEOUT))
            .map_err(AdmissionError::Lead)?;
        lanes.insert(0, lead);

        let table: PeerTable = lanes.iter().map(|l| (l.id, l.addr.clone())).collect();
        let json = table.to_json();
        info!("admission closed, broadcasting table of {} vehicle(s)", table.len());
        for lane in &mut lanes {
            if let Err(e) = lane.send(&json) {
                warn!("table not delivered to vehicle {}: {}", lane.id, e);
            }
        }
        Ok(Roster { table, lanes })
    }
}

/// The frozen platoon after admission
#[derive(Debug)]
pub struct Roster {
    pub table: PeerTable,
    lanes: Vec<Lane>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Answer each vehicle's start position request, in ID order
    pub fn seed_start_positions(&mut self) {
        let total = self.lanes.len();
        for lane in &mut self.lanes {
            let mut request = [0u8; 4];
            if let Err(e) = lane.stream.read_exact(&mut request) {
                warn!("vehicle {} sent no start position request: {}", lane.id, e);
                continue;
            }
            if &request[..] != START_POSITION_REQUEST {
                warn!("vehicle {} sent {:?} instead of a start position request", lane.id, request);
                continue;
            }
            let position = start_position(total, lane.id);
            match lane.send(position.to_string().as_bytes()) {
                Ok(()) => debug!("vehicle {} starts at {}", lane.id, position),
                Err(e) => warn!("start position not delivered to vehicle {}: {}", lane.id, e),
            }
        }
    }

    pub fn into_lanes(self) -> Vec<Lane> {
        self.lanes
    }
}
