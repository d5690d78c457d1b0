//! Broker wire format: identities, the peer table, and lane reports.
//!
//! The broker exchange is unframed. Bytes in each direction, in order:
//!
//! | Step | Vehicle → broker | Broker → vehicle |
//! |------|------------------|------------------|
//! | register | `0` | decimal ID, e.g. `3` |
//! | admission (lead only) | `c` (extend) / `s` (close) | |
//! | table | | `{"1": ["10.0.0.5", 51234], ...}` |
//! | start | `xpos` | decimal coordinate, e.g. `250` |
//! | report | `{"0": 412.5, "1": 0.3}` | `ACK` |
//! | leave | `{"0": -9, "1": -9}` | |

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Admission option marker sent before the broker assigns an ID
pub const ADMISSION_MARKER: u8 = b'0';

/// Literal start position request
pub const START_POSITION_REQUEST: &[u8] = b"xpos";

/// Literal report acknowledgment
pub const ACK: &[u8] = b"ACK";

/// Spacing between seeded start positions
pub const START_SPACING: i64 = 150;

/// Ordinal vehicle identity; 1 is the lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub u32);

impl VehicleId {
    pub const LEAD: VehicleId = VehicleId(1);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_lead(self) -> bool {
        self == Self::LEAD
    }

    /// The ID directly in front, if any could exist
    pub fn ahead(self) -> Option<VehicleId> {
        self.0.checked_sub(1).filter(|&n| n > 0).map(VehicleId)
    }

    /// The ID directly behind
    pub fn behind(self) -> VehicleId {
        VehicleId(self.0.saturating_add(1))
    }

    /// Port on which this vehicle listens for its successor
    pub fn link_port(self, broker_port: u16) -> Option<u16> {
        u16::try_from(self.0)
            .ok()
            .and_then(|n| broker_port.checked_add(n))
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VehicleId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(VehicleId(n)),
            _ => Err(ProtocolError::InvalidIdentity(s.to_string())),
        }
    }
}

/// Network address of a registered vehicle, as the broker saw it.
///
/// Serialized as a `[host, port]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl From<(String, u16)> for PeerAddr {
    fn from((host, port): (String, u16)) -> Self {
        PeerAddr { host, port }
    }
}

impl From<PeerAddr> for (String, u16) {
    fn from(addr: PeerAddr) -> Self {
        (addr.host, addr.port)
    }
}

impl From<std::net::SocketAddr> for PeerAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        PeerAddr {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Frozen ID → address table broadcast by the broker.
///
/// There is no way to modify a table once built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerTable {
    entries: BTreeMap<VehicleId, PeerAddr>,
}

impl FromIterator<(VehicleId, PeerAddr)> for PeerTable {
    fn from_iter<I: IntoIterator<Item = (VehicleId, PeerAddr)>>(iter: I) -> Self {
        PeerTable {
            entries: iter.into_iter().collect(),
        }
    }
}

impl PeerTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: VehicleId) -> Option<&PeerAddr> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: VehicleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VehicleId, &PeerAddr)> {
        self.entries.iter().map(|(id, addr)| (*id, addr))
    }

    /// Entry of the vehicle directly in front of `id`
    pub fn predecessor_of(&self, id: VehicleId) -> Option<(VehicleId, &PeerAddr)> {
        let ahead = id.ahead()?;
        self.get(ahead).map(|addr| (ahead, addr))
    }

    /// Entry of the vehicle directly behind `id`
    pub fn successor_of(&self, id: VehicleId) -> Option<(VehicleId, &PeerAddr)> {
        let behind = id.behind();
        self.get(behind).map(|addr| (behind, addr))
    }

    /// Encode as the broadcast JSON object (no terminator)
    pub fn to_json(&self) -> Vec<u8> {
        // Only strings and integers inside, cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::InvalidTable)
    }

    /// Read exactly one table from a stream.
    ///
    /// The object is unterminated, so this consumes bytes up to and
    /// including its closing brace and nothing after it.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, ProtocolError> {
        let mut de = serde_json::Deserializer::from_reader(reader);
        PeerTable::deserialize(&mut de).map_err(|e| json_stream_error(e, ProtocolError::InvalidTable))
    }
}

/// Map a serde_json error on a live stream onto the protocol error space
pub(crate) fn json_stream_error(
    e: serde_json::Error,
    invalid: fn(serde_json::Error) -> ProtocolError,
) -> ProtocolError {
    if e.is_eof() {
        ProtocolError::ConnectionClosed
    } else if e.is_io() {
        ProtocolError::from(std::io::Error::from(e))
    } else {
        invalid(e)
    }
}

/// Admission control byte sent by the lead vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCommand {
    /// Accept one more vehicle
    Extend,
    /// Freeze and broadcast the peer table
    Close,
}

impl AdmissionCommand {
    pub fn as_byte(self) -> u8 {
        match self {
            AdmissionCommand::Extend => b'c',
            AdmissionCommand::Close => b's',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'c' => Some(AdmissionCommand::Extend),
            b's' => Some(AdmissionCommand::Close),
            _ => None,
        }
    }
}

/// Periodic position/speed report from a vehicle to the broker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "0")]
    pub position: f64,
    #[serde(rename = "1")]
    pub speed: f64,
}

impl Report {
    /// Sent once when a vehicle leaves so the broker can retire its lane
    pub const SENTINEL: Report = Report {
        position: -9.0,
        speed: -9.0,
    };

    pub fn is_sentinel(&self) -> bool {
        self.position < 0.0 && self.speed < 0.0
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::InvalidReport)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::InvalidReport)
    }
}

/// Seeded start coordinate of vehicle `id` in a platoon of `total`.
///
/// The lead is furthest ahead; each following vehicle is one spacing back.
pub fn start_position(total: usize, id: VehicleId) -> i64 {
    let total = total as i64;
    let k = i64::from(id.get());
    (total - k + 1) * START_SPACING - 50
}

/// Parse a start position sent by the broker
pub fn parse_start_position(text: &str) -> Result<f64, ProtocolError> {
    match text.trim().parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => Err(ProtocolError::InvalidStartPosition(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16) -> PeerAddr {
        PeerAddr {
            host: host.to_string(),
            port,
        }
    }

    fn three() -> PeerTable {
        [
            (VehicleId(1), addr("10.0.0.1", 50001)),
            (VehicleId(2), addr("10.0.0.2", 50002)),
            (VehicleId(3), addr("10.0.0.3", 50003)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_table_json_shape() {
        let json = String::from_utf8(three().to_json()).unwrap();
        assert_eq!(
            json,
            r#"{"1":["10.0.0.1",50001],"2":["10.0.0.2",50002],"3":["10.0.0.3",50003]}"#
        );
    }

    #[test]
    fn test_table_parses_python_output() {
        let table =
            PeerTable::from_json(br#"{"1": ["127.0.0.1", 40312], "2": ["127.0.0.1", 40318]}"#)
                .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(VehicleId(2)), Some(&addr("127.0.0.1", 40318)));
    }

    #[test]
    fn test_table_neighbours() {
        let table = three();
        assert_eq!(table.predecessor_of(VehicleId(1)), None);
        assert_eq!(table.successor_of(VehicleId(1)).map(|(id, _)| id), Some(VehicleId(2)));
        assert_eq!(table.predecessor_of(VehicleId(2)).map(|(id, _)| id), Some(VehicleId(1)));
        assert_eq!(table.successor_of(VehicleId(2)).map(|(id, _)| id), Some(VehicleId(3)));
        assert_eq!(table.successor_of(VehicleId(3)), None);
    }

    #[test]
    fn test_read_table_leaves_trailing_bytes() {
        let mut data = three().to_json();
        data.extend(b"250");
        let mut reader = &data[..];
        let table = PeerTable::read_from(&mut reader).unwrap();
        assert_eq!(table, three());
        assert_eq!(reader, b"250");
    }

    #[test]
    fn test_read_table_truncated_is_closed() {
        let data = br#"{"1": ["127.0.0.1", 4"#;
        assert!(matches!(
            PeerTable::read_from(&data[..]),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_read_table_malformed() {
        assert!(matches!(
            PeerTable::read_from(&b"[1, 2]"[..]),
            Err(ProtocolError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_report_json() {
        let report = Report {
            position: 412.5,
            speed: 0.25,
        };
        assert_eq!(report.to_json().unwrap(), br#"{"0":412.5,"1":0.25}"#.to_vec());
        assert_eq!(Report::from_json(br#"{"0": 412.5, "1": 0.25}"#).unwrap(), report);
        assert_eq!(
            Report::from_json(br#"{"0": -9, "1": -9}"#).unwrap(),
            Report::SENTINEL
        );
        assert!(Report::SENTINEL.is_sentinel());
        assert!(!report.is_sentinel());
    }

    #[test]
    fn test_start_positions() {
        assert_eq!(start_position(3, VehicleId(1)), 400);
        assert_eq!(start_position(3, VehicleId(2)), 250);
        assert_eq!(start_position(3, VehicleId(3)), 100);
        assert_eq!(start_position(1, VehicleId(1)), 100);
        assert_eq!(parse_start_position("250").unwrap(), 250.0);
        assert!(parse_start_position("xpos").is_err());
    }

    #[test]
    fn test_vehicle_id() {
        assert_eq!("3".parse::<VehicleId>().unwrap(), VehicleId(3));
        assert!("0".parse::<VehicleId>().is_err());
        assert!("".parse::<VehicleId>().is_err());
        assert_eq!(VehicleId(1).ahead(), None);
        assert_eq!(VehicleId(4).ahead(), Some(VehicleId(3)));
        assert_eq!(VehicleId(2).link_port(6789), Some(6791));
        assert_eq!(VehicleId(2).link_port(u16::MAX), None);
    }

    #[test]
    fn test_admission_bytes() {
        assert_eq!(AdmissionCommand::from_byte(b'c'), Some(AdmissionCommand::Extend));
        assert_eq!(AdmissionCommand::from_byte(b's'), Some(AdmissionCommand::Close));
        assert_eq!(AdmissionCommand::from_byte(b'x'), None);
        assert_eq!(AdmissionCommand::Close.as_byte(), b's');
    }
}
