//! Registration with the broker, up to the start of the simulation.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use platoon_protocol::broker::{
    parse_start_position, ACK, ADMISSION_MARKER, START_POSITION_REQUEST,
};
use platoon_protocol::socket::is_timeout;
use platoon_protocol::{AdmissionCommand, PeerTable, ProtocolError, Report, VehicleId, MAX_VEHICLES};
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::error::BootstrapError;
use crate::input::AdmissionKey;
use crate::runtime::ReportSink;

/// The broker connection during bootstrap
pub struct BrokerSession {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    timeout: Duration,
    settle: Duration,
}

impl BrokerSession {
    pub fn connect(host: &str, port: u16, timing: &Timing) -> Result<Self, BootstrapError> {
        let addr = format!("{}:{}", host, port);
        let unreachable = |source: io::Error| BootstrapError::BrokerUnreachable {
            addr: addr.clone(),
            source,
        };

        let candidates = (host, port).to_socket_addrs().map_err(unreachable)?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timing.bootstrap_timeout) {
                Ok(stream) => {
                    info!("connected to broker at {}", candidate);
                    return Self::from_stream(stream, timing).map_err(unreachable);
                }
                Err(e) => {
                    debug!("broker at {}: {}", candidate, e);
                    last_err = e;
                }
            }
        }
        Err(unreachable(last_err))
    }

    fn from_stream(stream: TcpStream, timing: &Timing) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timing.bootstrap_timeout))?;
        let writer = stream.try_clone()?;
        Ok(BrokerSession {
            reader: BufReader::new(stream),
            writer,
            timeout: timing.bootstrap_timeout,
            settle: timing.token_settle,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one unterminated decimal token.
    ///
    /// The token ends at the first byte `accept` rejects, at EOF, or once
    /// the broker has been silent for the settle interval.
    fn read_token<F: Fn(u8) -> bool>(&mut self, accept: F) -> Result<String, ProtocolError> {
        let mut token = Vec::new();
        let result: Result<(), ProtocolError> = loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) && !token.is_empty() => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            if buf.is_empty() {
                break if token.is_empty() {
                    Err(ProtocolError::ConnectionClosed)
                } else {
                    Ok(())
                };
            }
            let len = buf.iter().take_while(|&&b| accept(b)).count();
            let ended = len < buf.len();
            token.extend_from_slice(&buf[..len]);
            self.reader.consume(len);
            if ended {
                break Ok(());
            }
            if let Err(e) = self.reader.get_ref().set_read_timeout(Some(self.settle)) {
                break Err(e.into());
            }
        };
        self.reader.get_ref().set_read_timeout(Some(self.timeout))?;
        result?;
        Ok(String::from_utf8_lossy(&token).into_owned())
    }

    /// Register and receive an ID
    pub fn request_identity(&mut self) -> Result<VehicleId, BootstrapError> {
        self.write(&[ADMISSION_MARKER])?;
        let token = self.read_token(|b| b.is_ascii_digit())?;
        let id = token.parse::<VehicleId>()?;
        info!("registered as vehicle {}", id);
        Ok(id)
    }

    pub fn send_admission(&mut self, command: AdmissionCommand) -> Result<(), BootstrapError> {
        debug!("-> broker {:?}", command);
        self.write(&[command.as_byte()])?;
        Ok(())
    }

    /// Wait, without a deadline, for the peer table and check it names `id`
    pub fn receive_peer_table(&mut self, id: VehicleId) -> Result<PeerTable, BootstrapError> {
        self.reader.get_ref().set_read_timeout(None).map_err(ProtocolError::from)?;
        let table = PeerTable::read_from(&mut self.reader)?;
        self.reader
            .get_ref()
            .set_read_timeout(Some(self.timeout))
            .map_err(ProtocolError::from)?;

        info!("peer table with {} vehicle(s)", table.len());
        for (peer, addr) in table.iter() {
            debug!("  {} at {}", peer, addr);
        }
        if !table.contains(id) {
            return Err(BootstrapError::NotInTable(id));
        }
        Ok(table)
    }

    pub fn request_start_position(&mut self) -> Result<f64, BootstrapError> {
        self.write(START_POSITION_REQUEST)?;
        let token = self.read_token(|b| b.is_ascii_digit() || b == b'.' || b == b'-')?;
        let position = parse_start_position(&token)?;
        info!("start position {}", position);
        Ok(position)
    }

    /// Hand the connection over to the report loop
    pub fn into_reporter(self, poll: Duration) -> Result<BrokerReporter, BootstrapError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(poll))
            .map_err(ProtocolError::from)?;
        Ok(BrokerReporter {
            reader: self.reader,
            writer: self.writer,
            ack: Vec::with_capacity(ACK.len()),
        })
    }
}

/// Let the lead decide when admission ends.
///
/// `c` admits one more vehicle, `s` closes admission and starts the run.
pub fn admission_prompt(
    session: &mut BrokerSession,
    keys: &Receiver<u8>,
) -> Result<(), BootstrapError> {
    let mut admitted = 1;
    info!("lead vehicle: press c to admit another vehicle, s to start");
    loop {
        let key = keys.recv().map_err(|_| BootstrapError::AdmissionAborted)?;
        match AdmissionKey::from_key(key) {
            Some(AdmissionKey::Extend) if admitted >= MAX_VEHICLES => {
                info!("max reached ({} vehicles)", MAX_VEHICLES);
            }
            Some(AdmissionKey::Extend) => {
                session.send_admission(AdmissionCommand::Extend)?;
                admitted += 1;
                info!("admitting vehicle {}", admitted);
            }
            Some(AdmissionKey::Close) => {
                session.send_admission(AdmissionCommand::Close)?;
                info!("admission closed with {} vehicle(s)", admitted);
                return Ok(());
            }
            Some(AdmissionKey::Abort) => return Err(BootstrapError::AdmissionAborted),
            None => debug!("ignoring key {:#04x}", key),
        }
    }
}

/// Report connection to the broker while running
pub struct BrokerReporter {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    ack: Vec<u8>,
}

impl ReportSink for BrokerReporter {
    fn send_report(&mut self, report: &Report) -> Result<(), ProtocolError> {
        let bytes = report.to_json()?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    fn await_ack(&mut self) -> Result<(), ProtocolError> {
        while self.ack.len() < ACK.len() {
            let mut buf = [0u8; 3];
            let want = ACK.len() - self.ack.len();
            match self.reader.read(&mut buf[..want]) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => self.ack.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let ack = std::mem::take(&mut self.ack);
        if ack != ACK {
            return Err(ProtocolError::UnexpectedAck(ack));
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), ProtocolError> {
        let bytes = Report::SENTINEL.to_json()?;
        let sent = self.writer.write_all(&bytes).and_then(|_| self.writer.flush());
        if let Err(e) = self.writer.shutdown(Shutdown::Both) {
            warn!("closing broker connection: {}", e);
        }
        sent?;
        info!("left the platoon");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use platoon_protocol::PeerAddr;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Scripted broker: runs `script` on the first accepted connection
    fn broker<F>(script: F) -> (u16, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });
        (port, handle)
    }

    fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn one_vehicle_table(port: u16) -> PeerTable {
        [(
            VehicleId(1),
            PeerAddr {
                host: "127.0.0.1".to_string(),
                port,
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_lead_bootstrap_sequence() {
        let (port, script) = broker(|mut s| {
            assert_eq!(read_exactly(&mut s, 1), b"0");
            s.write_all(b"1").unwrap();
            assert_eq!(read_exactly(&mut s, 1), b"c");
            assert_eq!(read_exactly(&mut s, 1), b"s");
            s.write_all(&one_vehicle_table(5000).to_json()).unwrap();
            assert_eq!(read_exactly(&mut s, 4), b"xpos");
            s.write_all(b"100").unwrap();
            let report = Report {
                position: 100.0,
                speed: 0.0,
            };
            let n = report.to_json().unwrap().len();
            assert_eq!(Report::from_json(&read_exactly(&mut s, n)).unwrap(), report);
            s.write_all(b"ACK").unwrap();
            let n = Report::SENTINEL.to_json().unwrap().len();
            assert!(Report::from_json(&read_exactly(&mut s, n)).unwrap().is_sentinel());
        });

        let (tx, keys) = mpsc::channel();
        for key in b"xcs" {
            tx.send(*key).unwrap();
        }

        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        let id = session.request_identity().unwrap();
        assert!(id.is_lead());
        admission_prompt(&mut session, &keys).unwrap();
        let table = session.receive_peer_table(id).unwrap();
        assert_eq!(table, one_vehicle_table(5000));
        assert_eq!(session.request_start_position().unwrap(), 100.0);

        let mut reporter = session.into_reporter(Duration::from_millis(50)).unwrap();
        reporter
            .send_report(&Report {
                position: 100.0,
                speed: 0.0,
            })
            .unwrap();
        let acked = loop {
            match reporter.await_ack() {
                Err(e) if e.is_timeout() => continue,
                other => break other,
            }
        };
        acked.unwrap();
        reporter.leave().unwrap();
        script.join().unwrap();
    }

    #[test]
    fn test_missing_own_id_is_fatal() {
        let (port, script) = broker(|mut s| {
            assert_eq!(read_exactly(&mut s, 1), b"0");
            s.write_all(b"2").unwrap();
            s.write_all(&one_vehicle_table(5000).to_json()).unwrap();
        });
        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        let id = session.request_identity().unwrap();
        assert_eq!(id, VehicleId(2));
        assert!(matches!(
            session.receive_peer_table(id),
            Err(BootstrapError::NotInTable(VehicleId(2)))
        ));
        script.join().unwrap();
    }

    #[test]
    fn test_start_position_split_across_writes() {
        let (port, script) = broker(|mut s| {
            read_exactly(&mut s, 1);
            s.write_all(b"2").unwrap();
            assert_eq!(read_exactly(&mut s, 4), b"xpos");
            s.write_all(b"13").unwrap();
            thread::sleep(Duration::from_millis(30));
            s.write_all(b"00").unwrap();
        });
        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        assert_eq!(session.request_identity().unwrap(), VehicleId(2));
        assert_eq!(session.request_start_position().unwrap(), 1300.0);
        script.join().unwrap();
    }

    #[test]
    fn test_silent_broker_times_out() {
        let (done, wait) = mpsc::channel::<()>();
        let (port, script) = broker(move |_s| {
            let _ = wait.recv();
        });
        let timing = Timing {
            bootstrap_timeout: Duration::from_millis(200),
            ..Timing::default()
        };
        let mut session = BrokerSession::connect("127.0.0.1", port, &timing).unwrap();
        let err = AgentError::from(session.request_identity().unwrap_err());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.status(), "broker unreachable");
        drop(done);
        script.join().unwrap();
    }

    #[test]
    fn test_garbage_identity() {
        let (port, script) = broker(|mut s| {
            read_exactly(&mut s, 1);
            s.write_all(b"hello").unwrap();
        });
        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        assert!(matches!(
            session.request_identity(),
            Err(BootstrapError::Protocol(ProtocolError::InvalidIdentity(_)))
        ));
        script.join().unwrap();
    }

    #[test]
    fn test_unreachable_broker() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        assert!(matches!(
            BrokerSession::connect("127.0.0.1", port, &Timing::default()),
            Err(BootstrapError::BrokerUnreachable { .. })
        ));
    }

    #[test]
    fn test_admission_stops_at_max() {
        let (port, script) = broker(|mut s| {
            read_exactly(&mut s, 1);
            s.write_all(b"1").unwrap();
            let commands = read_exactly(&mut s, MAX_VEHICLES);
            let mut expected = vec![b'c'; MAX_VEHICLES - 1];
            expected.push(b's');
            assert_eq!(commands, expected);
        });
        let (tx, keys) = mpsc::channel();
        for _ in 0..12 {
            tx.send(b'c').unwrap();
        }
        tx.send(b'S').unwrap();

        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        session.request_identity().unwrap();
        admission_prompt(&mut session, &keys).unwrap();
        script.join().unwrap();
    }

    #[test]
    fn test_ctrl_c_aborts_admission() {
        let (port, script) = broker(|mut s| {
            read_exactly(&mut s, 1);
            s.write_all(b"1").unwrap();
        });
        let (tx, keys) = mpsc::channel();
        tx.send(0x03).unwrap();
        let mut session = BrokerSession::connect("127.0.0.1", port, &Timing::default()).unwrap();
        session.request_identity().unwrap();
        assert!(matches!(
            admission_prompt(&mut session, &keys),
            Err(BootstrapError::AdmissionAborted)
        ));
        script.join().unwrap();
    }
}
