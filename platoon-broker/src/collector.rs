//! Lane collector: one reader per vehicle, acknowledging each report.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufReader, Write};
use std::net::Shutdown;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use platoon_protocol::broker::ACK;
use platoon_protocol::{Report, VehicleId, BOOTSTRAP_TIMEOUT};
use tracing::{debug, info, trace, warn};

use crate::admission::Lane;
use crate::error::AdmissionError;

#[derive(Debug, Default)]
struct Board {
    latest: BTreeMap<VehicleId, Report>,
    active: usize,
}

/// Latest report per lane and the number of lanes still active
#[derive(Debug, Default)]
pub struct LaneBoard {
    board: Mutex<Board>,
    changed: Condvar,
}

impl LaneBoard {
    pub fn new(active: usize) -> Self {
        LaneBoard {
            board: Mutex::new(Board {
                latest: BTreeMap::new(),
                active,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update(&self, id: VehicleId, report: Report) {
        self.lock().latest.insert(id, report);
    }

    pub fn retire(&self, id: VehicleId) {
        let mut board = self.lock();
        board.active = board.active.saturating_sub(1);
        info!("vehicle {} inactive, {} lane(s) left", id, board.active);
        self.changed.notify_all();
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn latest(&self) -> BTreeMap<VehicleId, Report> {
        self.lock().latest.clone()
    }

    /// Block until every lane is inactive or `timeout` passes.
    /// Returns the number of lanes still active.
    pub fn wait_idle(&self, timeout: Duration) -> usize {
        let board = self.lock();
        let (board, _) = self
            .changed
            .wait_timeout_while(board, timeout, |b| b.active > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        board.active
    }
}

/// Positions and headways of adjacent lanes, front to back
pub fn format_snapshot(latest: &BTreeMap<VehicleId, Report>) -> String {
    let mut line = String::new();
    let mut front: Option<(VehicleId, f64)> = None;
    for (id, report) in latest {
        let _ = write!(line, "[{} at {:.2} v={:.2}", id, report.position, report.speed);
        if let Some((ahead, position)) = front {
            if ahead.behind() == *id {
                let _ = write!(line, " gap={:.2}", position - report.position);
            }
        }
        line.push_str("] ");
        front = Some((*id, report.position));
    }
    line.trim_end().to_string()
}

fn serve_lane(lane: Lane, board: &LaneBoard) {
    let Lane { id, stream, .. } = lane;
    let result = stream
        .set_read_timeout(Some(BOOTSTRAP_TIMEOUT))
        .and_then(|_| stream.try_clone());
    let mut writer = match result {
        Ok(writer) => writer,
        Err(e) => {
            warn!("vehicle {}: {}", id, e);
            board.retire(id);
            return;
        }
    };

    let reports = serde_json::Deserializer::from_reader(BufReader::new(stream)).into_iter::<Report>();
    for report in reports {
        match report {
            Ok(report) if report.is_sentinel() => {
                debug!("vehicle {} left", id);
                break;
            }
            Ok(report) => {
                trace!("<- vehicle {} {:?}", id, report);
                board.update(id, report);
                if let Err(e) = writer.write_all(ACK).and_then(|_| writer.flush()) {
                    warn!("vehicle {}: acknowledgment failed: {}", id, e);
                    break;
                }
            }
            Err(e) if e.is_eof() => {
                debug!("vehicle {} closed its connection", id);
                break;
            }
            Err(e) if e.is_io() => {
                warn!("vehicle {}: read failed: {}", id, e);
                break;
            }
            Err(e) => {
                warn!("vehicle {}: bad report: {}", id, e);
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown(Shutdown::Both) {
        debug!("vehicle {}: closing lane: {}", id, e);
    }
    board.retire(id);
}

/// Read every lane until all are inactive, logging a snapshot every
/// `snapshot_interval`. Returns the last report of each vehicle.
pub fn collect(
    lanes: Vec<Lane>,
    snapshot_interval: Duration,
) -> Result<BTreeMap<VehicleId, Report>, AdmissionError> {
    let board = Arc::new(LaneBoard::new(lanes.len()));
    let mut handles = Vec::with_capacity(lanes.len());
    for lane in lanes {
        let board = board.clone();
        let name = format!("lane-{}", lane.id);
        match thread::Builder::new().name(name).spawn(move || serve_lane(lane, &board)) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // The lanes already running end when their vehicles leave
                return Err(AdmissionError::Spawn(e));
            }
        }
    }

    let mut last_snapshot = Instant::now();
    while board.wait_idle(snapshot_interval) > 0 {
        if last_snapshot.elapsed() >= snapshot_interval {
            let latest = board.latest();
            if !latest.is_empty() {
                info!("{}", format_snapshot(&latest));
            }
            last_snapshot = Instant::now();
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            warn!("lane thread panicked");
        }
    }
    info!("all vehicles inactive");
    Ok(board.latest())
}
