//! The concurrent activities of a linked vehicle.
//!
//! One thread each for key input, the front link, the back link, the
//! position stream to the back and broker reports; the headway loop runs on
//! the calling thread. Every loop checks the termination flag at least once
//! per poll interval and all threads are joined before the links close.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use platoon_protocol::{ControlMessage, ProtocolError, Report, VehicleId};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::Timing;
use crate::context::{Direction, SharedState, TerminationReason};
use crate::input::Command;
use crate::links::{LinkReader, LinkSet};
use crate::relay::Relay;

/// Undecodable frames in a row before a link counts as failed
const MAX_DECODE_FAILURES: u32 = 3;

/// Where a running vehicle sends its reports
pub trait ReportSink: Send {
    fn send_report(&mut self, report: &Report) -> Result<(), ProtocolError>;

    /// Wait for the acknowledgment of the last report. A read deadline
    /// surfaces as an error for which [`ProtocolError::is_timeout`] holds,
    /// and the wait can be resumed by calling again.
    fn await_ack(&mut self) -> Result<(), ProtocolError>;

    /// Send the leave report and close
    fn leave(&mut self) -> Result<(), ProtocolError>;
}

pub struct Runtime {
    relay: Relay,
    front: Option<(VehicleId, LinkReader)>,
    back: Option<(VehicleId, LinkReader)>,
    timing: Timing,
}

impl Runtime {
    pub fn new(state: Arc<SharedState>, links: LinkSet, timing: Timing) -> Self {
        let (neighbors, front, back) = links.split();
        Runtime {
            relay: Relay::new(state, neighbors),
            front,
            back,
            timing,
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        self.relay.state()
    }

    /// Run until something terminates the vehicle, then shut down.
    pub fn run<S, G>(self, keys: Receiver<u8>, reporter: S, rng: G) -> TerminationReason
    where
        S: ReportSink + 'static,
        G: Rng,
    {
        let Runtime {
            relay,
            front,
            back,
            timing,
        } = self;
        let state = relay.state().clone();
        info!("vehicle {} running", state.id);

        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        {
            let relay = relay.clone();
            workers.push(("input", thread::spawn(move || input_loop(relay, keys, timing))));
        }
        if let Some((peer, reader)) = front {
            let relay = relay.clone();
            workers.push((
                "front link",
                thread::spawn(move || link_loop(relay, Direction::Front, peer, reader)),
            ));
        }
        if let Some((peer, reader)) = back {
            let relay_in = relay.clone();
            workers.push((
                "back link",
                thread::spawn(move || link_loop(relay_in, Direction::Back, peer, reader)),
            ));
            let relay_out = relay.clone();
            workers.push((
                "position",
                thread::spawn(move || position_loop(relay_out, timing)),
            ));
        }
        let reporting = {
            let relay = relay.clone();
            thread::spawn(move || report_loop(relay, reporter, timing))
        };

        headway_loop(&relay, timing, rng);

        for (name, handle) in workers {
            if handle.join().is_err() {
                error!("{} thread panicked", name);
            }
        }
        let reporter = reporting.join();

        relay.neighbors().close_all();
        match reporter {
            Ok(mut reporter) => {
                if let Err(e) = reporter.leave() {
                    debug!("leave report not delivered: {}", e);
                }
            }
            Err(_) => error!("report thread panicked"),
        }

        let reason = state
            .termination
            .reason()
            .unwrap_or(TerminationReason::UserQuit);
        let motion = state.snapshot();
        info!(
            "vehicle {} stopped at {:.2} (speed {:.2}): {}",
            state.id, motion.position, motion.speed, reason
        );
        reason
    }
}

fn headway_loop<G: Rng>(relay: &Relay, timing: Timing, mut rng: G) {
    let state = relay.state();
    let mut next = Instant::now();
    while !state.is_terminated() {
        relay.drive(rng.gen::<f64>());

        next += timing.tick;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

fn input_loop(relay: Relay, keys: Receiver<u8>, timing: Timing) {
    let state = relay.state().clone();
    let mut open = true;
    while !state.is_terminated() {
        if !open {
            thread::sleep(timing.poll);
            continue;
        }
        match keys.recv_timeout(timing.poll) {
            Ok(key) => match Command::from_key(key) {
                Some(command) => {
                    debug!("key {:?}", command);
                    relay.apply_command(command);
                }
                None => debug!("ignoring key {:#04x}", key),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("no more keys");
                open = false;
            }
        }
    }
}

fn link_loop(relay: Relay, side: Direction, peer: VehicleId, mut reader: LinkReader) {
    let state = relay.state().clone();
    let mut failures = 0;
    while !state.is_terminated() {
        match reader.poll() {
            Ok(Some(msg)) => {
                failures = 0;
                relay.handle_frame(side, msg);
                if msg == ControlMessage::Quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(ProtocolError::InvalidPayload(payload)) => {
                failures += 1;
                warn!(
                    "discarding frame {:?} from vehicle {} ({}/{})",
                    payload, peer, failures, MAX_DECODE_FAILURES
                );
                if failures >= MAX_DECODE_FAILURES {
                    relay.link_lost(side);
                    break;
                }
            }
            Err(e) => {
                if !state.is_terminated() {
                    debug!("{} link to vehicle {}: {}", side, peer, e);
                }
                relay.link_lost(side);
                break;
            }
        }
    }
}

fn position_loop(relay: Relay, timing: Timing) {
    let state = relay.state().clone();
    while !state.is_terminated() {
        let position = state.snapshot().position;
        relay.send(Direction::Back, &ControlMessage::Position(position));
        thread::sleep(timing.position_interval);
    }
}

fn report_loop<S: ReportSink>(relay: Relay, mut reporter: S, timing: Timing) -> S {
    let state = relay.state().clone();
    'reports: while !state.is_terminated() {
        let motion = state.snapshot();
        let report = Report {
            position: motion.position,
            speed: motion.speed,
        };
        if let Err(e) = reporter.send_report(&report) {
            debug!("report failed: {}", e);
            relay.broker_lost();
            break;
        }
        loop {
            match reporter.await_ack() {
                Ok(()) => break,
                Err(e) if e.is_timeout() => {
                    if state.is_terminated() {
                        break 'reports;
                    }
                }
                Err(e) => {
                    debug!("no acknowledgment: {}", e);
                    relay.broker_lost();
                    break 'reports;
                }
            }
        }
        thread::sleep(timing.report_interval);
    }
    reporter
}
