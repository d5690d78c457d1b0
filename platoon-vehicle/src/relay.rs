//! Reaction to user commands and neighbour frames.
//!
//! Every handler first acts on the local motion state and only then relays,
//! so a relayed frame always follows the one that caused it.

use std::sync::Arc;

use platoon_protocol::ControlMessage;
use tracing::{debug, error, info, trace, warn};

use crate::context::{Direction, SharedState, TerminationReason};
use crate::headway::HeadwayResult;
use crate::input::Command;
use crate::links::Neighbors;

#[derive(Clone)]
pub struct Relay {
    state: Arc<SharedState>,
    neighbors: Neighbors,
}

impl Relay {
    pub fn new(state: Arc<SharedState>, neighbors: Neighbors) -> Self {
        Relay { state, neighbors }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn neighbors(&self) -> &Neighbors {
        &self.neighbors
    }

    /// Send toward one neighbour. A failed write counts as losing that link.
    pub fn send(&self, direction: Direction, msg: &ControlMessage) {
        if let Err(e) = self.neighbors.send(direction, msg) {
            if self.state.is_terminated() {
                debug!("{} link write after shutdown: {}", direction, e);
                return;
            }
            warn!("write to {} link failed: {}", direction, e);
            self.link_lost(direction);
        }
    }

    fn send_both(&self, msg: &ControlMessage) {
        self.send(Direction::Front, msg);
        self.send(Direction::Back, msg);
    }

    /// Act on a key pressed while running
    pub fn apply_command(&self, command: Command) {
        let params = &self.state.params;
        match command {
            Command::Accelerate => {
                let headway = {
                    let mut motion = self.state.motion();
                    motion.accelerate(params.user_accel_step, params);
                    info!("speed {:.2}", motion.speed);
                    motion.headway(params)
                };
                if self.neighbors.has(Direction::Front) && headway == HeadwayResult::TooClose {
                    self.send(Direction::Front, &ControlMessage::Accelerate);
                }
            }
            Command::Decelerate => {
                let headway = {
                    let mut motion = self.state.motion();
                    motion.decelerate(params.decel_step);
                    info!("speed {:.2}", motion.speed);
                    motion.headway(params)
                };
                if self.neighbors.has(Direction::Front) && headway == HeadwayResult::TooFar {
                    self.send(Direction::Front, &ControlMessage::Decelerate);
                }
            }
            Command::Stop => {
                self.send_both(&ControlMessage::Stop);
                self.state.motion().stop();
                info!("stopped");
            }
            Command::Quit => {
                if self.state.terminate(TerminationReason::UserQuit) {
                    self.send_both(&ControlMessage::Quit);
                }
            }
        }
    }

    /// Act on a frame received from the neighbour on side `from`
    pub fn handle_frame(&self, from: Direction, msg: ControlMessage) {
        let params = &self.state.params;
        match msg {
            ControlMessage::Position(x) => match from {
                Direction::Front => {
                    trace!("<- front {}", x);
                    self.state.motion().front_position = Some(x);
                }
                Direction::Back => trace!("ignoring position {} from back", x),
            },
            ControlMessage::Accelerate | ControlMessage::Decelerate => {
                debug!("<- {} {:?}", from, msg);
                if from == Direction::Front {
                    debug!("ignoring {:?} from front", msg);
                    return;
                }
                {
                    let mut motion = self.state.motion();
                    if msg == ControlMessage::Accelerate {
                        motion.accelerate(params.user_accel_step, params);
                    } else {
                        motion.decelerate(params.decel_step);
                    }
                }
                self.send(Direction::Front, &msg);
            }
            ControlMessage::Stop => {
                debug!("<- {} Stop", from);
                self.state.motion().stop();
                info!("stopped by {} neighbour", from);
                self.send(from.opposite(), &msg);
            }
            ControlMessage::Quit => {
                debug!("<- {} Quit", from);
                if self.state.terminate(TerminationReason::PeerQuit(from)) {
                    self.send(from.opposite(), &msg);
                }
            }
        }
    }

    /// The link on `side` closed or failed: behave as if it sent Quit
    pub fn link_lost(&self, side: Direction) {
        if self.state.terminate(TerminationReason::LinkLost(side)) {
            warn!("{} link lost", side);
            self.send(side.opposite(), &ControlMessage::Quit);
        } else {
            debug!("{} link closed during shutdown", side);
        }
    }

    pub fn broker_lost(&self) {
        if self.state.terminate(TerminationReason::BrokerLost) {
            error!("broker connection lost");
            self.send_both(&ControlMessage::Quit);
        }
    }

    /// One main loop iteration. A crash quits both neighbours.
    pub fn drive(&self, jitter: f64) -> HeadwayResult {
        let (headway, gap) = {
            let mut motion = self.state.motion();
            let headway = motion.step(jitter, &self.state.params);
            (headway, motion.gap())
        };
        if headway == HeadwayResult::Crash {
            let headway = gap.unwrap_or_default();
            if self.state.terminate(TerminationReason::Crash { headway }) {
                error!("CAR CRASH: headway {:.2}", headway);
                self.send_both(&ControlMessage::Quit);
            }
        }
        headway
    }
}
