//! Speed and position of one vehicle.

use crate::config::MotionParams;
use crate::headway::HeadwayResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    pub position: f64,
    /// Always within `[0, max_speed]`
    pub speed: f64,
    /// Last position sample from the vehicle in front
    pub front_position: Option<f64>,
}

impl MotionState {
    pub fn new(position: f64) -> Self {
        MotionState {
            position,
            speed: 0.0,
            front_position: None,
        }
    }

    pub fn accelerate(&mut self, step: f64, params: &MotionParams) {
        self.speed = (self.speed + step).min(params.max_speed);
    }

    pub fn decelerate(&mut self, step: f64) {
        self.speed = (self.speed - step).max(0.0);
    }

    pub fn stop(&mut self) {
        self.speed = 0.0;
    }

    pub fn headway(&self, params: &MotionParams) -> HeadwayResult {
        params.thresholds.classify(self.position, self.front_position)
    }

    /// Gap to the front vehicle, if known
    pub fn gap(&self) -> Option<f64> {
        self.front_position.map(|front| front - self.position)
    }

    /// Integrate one tick. `jitter` is a sample of U(0,1).
    pub fn advance(&mut self, jitter: f64, params: &MotionParams) {
        let gain = self.speed * jitter.clamp(0.0, 1.0) / params.jitter_divisor;
        self.position += gain;
    }

    /// One main loop iteration: judge the gap, correct speed, then move.
    ///
    /// On a crash nothing moves and the caller is expected to terminate.
    pub fn step(&mut self, jitter: f64, params: &MotionParams) -> HeadwayResult {
        let headway = self.headway(params);
        match headway {
            HeadwayResult::Crash => return headway,
            HeadwayResult::TooFar => self.accelerate(params.accel_step, params),
            HeadwayResult::TooClose => self.decelerate(params.decel_step),
            HeadwayResult::Nominal => {}
        }
        self.advance(jitter, params);
        headway
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_speed_bounds() {
        let params = MotionParams::default();
        let mut state = MotionState::new(0.0);
        state.decelerate(0.1);
        assert_eq!(state.speed, 0.0);
        for _ in 0..20 {
            state.accelerate(0.1, &params);
        }
        assert_eq!(state.speed, params.max_speed);
        state.stop();
        assert_eq!(state.speed, 0.0);
    }

    #[test]
    fn test_step_corrects_speed() {
        let params = MotionParams::default();
        let mut state = MotionState {
            position: 0.0,
            speed: 0.5,
            front_position: Some(200.0),
        };
        assert_eq!(state.step(0.0, &params), HeadwayResult::TooFar);
        assert!((state.speed - 0.55).abs() < 1e-12);

        state.front_position = Some(120.0);
        assert_eq!(state.step(0.0, &params), HeadwayResult::TooClose);
        assert!((state.speed - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_step_crash_holds_position() {
        let params = MotionParams::default();
        let mut state = MotionState {
            position: 250.0,
            speed: 0.8,
            front_position: Some(300.0),
        };
        assert_eq!(state.step(1.0, &params), HeadwayResult::Crash);
        assert_eq!(state.position, 250.0);
    }

    #[test]
    fn test_advance_uses_jitter() {
        let params = MotionParams::default();
        let mut state = MotionState::new(10.0);
        state.speed = 1.0;
        state.advance(0.5, &params);
        assert!((state.position - (10.0 + 0.5 / 50_000.0)).abs() < 1e-12);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Accelerate,
        UserAccelerate,
        Decelerate,
        Stop,
        Step(f64, Option<f64>),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Accelerate),
            Just(Op::UserAccelerate),
            Just(Op::Decelerate),
            Just(Op::Stop),
            (0.0f64..1.0, proptest::option::of(-500.0f64..500.0))
                .prop_map(|(jitter, gap)| Op::Step(jitter, gap)),
        ]
    }

    proptest! {
        #[test]
        fn speed_stays_in_bounds(max_speed in 0.1f64..5.0, ops in proptest::collection::vec(op(), 0..200)) {
            let params = MotionParams { max_speed, ..MotionParams::default() };
            let mut state = MotionState::new(0.0);
            for op in ops {
                let before = state.position;
                match op {
                    Op::Accelerate => state.accelerate(params.accel_step, &params),
                    Op::UserAccelerate => state.accelerate(params.user_accel_step, &params),
                    Op::Decelerate => state.decelerate(params.decel_step),
                    Op::Stop => state.stop(),
                    Op::Step(jitter, gap) => {
                        state.front_position = gap.map(|g| state.position + g);
                        state.step(jitter, &params);
                    }
                }
                prop_assert!(state.speed >= 0.0);
                prop_assert!(state.speed <= max_speed);
                prop_assert!(state.position >= before);
            }
        }
    }
}
