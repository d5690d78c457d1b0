//! Headway classification.

/// Gap to the vehicle in front, judged against [`Thresholds`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadwayResult {
    Nominal,
    TooFar,
    TooClose,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_headway: f64,
    pub max_headway: f64,
    pub crash: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            min_headway: 150.0,
            max_headway: 151.0,
            crash: 100.0,
        }
    }
}

impl Thresholds {
    /// Classify the gap `front - own`. Without a front sample there is
    /// nothing to keep distance from.
    pub fn classify(&self, own: f64, front: Option<f64>) -> HeadwayResult {
        let Some(front) = front else {
            return HeadwayResult::Nominal;
        };
        let headway = front - own;
        if headway <= self.crash {
            HeadwayResult::Crash
        } else if headway < self.min_headway {
            HeadwayResult::TooClose
        } else if headway <= self.max_headway {
            HeadwayResult::Nominal
        } else {
            HeadwayResult::TooFar
        }
    }
}
