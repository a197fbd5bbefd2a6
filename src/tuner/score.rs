use std::collections::VecDeque;
use std::ops::{Add, Div, Sub};

/// Quantified state of the system at the end of one tuning window.
///
/// Every field is kept as `f64` so snapshots can be added, subtracted
/// (gradients) and divided (averages) uniformly.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemScores {
    /// Memtable write rate in MiB/s
    pub memtable_speed: f64,

    /// Active memtable bytes / total (active + sealed) memtable bytes
    pub active_size_ratio: f64,

    /// Amount of sealed memtables waiting to flush
    pub immutable_number: f64,

    /// Mean flush write bandwidth in MiB/s over the window
    pub flush_speed_avg: f64,

    /// Variance of the flush write bandwidth over the window
    pub flush_speed_var: f64,

    /// L0 run count relative to the slowdown trigger
    pub l0_occupancy: f64,

    /// Mean drop ratio of L0 compactions over the window
    pub l0_drop_ratio: f64,

    /// Pending compaction bytes relative to the soft limit
    pub estimate_compaction_bytes: f64,

    /// Disk traffic of flushes and compactions in MiB/s
    pub disk_bandwidth: f64,

    /// Flush-worker idle time relative to their share of the window
    pub flush_idle_time: f64,

    /// Compaction-worker idle time relative to their share of the window
    pub compaction_idle_time: f64,

    /// Amount of flushes in the window
    pub flush_numbers: f64,
}

/// Gradient between two score snapshots
pub type ScoreGradient = SystemScores;

macro_rules! fieldwise {
    ($lhs:expr, $rhs:expr, $op:tt) => {
        SystemScores {
            memtable_speed: $lhs.memtable_speed $op $rhs.memtable_speed,
            active_size_ratio: $lhs.active_size_ratio $op $rhs.active_size_ratio,
            immutable_number: $lhs.immutable_number $op $rhs.immutable_number,
            flush_speed_avg: $lhs.flush_speed_avg $op $rhs.flush_speed_avg,
            flush_speed_var: $lhs.flush_speed_var $op $rhs.flush_speed_var,
            l0_occupancy: $lhs.l0_occupancy $op $rhs.l0_occupancy,
            l0_drop_ratio: $lhs.l0_drop_ratio $op $rhs.l0_drop_ratio,
            estimate_compaction_bytes: $lhs.estimate_compaction_bytes $op $rhs.estimate_compaction_bytes,
            disk_bandwidth: $lhs.disk_bandwidth $op $rhs.disk_bandwidth,
            flush_idle_time: $lhs.flush_idle_time $op $rhs.flush_idle_time,
            compaction_idle_time: $lhs.compaction_idle_time $op $rhs.compaction_idle_time,
            flush_numbers: $lhs.flush_numbers $op $rhs.flush_numbers,
        }
    };
}

impl Add for SystemScores {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        fieldwise!(self, rhs, +)
    }
}

impl Sub for SystemScores {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        fieldwise!(self, rhs, -)
    }
}

impl Div<f64> for SystemScores {
    type Output = Self;

    fn div(self, rhs: f64) -> Self {
        SystemScores {
            memtable_speed: self.memtable_speed / rhs,
            active_size_ratio: self.active_size_ratio / rhs,
            immutable_number: self.immutable_number / rhs,
            flush_speed_avg: self.flush_speed_avg / rhs,
            flush_speed_var: self.flush_speed_var / rhs,
            l0_occupancy: self.l0_occupancy / rhs,
            l0_drop_ratio: self.l0_drop_ratio / rhs,
            estimate_compaction_bytes: self.estimate_compaction_bytes / rhs,
            disk_bandwidth: self.disk_bandwidth / rhs,
            flush_idle_time: self.flush_idle_time / rhs,
            compaction_idle_time: self.compaction_idle_time / rhs,
            flush_numbers: self.flush_numbers / rhs,
        }
    }
}

impl SystemScores {
    /// Raises each field of `self` to the maximum of itself and `current`,
    /// maintaining the historical peak snapshot
    pub fn update_max(&mut self, current: &Self) {
        self.memtable_speed = self.memtable_speed.max(current.memtable_speed);
        self.active_size_ratio = self.active_size_ratio.max(current.active_size_ratio);
        self.immutable_number = self.immutable_number.max(current.immutable_number);
        self.flush_speed_avg = self.flush_speed_avg.max(current.flush_speed_avg);
        self.flush_speed_var = self.flush_speed_var.max(current.flush_speed_var);
        self.l0_occupancy = self.l0_occupancy.max(current.l0_occupancy);
        self.l0_drop_ratio = self.l0_drop_ratio.max(current.l0_drop_ratio);
        self.estimate_compaction_bytes = self
            .estimate_compaction_bytes
            .max(current.estimate_compaction_bytes);
        self.disk_bandwidth = self.disk_bandwidth.max(current.disk_bandwidth);
        self.flush_idle_time = self.flush_idle_time.max(current.flush_idle_time);
        self.compaction_idle_time = self.compaction_idle_time.max(current.compaction_idle_time);
        self.flush_numbers = self.flush_numbers.max(current.flush_numbers);
    }
}

/// Fixed-capacity score history.
///
/// The tuner keeps a bounded window of past snapshots for gradient
/// calculations; old entries fall off the front.
pub(crate) struct ScoreRing {
    capacity: usize,
    items: VecDeque<SystemScores>,
}

impl ScoreRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, score: SystemScores) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }

        self.items.push_back(score);
    }

    pub fn oldest(&self) -> Option<&SystemScores> {
        self.items.front()
    }

    pub fn newest(&self) -> Option<&SystemScores> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_scores_add_adds() {
        let a = SystemScores {
            memtable_speed: 10.0,
            flush_numbers: 2.0,
            ..Default::default()
        };
        let b = SystemScores {
            memtable_speed: 5.0,
            flush_numbers: 1.0,
            ..Default::default()
        };

        let sum = a + b;
        assert!((sum.memtable_speed - 15.0).abs() < f64::EPSILON);
        assert!((sum.flush_numbers - 3.0).abs() < f64::EPSILON);

        let gradient = a - b;
        assert!((gradient.memtable_speed - 5.0).abs() < f64::EPSILON);

        let avg = (a + b) / 2.0;
        assert!((avg.memtable_speed - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_max_is_fieldwise() {
        let mut max = SystemScores {
            memtable_speed: 10.0,
            flush_speed_avg: 1.0,
            ..Default::default()
        };

        max.update_max(&SystemScores {
            memtable_speed: 5.0,
            flush_speed_avg: 3.0,
            ..Default::default()
        });

        assert!((max.memtable_speed - 10.0).abs() < f64::EPSILON);
        assert!((max.flush_speed_avg - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_ring_is_bounded() {
        let mut ring = ScoreRing::new(3);

        for idx in 0..10 {
            ring.push(SystemScores {
                memtable_speed: f64::from(idx),
                ..Default::default()
            });
        }

        assert_eq!(3, ring.len());
        assert!((ring.oldest().expect("not empty").memtable_speed - 7.0).abs() < f64::EPSILON);
        assert!((ring.newest().expect("not empty").memtable_speed - 9.0).abs() < f64::EPSILON);
    }
}
