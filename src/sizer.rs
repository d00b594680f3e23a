//! Adaptive task sizing
//!
//! Workflows with a target runtime get their `tasksize` recomputed from the
//! measured per-unit wall time, so tasks converge on the target no matter
//! how fast the units actually process.

use tracing::debug;

/// Minimum relative change before a new size is adopted.
const HYSTERESIS: f64 = 0.1;

/// Compute a new target units-per-task, if one is warranted.
///
/// `unit_time` is the mean observed seconds per unit, measured between the
/// end of stage-in and the end of the epilogue. Returns `None` when the
/// measurement is unusable or the recomputed size is within 10% of the
/// current one.
pub fn better_task_size(target_runtime: i64, unit_time: f64, current: i64) -> Option<i64> {
    if !unit_time.is_finite() || unit_time <= 0.0 || current <= 0 {
        return None;
    }

    let better = ((target_runtime as f64) / unit_time).ceil().max(1.0) as i64;
    let change = (better - current).abs() as f64 / current as f64;

    debug!(current, better, change, "task size evaluation");

    if change > HYSTERESIS {
        Some(better)
    } else {
        None
    }
}
