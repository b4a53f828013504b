//! Dense output of past steps.
//!
//! The history stores accepted points `(t, y, f)` and interpolates between neighbours,
//! with a cubic Hermite polynomial when best interpolation is on and linearly otherwise.
//! Delay equations read their delayed states from it, and pages expose it through their
//! historic value accessors. Two points with the same time mark a jump (after an event
//! action or a reinitialization); interpolation never blends across one.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
struct Point {
    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
}

/// Interpolating record of past states.
#[derive(Debug, Clone, Default)]
pub struct History {
    points: VecDeque<Point>,
    hermite: bool,
}

impl History {
    pub fn new(hermite: bool) -> Self {
        History {
            points: VecDeque::new(),
            hermite,
        }
    }

    pub fn set_hermite(&mut self, hermite: bool) {
        self.hermite = hermite;
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Time of the oldest point.
    pub fn start(&self) -> Option<f64> {
        self.points.front().map(|p| p.t)
    }

    /// Time of the newest point.
    pub fn end(&self) -> Option<f64> {
        self.points.back().map(|p| p.t)
    }

    /// Appends an accepted point. Points must arrive in non-decreasing time.
    pub fn push(&mut self, t: f64, y: &[f64], f: &[f64]) {
        if let Some(last) = self.points.back_mut() {
            // Re-recording the newest point replaces it
            if last.t == t && last.y == y {
                last.f.copy_from_slice(f);
                return;
            }
        }
        self.points.push_back(Point {
            t,
            y: y.to_vec(),
            f: f.to_vec(),
        });
    }

    /// Drops points older than `t_min`, keeping the one that still brackets it.
    pub fn prune(&mut self, t_min: f64) {
        while self.points.len() > 2 && self.points[1].t <= t_min {
            self.points.pop_front();
        }
    }

    /// Interpolates the full state at `t` into `out`.
    ///
    /// Returns false if `t` lies outside the recorded range.
    pub fn interpolate(&self, t: f64, out: &mut [f64]) -> bool {
        let Some((a, b)) = self.bracket(t) else {
            return false;
        };
        for (j, value) in out.iter_mut().enumerate() {
            *value = self.value(a, b, j, t);
        }
        true
    }

    /// Interpolates component `index` at `t`.
    pub fn component(&self, t: f64, index: usize) -> Option<f64> {
        let (a, b) = self.bracket(t)?;
        (index < a.y.len()).then(|| self.value(a, b, index, t))
    }

    /// Linear extrapolation from the newest point, for times past the end.
    pub fn extrapolate(&self, t: f64, out: &mut [f64]) -> bool {
        let Some(last) = self.points.back() else {
            return false;
        };
        let dt = t - last.t;
        for ((value, y), f) in out.iter_mut().zip(&last.y).zip(&last.f) {
            *value = y + dt * f;
        }
        true
    }

    fn bracket(&self, t: f64) -> Option<(&Point, &Point)> {
        let first = self.points.front()?;
        let last = self.points.back()?;
        if !(first.t..=last.t).contains(&t) {
            return None;
        }
        if self.points.len() == 1 {
            return Some((first, first));
        }
        // Last point at or before t; on a jump this picks the post-jump copy
        let upper = self.points.partition_point(|p| p.t <= t);
        let a = upper.saturating_sub(1);
        let b = (a + 1).min(self.points.len() - 1);
        Some((&self.points[a], &self.points[b]))
    }

    fn value(&self, a: &Point, b: &Point, j: usize, t: f64) -> f64 {
        let dt = b.t - a.t;
        if dt == 0.0 {
            return a.y[j];
        }
        let s = (t - a.t) / dt;
        if self.hermite {
            hermite(s, dt, a.y[j], a.f[j], b.y[j], b.f[j])
        } else {
            a.y[j] + s * (b.y[j] - a.y[j])
        }
    }
}

/// Cubic Hermite interpolation on a unit parameter `s` over a step of length `dt`.
pub(crate) fn hermite(s: f64, dt: f64, y0: f64, f0: f64, y1: f64, f1: f64) -> f64 {
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    h00 * y0 + h10 * dt * f0 + h01 * y1 + h11 * dt * f1
}
