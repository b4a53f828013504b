//! Single-step formulas.
//!
//! Explicit Runge-Kutta methods are driven by Butcher tableaux; embedded pairs also
//! produce a per-component error estimate. Velocity Verlet has its own formula over the
//! interleaved `(position, velocity)` layout.

/// Butcher tableau of an explicit Runge-Kutta method.
pub(crate) struct Tableau {
    pub c: &'static [f64],
    /// Strictly lower triangular rows; row `i` has `i` entries.
    pub a: &'static [&'static [f64]],
    /// Weights of the propagated solution.
    pub b: &'static [f64],
    /// Weights of the embedded solution, for error estimation.
    pub b_low: Option<&'static [f64]>,
    /// Order used for the step controller exponent.
    pub order: u32,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

pub(crate) const EULER: Tableau = Tableau {
    c: &[0.0],
    a: &[&[]],
    b: &[1.0],
    b_low: None,
    order: 1,
};

// Midpoint rule: one Euler half step, then the full step with the midpoint rate
pub(crate) const EULER_RICHARDSON: Tableau = Tableau {
    c: &[0.0, 0.5],
    a: &[&[], &[0.5]],
    b: &[0.0, 1.0],
    b_low: None,
    order: 2,
};

pub(crate) const RK4: Tableau = Tableau {
    c: &[0.0, 0.5, 0.5, 1.0],
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    b_low: None,
    order: 4,
};

pub(crate) const CASH_KARP: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 3.0 / 5.0, 1.0, 7.0 / 8.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[3.0 / 10.0, -9.0 / 10.0, 6.0 / 5.0],
        &[-11.0 / 54.0, 5.0 / 2.0, -70.0 / 27.0, 35.0 / 27.0],
        &[
            1631.0 / 55296.0,
            175.0 / 512.0,
            575.0 / 13824.0,
            44275.0 / 110592.0,
            253.0 / 4096.0,
        ],
    ],
    b: &[
        37.0 / 378.0,
        0.0,
        250.0 / 621.0,
        125.0 / 594.0,
        0.0,
        512.0 / 1771.0,
    ],
    b_low: Some(&[
        2825.0 / 27648.0,
        0.0,
        18575.0 / 48384.0,
        13525.0 / 55296.0,
        277.0 / 14336.0,
        1.0 / 4.0,
    ]),
    order: 4,
};

pub(crate) const DORMAND_PRINCE: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    b_low: Some(&[
        5179.0 / 57600.0,
        0.0,
        7571.0 / 16695.0,
        393.0 / 640.0,
        -92097.0 / 339200.0,
        187.0 / 2100.0,
        1.0 / 40.0,
    ]),
    order: 4,
};

/// Stage buffers reused across steps.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stages {
    k: Vec<Vec<f64>>,
    y: Vec<f64>,
}

impl Stages {
    fn prepare(&mut self, stages: usize, dimension: usize) {
        if self.k.len() < stages {
            self.k.resize_with(stages, Vec::new);
        }
        for k in &mut self.k {
            k.resize(dimension, 0.0);
        }
        self.y.resize(dimension, 0.0);
    }
}

/// Takes one step of size `h` from `y0`, whose rate is `f0`.
///
/// Writes the propagated solution into `y1` and, for embedded pairs, the difference to
/// the embedded solution into `error`. Returns false if the tableau has no embedded pair.
#[allow(clippy::too_many_arguments)]
pub(crate) fn runge_kutta(
    tableau: &Tableau,
    y0: &[f64],
    f0: &[f64],
    h: f64,
    rate: &mut dyn FnMut(&[f64], &mut [f64]),
    stages: &mut Stages,
    y1: &mut [f64],
    error: &mut [f64],
) -> bool {
    let n = y0.len();
    stages.prepare(tableau.stages(), n);
    stages.k[0].copy_from_slice(f0);

    for i in 1..tableau.stages() {
        let row = tableau.a[i];
        for j in 0..n {
            let increment: f64 = row
                .iter()
                .enumerate()
                .map(|(s, a)| a * stages.k[s][j])
                .sum();
            stages.y[j] = y0[j] + h * increment;
        }
        rate(&stages.y, &mut stages.k[i]);
    }

    for j in 0..n {
        let increment: f64 = tableau
            .b
            .iter()
            .enumerate()
            .map(|(s, b)| b * stages.k[s][j])
            .sum();
        y1[j] = y0[j] + h * increment;
    }

    match tableau.b_low {
        Some(b_low) => {
            for j in 0..n {
                let difference: f64 = tableau
                    .b
                    .iter()
                    .zip(b_low)
                    .enumerate()
                    .map(|(s, (b, b_low))| (b - b_low) * stages.k[s][j])
                    .sum();
                error[j] = h * difference;
            }
            true
        }
        None => false,
    }
}

/// Velocity Verlet over `(position, velocity)` pairs at even/odd positions.
///
/// Components past the last full pair (the independent variable) advance with Euler,
/// which is exact for the clock. With `acceleration_independent_of_velocity` the second
/// rate evaluation reuses the old velocities instead of an Euler prediction.
pub(crate) fn velocity_verlet(
    y0: &[f64],
    f0: &[f64],
    h: f64,
    acceleration_independent_of_velocity: bool,
    rate: &mut dyn FnMut(&[f64], &mut [f64]),
    stages: &mut Stages,
    y1: &mut [f64],
) {
    let n = y0.len();
    let paired = (n - 1) / 2 * 2;
    stages.prepare(1, n);

    for j in (0..paired).step_by(2) {
        y1[j] = y0[j] + h * y0[j + 1] + 0.5 * h * h * f0[j + 1];
        y1[j + 1] = if acceleration_independent_of_velocity {
            y0[j + 1]
        } else {
            y0[j + 1] + h * f0[j + 1]
        };
    }
    for j in paired..n {
        y1[j] = y0[j] + h * f0[j];
    }

    let f1 = &mut stages.k[0];
    rate(y1, f1);
    for j in (0..paired).step_by(2) {
        y1[j + 1] = y0[j + 1] + 0.5 * h * (f0[j + 1] + f1[j + 1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay(y: &[f64], out: &mut [f64]) {
        out[0] = -y[0];
        out[1] = 1.0;
    }

    fn step(tableau: &Tableau, h: f64) -> (Vec<f64>, Vec<f64>) {
        let y0 = [1.0, 0.0];
        let mut f0 = [0.0; 2];
        decay(&y0, &mut f0);
        let mut y1 = vec![0.0; 2];
        let mut error = vec![0.0; 2];
        runge_kutta(
            tableau,
            &y0,
            &f0,
            h,
            &mut decay,
            &mut Stages::default(),
            &mut y1,
            &mut error,
        );
        (y1, error)
    }

    #[test]
    fn test_tableaux_are_consistent() {
        for tableau in [&EULER, &EULER_RICHARDSON, &RK4, &CASH_KARP, &DORMAND_PRINCE] {
            assert_eq!(tableau.a.len(), tableau.stages());
            assert_eq!(tableau.b.len(), tableau.stages());
            assert!((tableau.b.iter().sum::<f64>() - 1.0).abs() < 1e-14);
            for (i, row) in tableau.a.iter().enumerate() {
                assert_eq!(row.len(), i);
                assert!((row.iter().sum::<f64>() - tableau.c[i]).abs() < 1e-14);
            }
            if let Some(b_low) = tableau.b_low {
                assert!((b_low.iter().sum::<f64>() - 1.0).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn test_accuracy_on_decay() {
        let exact = (-0.1f64).exp();
        let (euler, _) = step(&EULER, 0.1);
        let (midpoint, _) = step(&EULER_RICHARDSON, 0.1);
        let (rk4, _) = step(&RK4, 0.1);
        let (ck, ck_err) = step(&CASH_KARP, 0.1);
        let (dp, dp_err) = step(&DORMAND_PRINCE, 0.1);

        assert!((euler[0] - 0.9).abs() < 1e-15);
        assert!((midpoint[0] - exact).abs() < 2e-4);
        assert!((rk4[0] - exact).abs() < 1e-7);
        assert!((ck[0] - exact).abs() < 1e-8);
        assert!((dp[0] - exact).abs() < 1e-8);
        assert!(ck_err[0].abs() < 1e-6);
        assert!(dp_err[0].abs() < 1e-6);
        assert!((rk4[1] - 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_verlet_harmonic_step() {
        let mut rate = |y: &[f64], out: &mut [f64]| {
            out[0] = y[1];
            out[1] = -y[0];
            out[2] = 1.0;
        };
        let y0 = [1.0, 0.0, 0.0];
        let mut f0 = [0.0; 3];
        rate(&y0, &mut f0);
        let mut y1 = vec![0.0; 3];
        velocity_verlet(&y0, &f0, 0.01, true, &mut rate, &mut Stages::default(), &mut y1);
        assert!((y1[0] - 0.01f64.cos()).abs() < 1e-6);
        assert!((y1[1] + 0.01f64.sin()).abs() < 1e-6);
        assert!((y1[2] - 0.01).abs() < 1e-15);
    }
}
