//! # Enzyme Kinetics Simulation Benchmark
//!
//! Compares a hand-coded Michaelis-Menten system integrated with `ode_solvers` against the
//! same system written as an ODE page and stepped through a [`Model`].
//!
//! ## System Description
//!
//! - Substrate: `S' = -(vmax * S) / (km + S)`
//! - Product: `P' = (vmax * S) / (km + S) - kie * P`
//!
//! ## Benchmark Details
//!
//! - **Method**: Dormand-Prince 5(4) in both implementations
//! - **Time Range**: 0.0 to 150.0, stepped in units of 1.0 for the page
//! - **Tolerances**: Absolute 1e-4, Relative 1e-8
//! - **Initial Conditions**: S=1000.0, P=100.0
//! - **Parameters**: vmax=0.85, km=150.0, kie=0.01
//!
//! Page compilation (normalization, layout and Cranelift code generation) is measured
//! separately, since a model compiles once and steps many times.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use evalexpr_ode::prelude::*;
use ode_solvers::dopri5::*;
use ode_solvers::*;

type State = Vector2<f64>;

const VMAX: f64 = 0.85;
const KM: f64 = 150.0;
const KIE: f64 = 0.01;

const MODEL: &str = r#"{
    "name": "kinetics",
    "variables": [
        { "name": "S", "value": 1000.0 },
        { "name": "P", "value": 100.0 },
        { "name": "vmax", "value": 0.85 },
        { "name": "km", "value": 150.0 },
        { "name": "kie", "value": 0.01 },
        { "name": "t" }
    ],
    "pages": [{
        "name": "enzyme",
        "independentVariable": "t",
        "stepSize": 1.0,
        "method": "DormandPrince5",
        "absoluteTolerance": 1e-4,
        "relativeTolerance": 1e-8,
        "equations": [
            { "state": "S", "rate": "-(vmax * S) / (km + S)" },
            { "state": "P", "rate": "(vmax * S) / (km + S) - kie * P" }
        ]
    }]
}"#;

/// Direct implementation of the kinetics system.
struct DirectSystem;

impl System<f64, State> for DirectSystem {
    #[inline(always)]
    fn system(&self, _t: f64, y: &State, dy: &mut State) {
        let rate = (VMAX * y[0]) / (KM + y[0]);
        dy[0] = -rate;
        dy[1] = rate - KIE * y[1];
    }
}

fn run_direct() -> f64 {
    let mut stepper = Dopri5::new(
        DirectSystem,
        0.0,
        150.0,
        0.1,
        State::new(1000.0, 100.0),
        1.0e-4,
        1.0e-8,
    );
    let _ = stepper.integrate();
    stepper.y_out().last().map_or(f64::NAN, |y| y[1])
}

fn run_page(model: &mut Model) -> f64 {
    for _ in 0..150 {
        model.step();
    }
    model.bindings().scalar("P").unwrap_or(f64::NAN)
}

fn benchmark_simulations(c: &mut Criterion) {
    let spec: ModelSpec = serde_json::from_str(MODEL).expect("benchmark model is valid");

    let mut group = c.benchmark_group("Enzyme Kinetics Simulation");

    group.bench_function("Page Compilation", |b| {
        b.iter(|| Model::compile(black_box(&spec)).expect("benchmark model compiles"))
    });

    group.bench_function("Direct Implementation", |b| b.iter(|| black_box(run_direct())));

    let mut model = Model::compile(&spec).expect("benchmark model compiles");
    group.bench_function("Page Implementation", |b| {
        b.iter(|| {
            model.reset().expect("benchmark model resets");
            black_box(run_page(&mut model))
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_simulations);
criterion_main!(benches);
