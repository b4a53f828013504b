use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use evalexpr_ode::prelude::*;
use itertools::Itertools;
use log::info;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "odepage")]
#[command(about = "Compile a model document and step its ODE pages")]
#[command(version)]
struct Args {
    /// Path to the JSON model document
    model: PathBuf,

    /// Number of model steps to take
    #[arg(short, long, default_value_t = 10)]
    steps: usize,

    /// Output format of the trajectory
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    /// Print the compiled pages before stepping
    #[arg(long)]
    describe: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[derive(Serialize)]
struct Row<'a> {
    step: usize,
    values: Vec<(&'a str, &'a Value)>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(&args.model)?;
    let mut model = Model::from_json(&text)?;
    for diagnostic in model.diagnostics() {
        eprintln!("{}: {diagnostic}", diagnostic.page.bold());
    }
    if args.describe {
        println!("{model:?}");
    }

    print_row(args.format, 0, model.bindings())?;
    for step in 1..=args.steps {
        let result = model.step();
        for (page, failure) in &result.failures {
            eprintln!("{} {page}: {failure}", "failed:".red());
        }
        print_row(args.format, step, model.bindings())?;
        if model.is_paused() {
            info!("model paused after step {step}");
            break;
        }
    }
    Ok(())
}

fn print_row(format: Format, step: usize, bindings: &Bindings) -> Result<(), serde_json::Error> {
    let values = bindings
        .iter()
        .map(|(name, value)| (name.as_str(), value))
        .collect::<Vec<_>>();
    match format {
        Format::Json => println!("{}", serde_json::to_string(&Row { step, values })?),
        Format::Table => {
            let mut cells = values.iter().map(|(name, value)| match value {
                Value::Scalar(v) => format!("{name}={v:.6}"),
                Value::Array(v) => format!("{name}=[{}]", v.iter().map(|x| format!("{x:.6}")).join(", ")),
            });
            println!("{:>6}  {}", step.to_string().cyan(), cells.join("  "));
        }
    }
    Ok(())
}
