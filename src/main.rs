use std::env;
use std::error::Error;
use std::time::Instant;

use chrono::Local;
use log::info;

use lumen::graph::registry;
use lumen::validation::suites::{self, Suite};

fn run_suites(selected: &[(&str, Suite)]) -> usize {
    println!(
        "validation run started {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let mut failure_count = 0;
    for &(name, suite) in selected {
        let start = Instant::now();
        info!("running suite {}", name);
        let failures = suite();
        let elapsed = start.elapsed().as_secs_f64();
        if failures.is_empty() {
            println!("{:<32} ok ({:.2}s)", name, elapsed);
        } else {
            println!(
                "{:<32} {} failed ({:.2}s)",
                name,
                failures.len(),
                elapsed
            );
            for failure in &failures {
                println!("    {}", failure);
            }
        }
        failure_count += failures.len();
    }
    println!(
        "validation run finished {}: {} failure(s)",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        failure_count
    );
    failure_count
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = env::args().collect::<Vec<_>>();

    let instructions = "pass `--all`, `--suite [name]`, `--list-suites`, or `--list-kernels`";

    if args.len() <= 1 {
        println!("{}", instructions);
        return Ok(());
    }

    match args[1].as_str() {
        "--all" => {
            let failure_count = run_suites(&suites::suites());
            if failure_count > 0 {
                return Err(format!("{} validation failure(s)", failure_count).into());
            }
        }
        "--suite" => {
            let name = args.get(2).ok_or("`--suite` needs a suite name")?;
            let suite = suites::suite(name)
                .ok_or_else(|| format!("no suite named {:?}; try `--list-suites`", name))?;
            let failure_count = run_suites(&[(name.as_str(), suite)]);
            if failure_count > 0 {
                return Err(format!("{} validation failure(s)", failure_count).into());
            }
        }
        "--list-suites" => {
            for (name, _) in suites::suites() {
                println!("{}", name);
            }
        }
        "--list-kernels" => {
            println!(
                "{:<28} {:>6}  {:<24} {:<24} differentiable",
                "name", "opcode", "onnx", "tensorflow"
            );
            for kernel in registry::kernels() {
                println!(
                    "{:<28} {:>6}  {:<24} {:<24} {}",
                    kernel.name,
                    kernel.opcode,
                    kernel.onnx_name.unwrap_or("-"),
                    kernel.tensorflow_name.unwrap_or("-"),
                    kernel.differentiable
                );
            }
        }
        _ => {
            println!("{}", instructions);
        }
    }
    Ok(())
}

