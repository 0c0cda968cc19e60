// Scenario Runner - Load and execute link lifecycle scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/two_nodes.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/two_nodes.yaml --seed 1234 --verbose

mod link_lifecycle;

use link_lifecycle::{LinkLifecycleRunner, LinkScenario};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::Path;

struct Options {
    seed: Option<u64>,
    verbose: bool,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED] [--verbose]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/two_nodes.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/two_nodes.yaml --seed 42", args[0]);
        std::process::exit(1);
    }

    let options = parse_options(&args[2..]);

    let level = if options.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialise logger: {}", e);
    }

    let path = Path::new(&args[1]);
    if path.is_file() {
        run_scenario_file(path, &options);
    } else if path.is_dir() {
        run_scenario_directory(path, &options);
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    }
}

fn parse_options(args: &[String]) -> Options {
    let mut options = Options {
        seed: None,
        verbose: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" if i + 1 < args.len() => {
                options.seed = Some(parse_seed(&args[i + 1]));
                i += 1;
            }
            "--verbose" | "-v" => options.verbose = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }
    options
}

fn parse_seed(text: &str) -> u64 {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.unwrap_or_else(|e| {
        eprintln!("Invalid seed '{}': {}", text, e);
        std::process::exit(1);
    })
}

fn run_scenario_directory(dir: &Path, options: &Options) {
    let mut scenarios = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("Found {} scenario(s) to run\n", scenarios.len());
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        run_scenario_file(scenario_path, options);
    }
}

fn run_scenario_file(path: &Path, options: &Options) {
    println!("Loading scenario from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let scenario = LinkScenario::from_yaml(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    });

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }
    println!(
        "Media: {}, Nodes: {}, Actions: {}",
        scenario.media.len(),
        scenario.nodes.len(),
        scenario.actions.len()
    );

    match LinkLifecycleRunner::new(scenario, options.seed, options.verbose).run() {
        Ok(result) => {
            result.print_summary();
            println!("\n✓ Scenario complete!\n");
        }
        Err(e) => {
            eprintln!("Scenario {} failed: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}
