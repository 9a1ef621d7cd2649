use std::path::Path;
use std::process::ExitCode;

use modelcanon::format::keras::{KerasArchiveBackend, KerasFormat};
use modelcanon::pipeline::Artifacts;
use modelcanon::{Options, Pipeline};
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  modelcanon extract <input> [out_dir]
  modelcanon rebuild <weights> <architecture> <metadata> <output>

Set MODELCANON_CONFIG to a JSON options file to override artifact names.";

fn run(args: &[String]) -> modelcanon::Result<bool> {
    let options = match std::env::var_os("MODELCANON_CONFIG") {
        Some(path) => Options::from_file(path)?,
        None => Options::default(),
    };
    let mut pipeline = Pipeline::new(options);
    pipeline
        .registry_mut()
        .register(Box::new(KerasFormat::new(Box::new(KerasArchiveBackend))));

    match args {
        [cmd, input] if cmd == "extract" => {
            let artifacts = pipeline.extract(Path::new(input), Path::new("."))?;
            print_artifacts(&artifacts);
        }
        [cmd, input, out_dir] if cmd == "extract" => {
            let artifacts = pipeline.extract(Path::new(input), Path::new(out_dir))?;
            print_artifacts(&artifacts);
        }
        [cmd, weights, architecture, metadata, output] if cmd == "rebuild" => {
            let artifacts = Artifacts {
                weights: weights.into(),
                architecture: architecture.into(),
                metadata: metadata.into(),
            };
            let written = pipeline.rebuild(&artifacts, Path::new(output))?;
            println!("{}", written.display());
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn print_artifacts(artifacts: &Artifacts) {
    println!("{}", artifacts.weights.display());
    println!("{}", artifacts.architecture.display());
    println!("{}", artifacts.metadata.display());
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("{}", USAGE);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
