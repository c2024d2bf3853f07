//! Cadenza CLI: run a workflow document locally, or serve the
//! executions-API façade over it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cadenza::{CompileError, Value, WorkflowRoot};
use clap::Parser;

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Local emulator for declarative workflow documents", long_about = None)]
struct Cli {
    /// Workflow file (YAML or JSON, selected by extension)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Workflow argument as JSON
    #[arg(long = "args", conflicts_with = "listen")]
    args: Option<String>,

    /// Host and port to serve the executions API on
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(listen) = &cli.listen {
        let file = cli.file.clone();
        let loader = move || load_workflow(&file).map_err(|e| e.to_string());
        return match cadenza::server::serve(listen, Box::new(loader)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("failed to serve workflow: {error}");
                ExitCode::FAILURE
            }
        };
    }

    let root = match load_workflow(&cli.file) {
        Ok(root) => root,
        Err(error) => {
            eprintln!("failed to load workflow: {error}");
            return ExitCode::FAILURE;
        }
    };

    let args = match &cli.args {
        None => Value::Null,
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => Value::from_json(&json),
            Err(error) => {
                eprintln!("failed to parse args as JSON: {error}");
                return ExitCode::FAILURE;
            }
        },
    };

    match root.execute(args) {
        Ok(ret) => {
            if !ret.is_nil() {
                match ret.to_json() {
                    Ok(json) => match serde_json::to_string_pretty(&json) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(error) => eprintln!("failed to render result: {error}"),
                    },
                    Err(error) => eprintln!("failed to render result: {error}"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            match error.exception() {
                Some(exception) => {
                    eprintln!("{exception}");
                    if let Ok(payload) = exception.payload().to_json() {
                        if let Ok(rendered) = serde_json::to_string_pretty(&payload) {
                            eprintln!("{rendered}");
                        }
                    }
                }
                None => eprintln!("failed to execute workflow: {error}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_workflow(path: &Path) -> Result<Arc<WorkflowRoot>, CompileError> {
    let file = File::open(path)
        .map_err(|e| CompileError::Document(format!("cannot open {}: {e}", path.display())))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => WorkflowRoot::parse_json(file),
        Some("yaml") | Some("yml") => WorkflowRoot::parse_yaml(file),
        _ => Err(CompileError::Document(format!(
            "unsupported file extension: {}",
            path.display()
        ))),
    }
}
