use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use httpwasm_runtime::{
    ConfigError, Environment, InitError, LoadError, ModuleLoader, RequestMeta, RuntimeConfig,
    WasmRuntime,
};
use tracing_subscriber::EnvFilter;

const ECHO: &[u8] = include_bytes!("../modules/echo.wat");

/// httpwasm - Run a request body through a sandboxed WASM handler
#[derive(Parser, Debug)]
#[command(name = "httpwasm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Handler module to run
    #[arg(long, default_value = "echo")]
    handler: String,

    /// Directory searched for `<handler>.wasm` or `<handler>.wat` before the
    /// built-in modules. Pass an empty string to use built-ins only.
    #[arg(long, default_value = "modules")]
    modules: PathBuf,

    /// JSON runtime configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read the request body from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,

    /// Request method exposed as HTTP_METHOD
    #[arg(long, default_value = "POST")]
    method: String,

    /// Request path exposed as HTTP_PATH
    #[arg(long, default_value = "/")]
    path: String,

    /// Request host exposed as HTTP_HOST
    #[arg(long, default_value = "")]
    host: String,

    /// Query string exposed as HTTP_QUERY
    #[arg(long, default_value = "")]
    query: String,

    /// Peer address exposed as REMOTE_ADDR
    #[arg(long, default_value = "")]
    remote_addr: String,

    /// Extra environment entry for the handler (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_entry)]
    env: Vec<(String, String)>,

    /// Print call statistics as JSON on stderr
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("failed to read input from {origin}: {source}")]
    Input { origin: String, source: io::Error },

    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

fn parse_env_entry(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing key in `{raw}`")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn loader(modules: &Path) -> ModuleLoader {
    let loader = ModuleLoader::new().with_builtin("echo", ECHO);
    if modules.as_os_str().is_empty() {
        loader
    } else {
        loader.with_local_dir(modules)
    }
}

fn environment(args: &Args) -> Environment {
    let mut env = RequestMeta {
        path: args.path.clone(),
        method: args.method.clone(),
        host: args.host.clone(),
        query: args.query.clone(),
        remote_addr: args.remote_addr.clone(),
    }
    .into_env();
    env.extend(args.env.iter().cloned());
    env
}

fn read_body(input: Option<&Path>) -> Result<Vec<u8>, CliError> {
    match input {
        Some(path) => fs::read(path).map_err(|source| CliError::Input {
            origin: path.display().to_string(),
            source,
        }),
        None => {
            let mut body = Vec::new();
            io::stdin()
                .read_to_end(&mut body)
                .map_err(|source| CliError::Input {
                    origin: "stdin".to_string(),
                    source,
                })?;
            Ok(body)
        }
    }
}

fn emit(output: &[u8], diagnostic: &[u8]) -> Result<(), CliError> {
    for line in String::from_utf8_lossy(diagnostic).lines() {
        tracing::info!(target: "guest", "{line}");
    }
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(output)
        .and_then(|()| stdout.flush())
        .map_err(CliError::Output)
}

fn execute(args: &Args) -> Result<ExitCode, CliError> {
    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let module = loader(&args.modules).load(&args.handler)?;
    let mut runtime = WasmRuntime::initialize(&module.bytes, config)?;

    let body = read_body(args.input.as_deref())?;
    let verdict = runtime.run_with_env(&body, environment(args));
    let stats = runtime.stats();
    runtime.shutdown();

    let code = match verdict {
        Ok(out) => {
            tracing::debug!(call = %out.call, bytes = out.output.len(), "handler finished");
            emit(&out.output, &out.diagnostic)?;
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(handler = %args.handler, error = %err, "handler faulted");
            emit(&err.output, &err.diagnostic)?;
            ExitCode::FAILURE
        }
    };

    if args.stats {
        match serde_json::to_string(&stats) {
            Ok(json) => eprintln!("{json}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode stats"),
        }
    }
    Ok(code)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match execute(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
