use std::{ffi::OsString, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warden::launcher::{self, Role};

/// Runs the warden client or daemon found next to this binary.
#[derive(Parser)]
#[command(name = "warden-launch", version, author)]
#[command(about = "Locate and run the warden client or daemon", long_about = None)]
struct LaunchCli {
    /// Which binary to run: `client` or `daemon`.
    role: Role,

    /// Arguments forwarded unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() -> ExitCode {
    let cli = LaunchCli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let result = launcher::locate(cli.role).and_then(|path| launcher::forward(&path, &cli.args));
    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
