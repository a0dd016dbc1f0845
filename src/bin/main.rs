use std::{
    env,
    io::{self, IsTerminal, Write},
    process::ExitCode,
};

use tracing::debug;
use tracing_subscriber::EnvFilter;

use warden::{
    cli::{Cli, parse_args, render_response},
    constants::DEFAULT_CLIENT_TIMEOUT,
    ipc::Client,
    runtime::{RuntimeMode, client_socket_path},
    status::ColorMode,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let requests = match args.command.to_requests() {
        Ok(requests) => requests,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    let mode = if args.sys {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    let socket = client_socket_path(args.socket.clone(), mode);
    let client = Client::new(socket, args.timeout.unwrap_or(DEFAULT_CLIENT_TIMEOUT));
    let color = color_mode(&args);

    // A batch keeps going past rejected commands but stops once the daemon is unreachable.
    let mut status = ExitCode::SUCCESS;
    for request in &requests {
        debug!("Sending {} to {}", request.command, client.socket().display());
        let data = match client.call(request) {
            Ok(data) => data,
            Err(err) if err.exit_code() == 2 => {
                eprintln!("error: {err}");
                status = ExitCode::from(2);
                continue;
            }
            Err(err) => {
                eprintln!("error: {err}");
                return exit_code(err.exit_code());
            }
        };

        match render_response(request, data, args.json, color) {
            Ok(output) => {
                if io::stdout().lock().write_all(output.as_bytes()).is_err() {
                    return ExitCode::FAILURE;
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        }
    }
    status
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn color_mode(args: &Cli) -> ColorMode {
    if args.no_color || env::var_os("NO_COLOR").is_some() || !io::stdout().is_terminal() {
        ColorMode::Never
    } else {
        ColorMode::Always
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
