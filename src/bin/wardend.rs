use std::{
    error::Error,
    fs::{self, File, OpenOptions},
    os::unix::io::IntoRawFd,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use warden::{
    cli::DaemonCli,
    config::load_config,
    constants::DAEMON_LOG_FILE_NAME,
    daemon::Daemon,
    runtime::{RuntimeMode, RuntimePaths},
    server::Server,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = DaemonCli::parse();

    let paths = resolve_paths(&args)?;
    let config_path = args.config.clone().map(absolute).transpose()?;
    let mut config = load_config(config_path.as_deref(), &paths)?;
    if let Some(socket) = &args.socket {
        config.socket_path = absolute(socket.clone())?;
    }
    if let Some(recovery) = args.recovery {
        config.recovery = recovery;
    }

    let log_file = if args.daemonize {
        fs::create_dir_all(&config.log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_dir.join(DAEMON_LOG_FILE_NAME))?;
        daemonize_wardend()?;
        Some(file)
    } else {
        None
    };
    init_logging(&args, log_file);

    let daemon = Arc::new(Daemon::from_config(&config)?);
    let report = daemon.recover()?;
    info!(
        "Recovered {} record(s); started {}",
        report.normalized.len(),
        report.started.len()
    );

    let server = Server::new(
        daemon,
        config.socket_path.clone(),
        config.pid_file(),
        config.io_timeout,
    );

    let shutdown = server.shutdown_signal();
    ctrlc::set_handler(move || {
        info!("wardend received termination signal; shutting down");
        shutdown.trigger();
    })?;

    if let Err(err) = server.run() {
        error!("wardend exited with error: {err}");
        return Err(err.into());
    }

    info!("wardend stopped");
    Ok(())
}

fn resolve_paths(args: &DaemonCli) -> Result<RuntimePaths, Box<dyn Error>> {
    if let Some(home) = &args.home {
        return Ok(RuntimePaths::rooted_at(absolute(home.clone())?));
    }
    let mode = if args.sys {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    Ok(RuntimePaths::resolve(mode))
}

fn absolute(path: PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn init_logging(args: &DaemonCli, log_file: Option<File>) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
}

fn daemonize_wardend() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
