//! Command-line interfaces for the warden client and daemon.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::level_filters::LevelFilter;

use crate::{
    config::{RecoveryPolicy, load_process_specs, parse_duration},
    error::ProcessManagerError,
    ipc::{
        CommandKind, ControlError, ListArgs, RemoveArgs, Request, ShutdownOutput, TailArgs,
        TailOutput, WriteArgs, WriteOutput,
    },
    process::{ProcessSnapshot, ProcessSpec, ProcessStatus, RestartPolicy},
    status::{self, ColorMode},
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

fn parse_duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|err| err.to_string())
}

fn parse_timeout_arg(raw: &str) -> Result<Duration, String> {
    match parse_duration_arg(raw)? {
        timeout if timeout.is_zero() => Err("timeout must be greater than zero".into()),
        timeout => Ok(timeout),
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Client for the warden process supervisor.
#[derive(Parser)]
#[command(name = "warden", version, author)]
#[command(about = "Control processes supervised by wardend", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Control socket of the daemon (defaults to $WARDEN_SOCKET or the state directory).
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Talk to the system-wide daemon instead of the per-user one.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// How long to wait for the daemon to answer (e.g. "30s", "2m").
    #[arg(long, value_name = "DURATION", global = true, value_parser = parse_timeout_arg)]
    pub timeout: Option<Duration>,

    /// Emit the daemon's JSON data instead of formatted output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable ANSI colors in output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Definition of a process given on the command line or in a YAML file.
#[derive(Args, Debug, Clone)]
pub struct SpecArgs {
    /// Read definitions from a YAML file (one or a list) or a directory of them.
    #[arg(short, long, value_name = "PATH", conflicts_with_all = ["name", "command"])]
    pub file: Option<PathBuf>,

    /// Unique process name.
    #[arg(required_unless_present = "file")]
    pub name: Option<String>,

    /// Executable followed by its arguments.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required_unless_present = "file"
    )]
    pub command: Vec<String>,

    /// Working directory of the child.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable, may be repeated.
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Restart policy: never, on_failure or always.
    #[arg(long = "restart", value_name = "POLICY")]
    pub restart_policy: Option<RestartPolicy>,

    /// Delay before the first restart.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    pub backoff_base: Option<Duration>,

    /// Ceiling on the restart delay.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    pub backoff_max: Option<Duration>,

    /// Growth factor of the restart delay.
    #[arg(long, value_name = "FACTOR")]
    pub backoff_multiplier: Option<f64>,

    /// Give up after this many restarts within the restart window (0 = unlimited).
    #[arg(long, value_name = "COUNT")]
    pub max_restarts: Option<u32>,

    /// Window `--max-restarts` is counted over.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    pub restart_window: Option<Duration>,

    /// File stdout and stderr are appended to.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Accept input from `warden write` on the child's stdin.
    #[arg(long)]
    pub stdin: bool,
}

impl SpecArgs {
    /// Builds the specs, layering flags over the file contents when `--file` is used.
    pub fn to_specs(&self) -> Result<Vec<ProcessSpec>, ProcessManagerError> {
        let specs = match (&self.file, &self.name, self.command.split_first()) {
            (Some(path), _, _) => load_process_specs(path)?,
            (None, Some(name), Some((command, args))) => {
                let mut spec = ProcessSpec::new(name.clone(), command.clone());
                spec.args = args.to_vec();
                vec![spec]
            }
            _ => {
                return Err(ProcessManagerError::BadRequest(
                    "a name and a command are required unless --file is given".into(),
                ));
            }
        };

        if specs.len() > 1 && self.log_path.is_some() {
            return Err(ProcessManagerError::BadRequest(
                "--log-path cannot be shared by several processes".into(),
            ));
        }

        specs
            .into_iter()
            .map(|spec| self.apply(spec))
            .collect()
    }

    fn apply(&self, mut spec: ProcessSpec) -> Result<ProcessSpec, ProcessManagerError> {
        if let Some(cwd) = &self.cwd {
            spec.working_dir = Some(cwd.clone());
        }
        spec.env.extend(self.env.iter().cloned());
        if let Some(policy) = self.restart_policy {
            spec.restart_policy = policy;
        }
        if let Some(base) = self.backoff_base {
            spec.backoff.base = base;
        }
        if let Some(max) = self.backoff_max {
            spec.backoff.max = max;
        }
        if let Some(multiplier) = self.backoff_multiplier {
            spec.backoff.multiplier = multiplier;
        }
        if let Some(max_restarts) = self.max_restarts {
            spec.max_restarts = Some(max_restarts);
        }
        if let Some(window) = self.restart_window {
            spec.restart_window = window;
        }
        if let Some(log_path) = &self.log_path {
            spec.log_path = Some(log_path.clone());
        }
        if self.stdin {
            spec.stdin = true;
        }

        spec.validate()?;
        Ok(spec)
    }
}

/// Available commands for warden.
#[derive(Subcommand)]
pub enum Commands {
    /// Register a new process (it stays stopped until started).
    Register(SpecArgs),

    /// Replace the definition of a stopped process.
    Update(SpecArgs),

    /// Start a registered process.
    Start {
        /// Name of the process.
        name: String,
    },

    /// Stop a running process.
    Stop {
        /// Name of the process.
        name: String,
    },

    /// Stop a process if it is running, then start it again.
    Restart {
        /// Name of the process.
        name: String,
    },

    /// Delete a process definition.
    Remove {
        /// Name of the process.
        name: String,

        /// Stop the process first if it is running.
        #[arg(long)]
        force: bool,
    },

    /// Show one process in detail, or every process when no name is given.
    Status {
        /// Name of the process.
        name: Option<String>,
    },

    /// List registered processes, optionally narrowed by name pattern and status.
    List {
        /// Regular expression matched against process names.
        pattern: Option<String>,

        /// Only show processes in this status.
        #[arg(long, value_name = "STATUS")]
        status: Option<ProcessStatus>,
    },

    /// Show the last lines a process wrote to stdout/stderr.
    Tail {
        /// Name of the process.
        name: String,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = crate::constants::DEFAULT_TAIL_LINES)]
        lines: usize,
    },

    /// Send text to the stdin of a running process registered with `--stdin`.
    Write {
        /// Name of the process.
        name: String,

        /// Text to send.
        data: String,

        /// Do not append a trailing newline.
        #[arg(short = 'n', long)]
        no_newline: bool,
    },

    /// Stop every process and shut the daemon down.
    Shutdown,
}

fn encode(request: Request, payload: &impl serde::Serialize) -> Result<Request, ProcessManagerError> {
    request
        .with_payload(payload)
        .map_err(|err| ProcessManagerError::BadRequest(err.to_string()))
}

impl Commands {
    /// Translates the parsed command into the requests sent to the daemon, in order.
    ///
    /// Everything but a batch `register`/`update --file` yields a single request.
    pub fn to_requests(&self) -> Result<Vec<Request>, ProcessManagerError> {
        let request = match self {
            Commands::Register(spec) => return spec_requests(CommandKind::Register, spec),
            Commands::Update(spec) => return spec_requests(CommandKind::Update, spec),
            Commands::Start { name } => Request::named(CommandKind::Start, name),
            Commands::Stop { name } => Request::named(CommandKind::Stop, name),
            Commands::Restart { name } => Request::named(CommandKind::Restart, name),
            Commands::Remove { name, force } => encode(
                Request::named(CommandKind::Remove, name),
                &RemoveArgs { force: *force },
            )?,
            Commands::Status { name: Some(name) } => Request::named(CommandKind::Status, name),
            Commands::Status { name: None } => Request::new(CommandKind::List),
            Commands::List { pattern, status } => {
                let args = ListArgs {
                    pattern: pattern.clone(),
                    status: *status,
                };
                if args == ListArgs::default() {
                    Request::new(CommandKind::List)
                } else {
                    encode(Request::new(CommandKind::List), &args)?
                }
            }
            Commands::Tail { name, lines } => encode(
                Request::named(CommandKind::Tail, name),
                &TailArgs { lines: *lines },
            )?,
            Commands::Write {
                name,
                data,
                no_newline,
            } => {
                let mut data = data.clone();
                if !no_newline {
                    data.push('\n');
                }
                encode(Request::named(CommandKind::Write, name), &WriteArgs { data })?
            }
            Commands::Shutdown => Request::new(CommandKind::Shutdown),
        };
        Ok(vec![request])
    }
}

fn spec_requests(command: CommandKind, args: &SpecArgs) -> Result<Vec<Request>, ProcessManagerError> {
    args.to_specs()?
        .iter()
        .map(|spec| encode(Request::named(command, spec.name.clone()), spec))
        .collect()
}

/// Formats the data of a successful response for the terminal.
pub fn render_response(
    request: &Request,
    data: Option<Value>,
    json: bool,
    color: ColorMode,
) -> Result<String, ControlError> {
    let data = data.unwrap_or(Value::Null);
    if json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&data)?));
    }

    let now = chrono::Utc::now();
    let rendered = match request.command {
        CommandKind::List => {
            let snapshots: Vec<ProcessSnapshot> = serde_json::from_value(data)?;
            status::render_list(&snapshots, color)
        }
        CommandKind::Remove => {
            let snapshot: ProcessSnapshot = serde_json::from_value(data)?;
            format!("Removed process '{}'\n", snapshot.spec.name)
        }
        CommandKind::Tail => {
            let output: TailOutput = serde_json::from_value(data)?;
            output
                .lines
                .iter()
                .map(|line| format!("{line}\n"))
                .collect()
        }
        CommandKind::Write => {
            let output: WriteOutput = serde_json::from_value(data)?;
            format!("Wrote {} byte(s) to '{}'\n", output.bytes, output.name)
        }
        CommandKind::Shutdown => {
            let output: ShutdownOutput = serde_json::from_value(data)?;
            format!(
                "wardend shutting down; stopped {} process(es)\n",
                output.stopped.len()
            )
        }
        CommandKind::Register
        | CommandKind::Update
        | CommandKind::Start
        | CommandKind::Stop
        | CommandKind::Restart
        | CommandKind::Status => {
            let snapshot: ProcessSnapshot = serde_json::from_value(data)?;
            status::render_status(&snapshot, now, color)
        }
    };
    Ok(rendered)
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// The warden daemon.
#[derive(Parser)]
#[command(name = "wardend", version, author)]
#[command(about = "Supervise long-running processes for warden clients", long_about = None)]
pub struct DaemonCli {
    /// Override the logging verbosity.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// Daemon configuration file (defaults to `wardend.yaml` in the config directory).
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root directory for state, logs and the socket (same as $WARDEN_HOME).
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Control socket path, overriding config and environment.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Use system directories under /var and /etc.
    #[arg(long = "sys")]
    pub sys: bool,

    /// What to do with processes that were running when the last daemon exited.
    #[arg(long, value_name = "POLICY")]
    pub recovery: Option<RecoveryPolicy>,

    /// Detach from the terminal and log to the state directory.
    #[arg(long)]
    pub daemonize: bool,
}
