//! Command-line front-end for the NexCage runtime.
//!
//! One lifecycle verb per invocation; this layer only parses arguments,
//! initializes logging, and translates typed runtime errors into the
//! documented exit codes (1 general, 2 misuse via clap, 125 runtime
//! failure, 127 missing backend tool). `exec` exits with the container
//! command's code verbatim.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use nexcage::{ContainerInfo, ExecOpts, Overrides, Runtime, parse_signal};

#[derive(Parser)]
#[command(
    name = "nexcage",
    version,
    about = "OCI container runtime shim for Proxmox VE"
)]
struct Cli {
    /// Explicit configuration file (skips discovery).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base directory for mapping and state files.
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error, fatal.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file (stderr only when absent).
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Force the default backend: proxmox-lxc, crun, runc, proxmox-vm.
    #[arg(long, global = true, value_name = "BACKEND")]
    backend: Option<String>,

    /// Verbose diagnostics; preserves conversion staging directories.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a container from an OCI bundle.
    Create {
        /// Container id.
        id: String,
        /// OCI bundle directory.
        #[arg(short = 'b', long, default_value = ".")]
        bundle: PathBuf,
    },

    /// Start a created (or stopped) container.
    Start {
        /// Container id.
        id: String,
    },

    /// Gracefully stop a running container, escalating on timeout.
    Stop {
        /// Container id.
        id: String,
    },

    /// Send a signal to a container's init process.
    Kill {
        /// Container id.
        id: String,
        /// Signal number or name (TERM, SIGKILL, 9, ...).
        #[arg(default_value = "TERM")]
        signal: String,
    },

    /// Delete a stopped container. Idempotent.
    Delete {
        /// Container id.
        id: String,
    },

    /// Execute a command in a running container.
    Exec {
        /// Container id.
        id: String,
        /// Extra environment variables (KEY=VALUE).
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
        /// Allocate a terminal.
        #[arg(short = 't', long)]
        tty: bool,
        /// Command and arguments to run.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// List containers.
    #[command(visible_alias = "ls")]
    List {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Display detailed information for a container.
    Info {
        /// Container id.
        id: String,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print a container's OCI state document.
    State {
        /// Container id.
        id: String,
    },

    /// Capture a filesystem checkpoint (ZFS snapshot or criu image).
    Checkpoint {
        /// Container id.
        id: String,
        /// Image directory for the criu fallback.
        #[arg(long, value_name = "DIR")]
        image_path: Option<PathBuf>,
    },

    /// Roll a container's rootfs back to a checkpoint.
    Restore {
        /// Container id.
        id: String,
        /// Snapshot name; most recent checkpoint when omitted.
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Write a skeleton OCI config.json into a bundle directory.
    Spec {
        /// Bundle directory.
        #[arg(short = 'b', long, default_value = ".")]
        bundle: PathBuf,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list/info commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    match cli.run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ERROR {}: {e}{}", e.kind(), render_context(&e));
            std::process::exit(e.exit_code());
        }
    }
}

impl Cli {
    async fn run(self) -> nexcage::Result<i32> {
        if let Command::Completion { shell } = &self.command {
            clap_complete::generate(
                *shell,
                &mut Self::command(),
                "nexcage",
                &mut std::io::stdout(),
            );
            return Ok(0);
        }

        let overrides = Overrides {
            config_file: self.config.clone(),
            state_dir: self.state_dir.clone(),
            log_level: self.log_level.as_deref().map(str::parse).transpose()?,
            log_file: self.log_file.clone(),
            backend: self.backend.as_deref().map(str::parse).transpose()?,
            debug: self.debug,
        };
        let runtime = Runtime::open(&overrides)?;
        init_logging(runtime.config());

        match self.command {
            Command::Create { id, bundle } => {
                runtime.create(&id, &bundle).await?;
                println!("{id}");
            }
            Command::Start { id } => runtime.start(&id).await?,
            Command::Stop { id } => runtime.stop(&id).await?,
            Command::Kill { id, signal } => runtime.kill(&id, parse_signal(&signal)?).await?,
            Command::Delete { id } => runtime.delete(&id).await?,
            Command::Exec {
                id,
                env,
                tty,
                command,
            } => {
                let code = runtime.exec(&id, &command, &ExecOpts { env, tty }).await?;
                return Ok(code);
            }
            Command::List { format } => {
                let infos = runtime.list().await?;
                print_list(&infos, format)?;
            }
            Command::Info { id, format } => {
                let info = runtime.info(&id).await?;
                print_info(&info, format)?;
            }
            Command::State { id } => {
                let state = runtime.state(&id).await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            Command::Checkpoint { id, image_path } => {
                let name = runtime.checkpoint(&id, image_path.as_deref()).await?;
                println!("{name}");
            }
            Command::Restore { id, snapshot } => {
                let name = runtime.restore(&id, snapshot.as_deref()).await?;
                println!("{name}");
            }
            Command::Spec { bundle } => write_spec(&bundle)?,
            Command::Completion { .. } => unreachable!("handled above"),
        }
        Ok(0)
    }
}

fn print_list(infos: &[ContainerInfo], format: OutputFormat) -> nexcage::Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(infos)?);
        return Ok(());
    }
    if infos.is_empty() {
        println!("No containers.");
        return Ok(());
    }
    println!(
        "{:<28} {:>8} {:<10} {:<12} {}",
        "ID", "VMID", "STATUS", "BACKEND", "CREATED"
    );
    for info in infos {
        let vmid = info
            .vmid
            .map_or_else(|| "-".to_owned(), |v| v.to_string());
        let created = if info.created_at == 0 {
            "-".to_owned()
        } else {
            info.created_at.to_string()
        };
        println!(
            "{:<28} {:>8} {:<10} {:<12} {}",
            info.id, vmid, info.status, info.backend, created
        );
    }
    Ok(())
}

fn print_info(info: &ContainerInfo, format: OutputFormat) -> nexcage::Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }
    println!("id:       {}", info.id);
    if let Some(vmid) = info.vmid {
        println!("vmid:     {vmid}");
    }
    println!("status:   {}", info.status);
    println!("backend:  {}", info.backend);
    if let Some(template) = &info.image_or_template {
        println!("template: {template}");
    }
    if info.created_at != 0 {
        println!("created:  {}", info.created_at);
    }
    if !info.addresses.is_empty() {
        println!("addresses: {}", info.addresses.join(", "));
    }
    Ok(())
}

/// The `spec` verb: a minimal, valid `config.json` to edit from.
fn write_spec(bundle: &Path) -> nexcage::Result<()> {
    let path = bundle.join("config.json");
    if path.exists() {
        return Err(nexcage::Error::AlreadyExists {
            what: "file",
            name: path.display().to_string(),
        });
    }
    let skeleton = serde_json::json!({
        "ociVersion": "1.0.2",
        "hostname": "nexcage",
        "process": {
            "args": ["/bin/sh"],
            "env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "cwd": "/",
            "user": {"uid": 0, "gid": 0}
        },
        "root": {"path": "rootfs", "readonly": false},
        "mounts": [],
        "linux": {"namespaces": [{"type": "pid"}, {"type": "mount"}, {"type": "uts"}]}
    });
    std::fs::create_dir_all(bundle)?;
    std::fs::write(&path, serde_json::to_string_pretty(&skeleton)? + "\n")?;
    println!("{}", path.display());
    Ok(())
}

/// `(context: k=v, ...)` suffix for the single-line error rendering.
fn render_context(e: &nexcage::Error) -> String {
    let pairs = e.context();
    if pairs.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" (context: {})", rendered.join(", "))
}

/// Stderr (or file) subscriber at the configured level.
fn init_logging(config: &nexcage::Config) {
    let filter = tracing_subscriber::EnvFilter::new(config.log_level.as_filter());
    if let Some(path) = &config.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("nexcage: cannot open log file {}: {e}", path.display()),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
