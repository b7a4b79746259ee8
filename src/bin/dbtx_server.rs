//! The `dbtx-server` process entry point. Thin by design (§0): all daemon logic lives in
//! [`dbtx::daemon`] so it stays unit-testable; this binary only owns argv parsing, the
//! `tracing-subscriber` installation, and translating the daemon's outcome into an exit code.
//! Flag set mirrors `FEXServer::Config::Load` (`-k/--kill`, `-f/--foreground`,
//! `-p/--persistent[=N]`, `-w/--wait`, `-v`).

use dbtx::daemon::protocol::{encode_request, PacketType};
use dbtx::daemon::{exit_code, Daemon, DaemonConfig};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

struct Options {
    kill: bool,
    foreground: bool,
    wait: bool,
    persistent_seconds: Option<u64>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Options {
    let mut opts = Options { kill: false, foreground: false, wait: false, persistent_seconds: None };
    for arg in args {
        match arg.as_str() {
            "-k" | "--kill" => opts.kill = true,
            "-f" | "--foreground" => opts.foreground = true,
            "-w" | "--wait" => {
                opts.wait = true;
                opts.foreground = true;
            }
            "-v" | "--version" => {
                println!("dbtx-server {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(exit_code::SUCCESS);
            }
            "-p" | "--persistent" => opts.persistent_seconds = Some(1),
            other if other.starts_with("--persistent=") => {
                let value = other.trim_start_matches("--persistent=");
                opts.persistent_seconds = value.parse().ok().or(Some(1));
            }
            _ => {}
        }
    }
    opts
}

fn request_kill() -> bool {
    let Ok(mut stream) = dbtx::daemon::socket::connect_abstract() else {
        return false;
    };
    stream.write_all(&encode_request(PacketType::Kill)).is_ok()
}

fn main() {
    let opts = parse_args(std::env::args().skip(1));

    if opts.foreground {
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    }

    if opts.kill {
        if request_kill() {
            tracing::info!("sent kill request to existing dbtx-server");
        }
        std::process::exit(exit_code::SUCCESS);
    }

    if opts.wait {
        while dbtx::daemon::lock::ServerLock::is_server_alive(&dbtx::daemon::lock::default_lock_path()) {
            std::thread::sleep(Duration::from_millis(200));
        }
        std::process::exit(exit_code::SUCCESS);
    }

    let config = DaemonConfig {
        rootfs_path: std::env::var_os("DBTX_ROOTFS").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/")),
        persistent_timeout: opts.persistent_seconds.map(Duration::from_secs),
    };

    match Daemon::try_start(config) {
        Ok(Some(daemon)) => {
            tracing::info!("dbtx-server listening");
            if let Err(err) = daemon.run() {
                tracing::error!(?err, "dbtx-server exited with an error");
                std::process::exit(exit_code::SOCKET_SETUP_FAILED);
            }
            std::process::exit(exit_code::SUCCESS);
        }
        Ok(None) => {
            tracing::info!("dbtx-server already running for this user");
            std::process::exit(exit_code::ALREADY_RUNNING);
        }
        Err(err) => {
            eprintln!("dbtx-server: failed to start: {err}");
            std::process::exit(exit_code::SOCKET_SETUP_FAILED);
        }
    }
}
