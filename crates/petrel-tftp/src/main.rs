use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use clap::Parser;

use petrel_tftp::config::{load_config, validate_config, write_default_config};
use petrel_tftp::{ServerConfig, ServerState, engine, logging};

#[derive(Parser, Debug)]
#[command(name = "petrel-tftpd", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(default_value = "/etc/petrel/tftpd.toml")]
    config: PathBuf,

    /// Run without a user interface and start serving immediately. No
    /// front end ships with this binary, so this is the effective mode
    /// either way; the flag additionally makes a bind failure fatal
    /// instead of parking the engine idle.
    #[arg(long)]
    nogui: bool,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.init_config {
        return match write_default_config(&cli.config) {
            Ok(()) => {
                println!("Wrote config to {}", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = if cli.config.exists() {
        match load_config(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        ServerConfig::default()
    };

    if cli.check_config {
        return match validate_config(&config) {
            Ok(()) => {
                println!("Config OK: {}", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = validate_config(&config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // Dropping the guard on exit flushes and detaches the log sink. A
    // failed init disables file logging; the server runs regardless.
    let _log_guard = logging::init_logging(&config.log_dir);

    let state = Arc::new(ServerState::new(config, true));
    let nogui = cli.nogui;

    let engine_state = Arc::clone(&state);
    let engine_thread = std::thread::spawn(move || engine::engine_loop(engine_state, nogui));

    observe_until_exit(&state, &engine_thread);

    match engine_thread.join() {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!("engine thread panicked");
            ExitCode::FAILURE
        }
    }
}

/// The observer side of the control surface: wait for Ctrl-C and ask the
/// engine to shut down, or notice that the engine exited on its own.
fn observe_until_exit(state: &Arc<ServerState>, engine_thread: &JoinHandle<petrel_tftp::Result<()>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    state.shutdown();
                    return;
                }
                _ = tick.tick() => {
                    if engine_thread.is_finished() {
                        return;
                    }
                }
            }
        }
    });
}
