use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hearth::abi::ENTRY_POINT_NOT_FOUND;
use hearth::config::Config;
use hearth::plugins::{InitReport, PluginInfo};
use hearth::{builtins, Error, Runtime};

/// Environment variable overriding the log filter.
const LOG_ENV: &str = "HEARTH_LOG";

/// Hearth - a single-instance plugin host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Additional plugin directory (repeatable)
    #[arg(long = "plugin-path", value_name = "DIR")]
    plugin_paths: Vec<PathBuf>,

    /// Worker threads for plugin entry points
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Stay resident as the main instance and run forwarded commands
    Serve,
    /// Ask the running main instance to exit
    Stop,
    /// Run a plugin command
    #[command(external_subcommand)]
    External(Vec<String>),
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("hearth: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to plugins.
    let default_filter = if args.debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load_default()?
    };
    config.plugins.search_paths.extend(args.plugin_paths);
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }

    let runtime = Arc::new(Runtime::new(config).context("Failed to start runtime")?);
    builtins::register_all(&runtime)?;

    match args.command {
        Some(Command::List { json }) => list(&runtime, json),
        Some(Command::Serve) => serve(&runtime),
        Some(Command::Stop) => stop(&runtime),
        Some(Command::External(argv)) => dispatch(&runtime, argv),
        None => {
            eprintln!("hearth: no command given; try `hearth list` or `hearth --help`");
            Ok(1)
        }
    }
}

fn load(runtime: &Runtime) -> Result<InitReport> {
    let report = runtime.load_plugins()?;
    report_diagnostics(&report);
    Ok(report)
}

fn report_diagnostics(report: &InitReport) {
    if report.all_failed() {
        eprintln!("hearth: all {} plugins failed to load", report.attempted);
    }
    if !report.duplicates.is_empty() {
        eprintln!(
            "hearth: duplicate plugin names detected: {}",
            report.duplicates.join(", ")
        );
    }
}

fn list(runtime: &Runtime, json: bool) -> Result<i32> {
    load(runtime)?;
    let infos = runtime.plugin_infos()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&infos).context("Failed to serialize plugin list")?
        );
    } else {
        print_table(&infos);
    }
    Ok(0)
}

fn print_table(infos: &[PluginInfo]) {
    if infos.is_empty() {
        println!("No plugins found");
        return;
    }

    let width = infos.iter().map(|info| info.name.len()).max().unwrap_or(0);
    for info in infos {
        let location = info
            .path
            .as_ref()
            .map_or_else(|| "built-in".to_string(), |path| path.display().to_string());
        println!(
            "{:<width$}  {:<12}  {:<11}  {}",
            info.name,
            info.version,
            info.state,
            location,
            width = width
        );
        if let Some(reason) = &info.error {
            println!("{:<width$}  {}", "", reason, width = width);
        }
    }
}

/// Run `argv` here if this process wins the election, otherwise forward it.
fn dispatch(runtime: &Arc<Runtime>, argv: Vec<String>) -> Result<i32> {
    #[cfg(unix)]
    {
        use hearth::instance::{self, Delivery, Role};

        let mut report = None;
        let role = instance::elect_with(&runtime.config().instance, || {
            report = Some(runtime.load_plugins()?);
            Ok(forwarding_handlers(runtime, None))
        })?;
        if let Some(report) = &report {
            report_diagnostics(report);
        }

        match role {
            Role::Secondary(secondary) => {
                match secondary.forward_command(&argv)? {
                    Delivery::Delivered => info!("Forwarded {} to the main instance", argv[0]),
                    Delivery::Dropped => warn!("Main instance is not listening; {} was dropped", argv[0]),
                }
                Ok(0)
            }
            Role::Main(_main) => execute(runtime, argv),
        }
    }

    #[cfg(not(unix))]
    {
        load(runtime)?;
        execute(runtime, argv)
    }
}

fn execute(runtime: &Runtime, argv: Vec<String>) -> Result<i32> {
    let command = argv.first().cloned().unwrap_or_default();
    let handle = match runtime.run(argv) {
        Ok(handle) => handle,
        Err(
            e @ (Error::PluginNotFound(_) | Error::PluginNotReady(_) | Error::DuplicatePlugin { .. }),
        ) => {
            eprintln!("hearth: {e}");
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    match handle.wait() {
        Ok(ENTRY_POINT_NOT_FOUND) => {
            eprintln!("hearth: `{command}` has no entry point");
            Ok(ENTRY_POINT_NOT_FOUND)
        }
        Ok(code) => Ok(code),
        Err(e) => {
            eprintln!("hearth: `{command}` did not complete: {e}");
            Ok(1)
        }
    }
}

#[cfg(unix)]
fn forwarding_handlers(
    runtime: &Arc<Runtime>,
    shutdown: Option<Arc<std::sync::atomic::AtomicBool>>,
) -> hearth::instance::HandlerTable {
    use hearth::events::RuntimeEvent;
    use hearth::instance::{decode_args, HandlerTable, RUN_EVENT, SHUTDOWN_EVENT};
    use std::sync::atomic::Ordering;

    let run_target = Arc::clone(runtime);
    let events = runtime.events().clone();
    HandlerTable::new()
        .on(RUN_EVENT, move |payload| {
            let argv = decode_args(payload);
            if argv.is_empty() {
                warn!("Ignoring an empty forwarded command");
                return;
            }
            run_target.run_detached(argv);
        })
        .on(SHUTDOWN_EVENT, move |_| {
            events.publish(&RuntimeEvent::ShutdownRequested);
            match &shutdown {
                Some(flag) => flag.store(true, Ordering::Release),
                None => debug!("Ignoring shutdown; this instance exits on its own"),
            }
        })
}

#[cfg(unix)]
fn serve(runtime: &Arc<Runtime>) -> Result<i32> {
    use hearth::instance::{self, Role};
    use std::sync::atomic::{AtomicBool, Ordering};

    let stop = Arc::new(AtomicBool::new(false));
    let mut report = None;
    let role = instance::elect_with(&runtime.config().instance, || {
        report = Some(runtime.load_plugins()?);
        Ok(forwarding_handlers(runtime, Some(Arc::clone(&stop))))
    })?;
    if let Some(report) = &report {
        report_diagnostics(report);
    }

    let Role::Main(main) = role else {
        eprintln!("hearth: another instance is already serving");
        return Ok(1);
    };

    info!("Serving on {}", main.pipe_path().display());
    let poll = runtime.config().instance.poll_interval();
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(poll);
    }
    info!("Shutting down");
    Ok(0)
}

#[cfg(not(unix))]
fn serve(_runtime: &Arc<Runtime>) -> Result<i32> {
    eprintln!("hearth: serve is only supported on unix");
    Ok(1)
}

#[cfg(unix)]
fn stop(runtime: &Runtime) -> Result<i32> {
    use hearth::instance::{Delivery, InstanceLock, SecondaryInstance};

    let config = &runtime.config().instance;
    if InstanceLock::try_acquire(&config.lock_path)?.is_some() {
        eprintln!("hearth: no main instance is running");
        return Ok(1);
    }

    match SecondaryInstance::new(&config.pipe_path).request_shutdown()? {
        Delivery::Delivered => Ok(0),
        Delivery::Dropped => {
            eprintln!("hearth: the main instance is not listening");
            Ok(1)
        }
    }
}

#[cfg(not(unix))]
fn stop(_runtime: &Runtime) -> Result<i32> {
    eprintln!("hearth: stop is only supported on unix");
    Ok(1)
}
