use std::collections::HashMap;
use std::future::Future;
use std::process;
use std::sync::Arc;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use tokio::signal::unix::{signal, SignalKind};
use tracing::error;

use jaeger::bus::{BusInterface, VirtualBus};
use jaeger::commands::{Command, CommandID};
use jaeger::config::Config;
use jaeger::error::JaegerError;
use jaeger::fps::{Fps, FpsRegistry};

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    process::exit(run().await);
}

fn build_cli<'a, 'b>() -> App<'a, 'b> {
    App::new("jaeger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CLI for the focal plane system. Runs the actor if called without a subcommand.")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the user configuration file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("profile")
                .short("p")
                .long("profile")
                .value_name("PROFILE")
                .help("The bus interface profile")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("virtual")
                .long("virtual")
                .help("Runs a virtual FPS with virtual positioners. Same as --profile=virtual")
                .global(true),
        )
        .arg(
            Arg::with_name("npositioners")
                .short("n")
                .long("npositioners")
                .value_name("N")
                .help("How many positioners to connect to the virtual FPS")
                .takes_value(true)
                .default_value("10")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Debug mode. Use additional v for more details")
                .global(true),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Disable all console logging")
                .global(true),
        )
        .arg(
            Arg::with_name("no-lock")
                .long("no-lock")
                .help("Do not use the lock file, or ignore it if present")
                .global(true),
        )
        .subcommand(SubCommand::with_name("actor").about("Runs the actor (default)"))
        .subcommand(
            SubCommand::with_name("goto")
                .about("Sends positioners to a given (alpha, beta) position")
                .arg(
                    Arg::with_name("args")
                        .value_name("POSITIONER-IDS... ALPHA BETA")
                        .help("Positioner ids followed by the alpha and beta angles")
                        .multiple(true)
                        .allow_hyphen_values(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("relative")
                        .short("r")
                        .long("relative")
                        .help("Whether this is a relative move"),
                )
                .arg(
                    Arg::with_name("speed")
                        .short("s")
                        .long("speed")
                        .value_name("RPM")
                        .help("The speed for both alpha and beta arms, in RPM at the input")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("all")
                        .short("a")
                        .long("all")
                        .help("Applies to all valid positioners"),
                )
                .arg(
                    Arg::with_name("force")
                        .short("f")
                        .long("force")
                        .help("Forces a move to happen"),
                ),
        )
        .subcommand(
            SubCommand::with_name("set-positions")
                .about("Sets the position of the alpha and beta arms")
                .arg(Arg::with_name("positioner").value_name("POSITIONER").required(true))
                .arg(Arg::with_name("alpha").value_name("ALPHA").required(true))
                .arg(Arg::with_name("beta").value_name("BETA").required(true)),
        )
        .subcommand(
            SubCommand::with_name("home")
                .about("Home a single positioner, sending it to datums")
                .arg(Arg::with_name("positioner").value_name("POSITIONER").required(true))
                .arg(
                    Arg::with_name("axis")
                        .long("axis")
                        .possible_values(&["alpha", "beta"])
                        .help("The axis to home. If not set, homes both axes")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("list-positioners").about("Returns a list of connected positioners"),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Returns the status of a positioner")
                .arg(Arg::with_name("positioner").value_name("POSITIONER").required(true)),
        )
        .subcommand(SubCommand::with_name("unlock").about("Unlocks the FPS"))
}

async fn run() -> i32 {
    let matches = match build_cli().get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => {
            use clap::ErrorKind::{HelpDisplayed, VersionDisplayed};
            if matches!(err.kind, HelpDisplayed | VersionDisplayed) {
                println!("{}", err.message);
                return EXIT_OK;
            }
            eprintln!("{}", err.message);
            return EXIT_USAGE;
        }
    };

    let verbosity = matches.occurrences_of("verbose") as u8;
    let quiet = matches.is_present("quiet");
    if verbosity > 0 && quiet {
        eprintln!("--quiet and --verbose are mutually exclusive.");
        return EXIT_USAGE;
    }

    let config = match matches.value_of("config") {
        Some(path) => Config::load(path),
        None => Config::user_default(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {err}", "error:".red());
            return EXIT_ERROR;
        }
    };

    if matches.is_present("no-lock") {
        config.fps.use_lock = false;
    }

    jaeger::logging::init(verbosity, quiet, config.files.log_dir.as_deref());

    let mut profile = matches
        .value_of("profile")
        .unwrap_or(&config.profiles.default)
        .to_string();
    if matches.is_present("virtual") {
        profile = "virtual".to_string();
    }

    let npositioners: u16 = match matches.value_of("npositioners").unwrap().parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("--npositioners must be an integer");
            return EXIT_USAGE;
        }
    };

    let registry = FpsRegistry::new();
    spawn_signal_handler(Arc::clone(&registry));

    let interfaces = match build_interfaces(&config, &profile, npositioners) {
        Ok(interfaces) => interfaces,
        Err(err) => {
            eprintln!("{} {err}", "error:".red());
            return EXIT_ERROR;
        }
    };

    let result = dispatch_subcommand(&matches, &registry, config, interfaces).await;

    match result {
        Ok(()) => EXIT_OK,
        Err(JaegerError::Usage(message)) => {
            eprintln!("{} {message}", "error:".red());
            EXIT_USAGE
        }
        Err(err) => {
            error!("{err}");
            eprintln!("{} {err}", "error:".red());
            EXIT_ERROR
        }
    }
}

async fn dispatch_subcommand(
    matches: &ArgMatches<'_>,
    registry: &Arc<FpsRegistry>,
    mut config: Config,
    interfaces: Vec<Arc<dyn BusInterface>>,
) -> Result<(), JaegerError> {
    match matches.subcommand() {
        ("goto", Some(sub)) => {
            with_fps(registry, config, interfaces, false, |fps| cmd_goto(fps, sub)).await
        }
        ("set-positions", Some(sub)) => {
            with_fps(registry, config, interfaces, false, |fps| {
                cmd_set_positions(fps, sub)
            })
            .await
        }
        ("home", Some(sub)) => {
            with_fps(registry, config, interfaces, false, |fps| cmd_home(fps, sub)).await
        }
        ("list-positioners", _) => {
            with_fps(registry, config, interfaces, false, cmd_list_positioners).await
        }
        ("status", Some(sub)) => {
            with_fps(registry, config, interfaces, false, |fps| cmd_status(fps, sub)).await
        }
        ("unlock", _) => {
            // The lock sentinel of the locked fleet must not veto startup.
            config.fps.use_lock = false;
            let lock_file = config.files.lock_file.clone();
            with_fps(registry, config, interfaces, false, |fps| async move {
                fps.unlock(false).await?;
                if lock_file.exists() {
                    std::fs::remove_file(&lock_file)?;
                }
                println!("{}", "FPS unlocked.".green());
                Ok(())
            })
            .await
        }
        _ => with_fps(registry, config, interfaces, true, cmd_actor).await,
    }
}

/// Builds the FPS, runs the operation and always shuts down afterwards.
async fn with_fps<F, Fut>(
    registry: &Arc<FpsRegistry>,
    config: Config,
    interfaces: Vec<Arc<dyn BusInterface>>,
    start_pollers: bool,
    operation: F,
) -> Result<(), JaegerError>
where
    F: FnOnce(Arc<Fps>) -> Fut,
    Fut: Future<Output = Result<(), JaegerError>>,
{
    let fps = Fps::new(registry, config, interfaces)?;
    fps.start_can()?;
    fps.initialise(Some(start_pollers), true).await?;

    let result = operation(Arc::clone(&fps)).await;
    let shutdown = fps.shutdown().await;

    result?;
    shutdown
}

fn build_interfaces(
    config: &Config,
    profile: &str,
    npositioners: u16,
) -> Result<Vec<Arc<dyn BusInterface>>, JaegerError> {
    let descriptor = config
        .profile(profile)
        .ok_or_else(|| JaegerError::Config(format!("unknown profile {profile:?}")))?;

    match descriptor.interface_type.as_str() {
        "virtual" => {
            let channels = if descriptor.channels.is_empty() {
                vec!["virtual0".to_string()]
            } else {
                descriptor.channels.clone()
            };
            // All virtual positioners live on the first channel.
            Ok(channels
                .iter()
                .enumerate()
                .map(|(index, channel)| {
                    let bus = VirtualBus::new(channel.clone());
                    if index == 0 {
                        Arc::new(bus.with_positioners(npositioners)) as Arc<dyn BusInterface>
                    } else {
                        Arc::new(bus) as Arc<dyn BusInterface>
                    }
                })
                .collect())
        }
        other => Err(JaegerError::Config(format!(
            "unsupported interface type {other:?} in profile {profile:?}"
        ))),
    }
}

fn spawn_signal_handler(registry: Arc<FpsRegistry>) {
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("cannot install SIGHUP handler");

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }

        if let Some(fps) = registry.instance() {
            let _ = fps
                .send_now(Command::broadcast(CommandID::SendTrajectoryAbort))
                .await;
            error!("stopping positioners and cancelling due to signal");
            process::exit(EXIT_OK);
        } else {
            error!("cannot shutdown FPS before initialisation");
            process::exit(EXIT_ERROR);
        }
    });
}

async fn cmd_actor(fps: Arc<Fps>) -> Result<(), JaegerError> {
    let mut events = fps.subscribe_events();
    let mut status_changes = fps.subscribe_status();

    println!(
        "{} {} positioners connected",
        "jaeger actor running:".green().bold(),
        fps.n_positioners().await
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event).unwrap_or_default()),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            },
            status = status_changes.recv() => match status {
                Ok(status) => println!(
                    "{}",
                    serde_json::json!({"status": status.bits()})
                ),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            },
        }
    }

    Ok(())
}

async fn cmd_goto(fps: Arc<Fps>, matches: &ArgMatches<'_>) -> Result<(), JaegerError> {
    let values: Vec<&str> = matches.values_of("args").unwrap_or_default().collect();
    if values.len() < 2 {
        return Err(JaegerError::Usage(
            "goto requires at least ALPHA and BETA".into(),
        ));
    }

    let alpha: f64 = values[values.len() - 2]
        .parse()
        .map_err(|_| JaegerError::Usage("ALPHA must be a number".into()))?;
    let beta: f64 = values[values.len() - 1]
        .parse()
        .map_err(|_| JaegerError::Usage("BETA must be a number".into()))?;

    for angle in [alpha, beta] {
        if !(-10.0..=370.0).contains(&angle) {
            return Err(JaegerError::Usage(
                "angles must be in the range [-10, 370]".into(),
            ));
        }
    }

    let speed = matches
        .value_of("speed")
        .map(str::parse::<f64>)
        .transpose()
        .map_err(|_| JaegerError::Usage("--speed must be a number".into()))?;

    let positioner_ids: Vec<u16> = if matches.is_present("all") {
        if !matches.is_present("force") {
            return Err(JaegerError::Usage(
                "use --force to move all positioners at once".into(),
            ));
        }
        fps.positioner_ids().await
    } else {
        values[..values.len() - 2]
            .iter()
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|_| JaegerError::Usage(format!("invalid positioner id {value:?}")))
            })
            .collect::<Result<_, _>>()?
    };

    if positioner_ids.is_empty() {
        return Err(JaegerError::Usage("no positioners specified".into()));
    }

    let relative = matches.is_present("relative");
    let new_positions: HashMap<u16, (f64, f64)> = positioner_ids
        .iter()
        .map(|&pid| (pid, (alpha, beta)))
        .collect();

    fps.goto(new_positions, speed, relative).await?;

    for (pid, alpha, beta) in fps.get_positions(true).await {
        if positioner_ids.contains(&pid) {
            println!(
                "{} {} alpha={} beta={}",
                "moved".green(),
                pid,
                format_angle(alpha).cyan(),
                format_angle(beta).cyan(),
            );
        }
    }
    Ok(())
}

async fn cmd_set_positions(fps: Arc<Fps>, matches: &ArgMatches<'_>) -> Result<(), JaegerError> {
    let pid: u16 = parse_positioner(matches)?;
    let alpha: f64 = matches
        .value_of("alpha")
        .unwrap()
        .parse()
        .map_err(|_| JaegerError::Usage("ALPHA must be a number".into()))?;
    let beta: f64 = matches
        .value_of("beta")
        .unwrap()
        .parse()
        .map_err(|_| JaegerError::Usage("BETA must be a number".into()))?;

    if !(0.0..360.0).contains(&alpha) {
        return Err(JaegerError::Usage("alpha must be in the range [0, 360)".into()));
    }
    if !(0.0..360.0).contains(&beta) {
        return Err(JaegerError::Usage("beta must be in the range [0, 360)".into()));
    }

    fps.set_position(pid, alpha, beta).await?;
    println!("positioner {pid} set to ({alpha}, {beta}).");
    Ok(())
}

async fn cmd_home(fps: Arc<Fps>, matches: &ArgMatches<'_>) -> Result<(), JaegerError> {
    let pid: u16 = parse_positioner(matches)?;
    let axis = matches.value_of("axis");
    let alpha = axis.is_none() || axis == Some("alpha");
    let beta = axis.is_none() || axis == Some("beta");

    fps.home(pid, alpha, beta).await?;
    println!("{} positioner {pid} homed.", "done:".green());
    Ok(())
}

async fn cmd_list_positioners(fps: Arc<Fps>) -> Result<(), JaegerError> {
    let mut positions = fps.get_positions(false).await;
    positions.sort_unstable_by_key(|&(pid, _, _)| pid);

    println!("{}", "connected positioners".bold());
    for (pid, alpha, beta) in positions {
        let positioner = fps.positioner(pid).await;
        let flags = positioner
            .map(|p| {
                let mut flags = Vec::new();
                if p.disabled {
                    flags.push("disabled");
                }
                if p.offline {
                    flags.push("offline");
                }
                flags.join(",")
            })
            .unwrap_or_default();
        println!(
            "{:>5}  alpha={:>10}  beta={:>10}  {}",
            pid,
            format_angle(alpha),
            format_angle(beta),
            flags.red(),
        );
    }
    Ok(())
}

async fn cmd_status(fps: Arc<Fps>, matches: &ArgMatches<'_>) -> Result<(), JaegerError> {
    let pid: u16 = parse_positioner(matches)?;
    let positioner = fps
        .positioner(pid)
        .await
        .ok_or(JaegerError::UnknownPositioner { id: pid })?;

    println!(
        "Firmware: {}",
        positioner
            .firmware
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string())
    );
    println!("Bootloader: {}", positioner.is_bootloader());
    println!(
        "Status: {} ({})",
        positioner.status.bits(),
        positioner.status.active_bits()
    );
    println!(
        "Position: alpha={}, beta={}",
        format_angle(positioner.alpha),
        format_angle(positioner.beta)
    );
    Ok(())
}

fn parse_positioner(matches: &ArgMatches<'_>) -> Result<u16, JaegerError> {
    matches
        .value_of("positioner")
        .unwrap()
        .parse()
        .map_err(|_| JaegerError::Usage("POSITIONER must be an integer id".into()))
}

fn format_angle(angle: Option<f64>) -> String {
    angle
        .map(|value| format!("{value:.3}"))
        .unwrap_or_else(|| "?".to_string())
}
