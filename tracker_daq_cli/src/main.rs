//! # tracker_daq_cli
//!
//! Command-line front end for the tracker_daq run control.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! tracker_daq_cli -p config.yaml new
//! ```
//!
//! then edit it and start the run sequence with
//!
//! ```bash
//! tracker_daq_cli -p config.yaml
//! ```
//!
//! While runs are being taken, typing `abort` (or `q`) followed by enter
//! requests an operator abort: in-flight data is still drained and
//! finalized, and the remaining runs in the range are skipped.
//!
//! The boards driven by this binary are the software emulation from
//! `libtracker_daq::emulator`; a deployment with real hardware constructs
//! its `RegisterLink` implementation and hands it to the library the same
//! way. Library output goes to `tracker_daq.log`.

use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libtracker_daq::config::Config;
use libtracker_daq::controller::{BoardHandle, RunController};
use libtracker_daq::emulator::{EmulatedBoard, EmulatedTelemetry};
use libtracker_daq::registers::SharedLink;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Route library logging to a file so the terminal stays usable for the
/// progress bar and operator input.
fn setup_library_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./tracker_daq.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create the log file sink!"),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .expect("Could not create the library logger!"),
    );
    spdlog::set_default_logger(logger);
}

fn main() {
    // Create a cli
    let matches = Command::new("tracker_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    setup_library_logging();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if matches.subcommand_matches("new").is_some() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );

        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    if let Err(e) = config.validate() {
        log::error!("{e}");
        return;
    }
    log::info!("Config successfully loaded.");
    log::info!("Output Path: {}", config.output_path.to_string_lossy());
    log::info!(
        "First Run: {} Number of Runs: {}",
        config.first_run_number,
        config.n_runs
    );
    log::info!("Acquisition Window (ms): {}", config.acquisition_window_ms);
    log::info!("Boards: {}", config.boards.len());
    log::info!("Reuse Thresholds: {}", config.reuse_thresholds);
    log::info!("Boards are emulated; see tracker_daq.log for the run detail.");

    // One emulated register link per configured board
    let boards: Vec<BoardHandle> = config
        .boards
        .iter()
        .map(|board| {
            let chips: Vec<u8> = board.chips.iter().map(|chip| chip.id).collect();
            let link: SharedLink = Arc::new(Mutex::new(EmulatedBoard::new(board.id, &chips)));
            BoardHandle::new(board, link)
        })
        .collect();

    let mut controller = RunController::new(config, boards, Box::new(EmulatedTelemetry::new()));
    let progress = controller.progress();
    let abort = controller.abort_handle();

    // Watch stdin for an operator abort
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) if matches!(text.trim(), "abort" | "q") => {
                    log::warn!("Operator abort requested; finishing in-flight data...");
                    abort.abort();
                    break;
                }
                Ok(_) => log::info!("Type 'abort' to stop the run sequence."),
                Err(_) => break,
            }
        }
    });

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(100));
    // Spawn the task!
    let handle = std::thread::spawn(move || controller.execute());

    loop {
        std::thread::sleep(Duration::from_millis(500));
        match progress.lock() {
            Ok(state) => {
                pb.set_position((state.fraction * 100.0) as u64);
            }
            Err(e) => log::error!("{e}"),
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(_) => log::info!("All runs taken and logged!"),
                    Err(e) => log::error!("Run sequence ended early: {e}"),
                },
                Err(_) => log::error!("Failed to join the run controller task!"),
            }
            break;
        }
    }

    pb.finish();

    log::info!("Done.");
}
