//! # Recording session entry point
//!
//! Runs the simulated dual-arm rig: three cameras in a 30 Hz sensor group, two arms in a
//! 120 Hz controller group. Each recorded episode is aligned onto the camera timeline,
//! deduplicated and written under `{save_dir}/{task_name}/episode{N}/`.
//!
//! ## Configuration
//! - `RIG_CONFIG`: path to a JSON `SessionConfig`; defaults are used when unset.
//! - `RUST_LOG`: log level (`info` recommended).
//!
//! ## Outputs
//! - Episodes and the `config.json` sidecar under the task directory.
//! - `data/logs/tick_events.csv`: per-tick start/complete/failure events.
//! - `data/logs/session_summary.csv`: one row per group per session.

use std::{
    env,
    io::{Write, stdin, stdout},
    path::PathBuf,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{error, info, warn};

use teleop_sync::{
    align::pipeline::DiffFreqSink,
    config::SessionConfig,
    data::collector::Collector,
    engine::group::Rig,
    sim::{ArmMotion, demo_components},
    utils::{export::export_session_summary, metrics::TickRecorder},
};

const WARMUP: Duration = Duration::from_millis(200);
const DRIFT_STEP: f64 = 0.002;

fn main() {
    env_logger::init();
    info!("=== TELEOP SYNC START ===");

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    loop {
        let Some(choice) = prompt_menu(&config) else {
            info!("=== TELEOP SYNC FINISHED ===");
            return;
        };
        match choice.as_str() {
            "1" | "" => {
                let (episodes, secs) = prompt_episodes(&config);
                run_and_report(&config, ArmMotion::Drifting { step: DRIFT_STEP }, episodes, secs);
            }
            "2" => {
                let (episodes, secs) = prompt_episodes(&config);
                run_and_report(&config, ArmMotion::Holding, episodes, secs);
            }
            "3" => {
                println!("Exiting. Goodbye!");
                info!("=== TELEOP SYNC FINISHED ===");
                return;
            }
            other => {
                println!("Unrecognized option '{}', please try again.", other);
            }
        }
    }
}

fn load_config() -> Result<SessionConfig, teleop_sync::error::ConfigError> {
    match env::var_os("RIG_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            info!("Loading session config from {:?}", path);
            SessionConfig::from_path(&path)
        }
        None => {
            let config = SessionConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn read_line() -> Option<String> {
    let _ = stdout().flush();
    let mut input = String::new();
    match stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    }
}

fn prompt_menu(config: &SessionConfig) -> Option<String> {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     TELEOP SYNC: task '{}'", config.collect.task_name);
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) Record episodes (arms moving)           │");
    println!("│  2) Record episodes (arms holding still)    │");
    println!("│  3) Exit                                    │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select [1/2/3] (default: 1): ");
    read_line()
}

fn prompt_episodes(config: &SessionConfig) -> (u32, f64) {
    print!("Number of episodes [default: {}]: ", config.episodes);
    let episodes = read_line()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(config.episodes);
    print!("Seconds per episode [default: {}]: ", config.episode_secs);
    let secs = read_line()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0)
        .unwrap_or(config.episode_secs);
    (episodes, secs)
}

fn run_and_report(config: &SessionConfig, motion: ArmMotion, episodes: u32, secs: f64) {
    match run_session(config, motion, episodes, secs) {
        Ok(written) => println!("\n {} of {} episodes written. Returning to menu...\n", written, episodes),
        Err(e) => error!("Session failed: {}", e),
    }
}

fn run_session(
    config: &SessionConfig,
    motion: ArmMotion,
    episodes: u32,
    secs: f64,
) -> teleop_sync::Result<u32> {
    let recorder = TickRecorder::new();
    recorder.start_exporter(&config.event_log)?;

    let components = demo_components(&config.rig, &config.align, motion);
    let mut rig = Rig::new(&config.rig, components)?.with_recorder(recorder.clone());
    let mut collector = Collector::new(config.collect.clone())?
        .with_sink(Box::new(DiffFreqSink::new(config.align.clone())));

    rig.start()?;
    thread::sleep(WARMUP);

    let mut written = 0;
    for n in 0..episodes {
        info!("[Main] episode {}/{}: recording {:.1}s", n + 1, episodes, secs);
        rig.begin_episode();
        thread::sleep(Duration::from_secs_f64(secs));
        match rig.finish_episode(&mut collector) {
            Ok(path) => {
                written += 1;
                info!("[Main] saved {:?}", path);
            }
            Err(e) => error!("[Main] episode discarded: {}", e),
        }
    }

    let reports = rig.stop()?;
    recorder.stop_exporter();
    for report in reports.iter().filter(|r| r.halted) {
        warn!("[Main] group {} halted: {:?}", report.name, report.faults.last());
    }

    let session = format!(
        "{}-{}",
        config.collect.task_name,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    );
    export_session_summary(
        &config.summary_csv,
        &session,
        &reports,
        |group| config.rig.group(group).map(|g| g.hz),
        written,
    )?;
    Ok(written)
}
