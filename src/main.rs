//! Headless driver for the loopviz engine
//!
//! Runs the engine at display rate and prints one JSON feature snapshot per
//! second. Press Enter (or close stdin) to stop.

use loopviz::{AudioConfig, AudioEngine};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_micros(16_667);
const TICKS_PER_REPORT: u64 = 60;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut engine = AudioEngine::new(AudioConfig::default());
    let mode = match engine.initialize() {
        Ok(mode) => mode,
        Err(e) => {
            log::error!("Failed to initialize audio engine: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Audio engine running in {:?} mode; press Enter to stop", mode);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut line = String::new();
            // Any line, EOF or read error ends the run
            let _ = io::stdin().lock().read_line(&mut line);
            stop.store(true, Ordering::SeqCst);
        });
    }

    let stdout = io::stdout();
    let mut ticks = 0u64;
    while !stop.load(Ordering::SeqCst) {
        engine.update();
        ticks += 1;

        if ticks % TICKS_PER_REPORT == 0 {
            match serde_json::to_string(&engine.snapshot()) {
                Ok(json) => {
                    let mut out = stdout.lock();
                    if writeln!(out, "{}", json).and_then(|_| out.flush()).is_err() {
                        log::warn!("stdout closed; stopping");
                        break;
                    }
                }
                Err(e) => log::error!("Failed to serialize snapshot: {}", e),
            }
        }

        thread::sleep(TICK);
    }

    engine.cleanup();
    log::info!("Audio engine stopped after {} ticks", ticks);
    ExitCode::SUCCESS
}
