use clap::Parser;
use log::info;
use mctp_ctrl::config::{DEFAULT_BAUD, DEFAULT_PORT, DEFAULT_READ_TIMEOUT};
use mctp_ctrl::{CommTask, DataRegistry, FsmConfig, ObserverEvent, SerialLink};
use parking_lot::RwLock;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Controller-side MCTP session driver.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Launch the graphical frontend (default).
    #[arg(long, conflicts_with = "cmd")]
    gui: bool,
    /// Drive the session from standard input.
    #[arg(long)]
    cmd: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if !args.cmd {
        eprintln!("no graphical frontend is linked into this build; run with --cmd");
        return ExitCode::FAILURE;
    }
    match run_cmd() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_cmd() -> mctp_ctrl::Result<()> {
    let mut link = SerialLink::new();
    link.open(DEFAULT_PORT, DEFAULT_BAUD, DEFAULT_READ_TIMEOUT)?;

    let registry = Arc::new(RwLock::new(DataRegistry::new()));
    let config = FsmConfig::default();
    // Worst case for a stop to settle: the stop window plus one blocked
    // read, with margin.
    let stop_wait = config.stop_deadline + DEFAULT_READ_TIMEOUT + Duration::from_secs(1);
    let mut task = CommTask::start(Box::new(link), Arc::clone(&registry), config);

    // Surface observer events on the terminal in the background.
    let events = task.events();
    std::thread::spawn(move || {
        for event in events {
            match event {
                ObserverEvent::StatusFailed => info!("status: failed"),
                ObserverEvent::StatusSyncing => info!("status: syncing"),
                ObserverEvent::StatusConnected(n) => info!("status: connected, {n} channels"),
                ObserverEvent::AppendText(texts) => {
                    for (ch_id, text) in texts {
                        info!("ch {ch_id}: {text}");
                    }
                }
                ObserverEvent::ChannelInfoUpdate(_) | ObserverEvent::ChannelInfoDraw => {}
            }
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "sync" => task.open_sync(),
            "request" => task.send_request(),
            "stop" => {
                task.send_stop();
                // Save only once the worker has finished ingesting.
                if task.wait_transfer_end(stop_wait) {
                    registry.read().save_data();
                    registry.write().clear_data();
                } else {
                    println!("transfer did not stop in time; data not saved");
                }
            }
            "drop" => task.send_drop(),
            "exit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
    task.stop();
    Ok(())
}
