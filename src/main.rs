use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use aqua_ledger::csv::{read_commands, write_wallets};
use aqua_ledger::engine::ScriptedProvider;
use aqua_ledger::signing::LinkMode;
use aqua_ledger::{Config, Engine, MemoryStore, Replay};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: aqua-ledger <events.csv>\n       aqua-ledger sign <machine-id> [--ephemeral]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = Config::from_env().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(2);
    });

    match args.first().map(String::as_str) {
        Some("sign") => sign(config, &args[1..]),
        Some(path) => replay(config, path.to_string()).await,
        None => {
            eprintln!("{USAGE}");
            process::exit(2);
        }
    }
}

/// Print the deep URL of a signed machine link
fn sign(config: Config, args: &[String]) {
    let machine_id = args.first().expect(USAGE);
    let mode = if args.iter().skip(1).any(|a| a == "--ephemeral") {
        LinkMode::Ephemeral
    } else {
        LinkMode::Permanent
    };

    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedProvider::new()),
        config,
    )
    .unwrap_or_else(|e| {
        error!("{e}");
        process::exit(2);
    });
    match engine.generate_link(machine_id, mode) {
        Ok(link) => println!("{}", link.url),
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}

/// Replay an event file and print the resulting wallets
async fn replay(config: Config, path: String) {
    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let mut replay = Replay::new(config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(2);
    });

    let commands = read_commands(Path::new(&path)).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(cmd_receiver)).await;

    let wallets = replay.wallets().await.expect("failed to audit wallets");
    write_wallets(std::io::stdout().lock(), &wallets).expect("failed to write wallets");
}
