use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use startgrid::health::HealthMonitor;
use startgrid::logging::{log, obj, tick_aggregator, v_str, Domain, Level};
use startgrid::store::rest::RestStore;
use startgrid::store::RemoteStore;
use startgrid::{Config, Session, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Up,
    Down,
    Move(i64),
    Confirm,
    Vacate(usize),
    Reset,
    Preview,
    Show,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next();
    let number = |what: &str| -> Result<i64, String> {
        arg.ok_or_else(|| format!("{} needs an argument", what))?
            .parse::<i64>()
            .map_err(|e| format!("{}: {}", what, e))
    };
    match head.as_str() {
        "up" | "k" => Ok(Command::Up),
        "down" | "j" => Ok(Command::Down),
        "move" => number("move").map(Command::Move),
        "confirm" | "c" => Ok(Command::Confirm),
        "vacate" => {
            let p = number("vacate")?;
            usize::try_from(p)
                .map(Command::Vacate)
                .map_err(|_| format!("vacate: bad position {}", p))
        }
        "reset" => Ok(Command::Reset),
        "preview" | "p" => Ok(Command::Preview),
        "show" | "s" | "" => Ok(Command::Show),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{}'", other)),
    }
}

fn report(err: &SyncError) {
    if err.is_retryable() {
        println!("! {} (local change kept, retry when the store is back)", err);
    } else {
        println!("! {}", err);
    }
}

async fn run_command(session: &mut Session, cmd: Command) {
    let outcome = match cmd {
        Command::Up => session.move_up().await.map(|_| ()),
        Command::Down => session.move_down().await.map(|_| ()),
        Command::Move(delta) => session.move_cursor(delta).await.map(|_| ()),
        Command::Confirm => session.confirm_current_selection().await.map(|done| {
            println!("placed {} at {}", done.competitor, done.position);
            if let Some(warning) = done.sync_warning {
                report(&warning);
            }
        }),
        Command::Vacate(position) => session.vacate(position).await.map(|prev| match prev {
            Some(c) => println!("vacated {} ({})", position, c),
            None => println!("position {} was already empty", position),
        }),
        Command::Reset => session.reset_all().await,
        Command::Preview => session.preview().map(|table| {
            let mut preview = session.snapshot();
            preview.slots = table;
            println!("-- preview --\n{}", preview);
        }),
        Command::Show | Command::Quit => Ok(()),
    };
    match outcome {
        Ok(()) => println!("{}", session.snapshot()),
        Err(err) => report(&err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store: Arc<dyn RemoteStore> = Arc::new(RestStore::new(&cfg).context("building store client")?);
    let mut session = Session::start(store.clone(), cfg.clone())
        .await
        .context("starting session")?;
    let (mut health, health_task) =
        HealthMonitor::new(store, cfg.health_failure_threshold, cfg.remote_timeout).spawn(cfg.health_interval);

    log(
        Level::Info,
        Domain::System,
        "controller_ready",
        obj(&[
            ("session_id", v_str(session.session_id())),
            ("store", v_str(&cfg.store_url)),
        ]),
    );
    println!("{}", session.snapshot());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut online = true;
    let mut health_open = true;
    loop {
        tick_aggregator();
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => run_command(&mut session, cmd).await,
                    Err(msg) => println!("? {}", msg),
                }
            }
            signal = session.next_signal(), if session.has_feeds() => {
                let Some(signal) = signal else { continue };
                match session.handle_signal(signal).await {
                    Ok(true) => println!("{}", session.snapshot()),
                    Ok(false) => {}
                    Err(err) => report(&err),
                }
            }
            changed = health.changed(), if health_open => {
                if changed.is_err() {
                    health_open = false;
                    continue;
                }
                let status = health.borrow_and_update().clone();
                if status.online != online {
                    online = status.online;
                    println!("store {}", if online { "online" } else { "OFFLINE" });
                }
                if online {
                    match session.resubscribe().await {
                        Ok(0) => {}
                        Ok(_) => println!("{}", session.snapshot()),
                        Err(err) => report(&err),
                    }
                }
            }
        }
    }

    session.shutdown();
    health_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("up"), Ok(Command::Up));
        assert_eq!(parse_command("move -3"), Ok(Command::Move(-3)));
        assert_eq!(parse_command("vacate 4"), Ok(Command::Vacate(4)));
        assert_eq!(parse_command("  "), Ok(Command::Show));
        assert_eq!(parse_command("QUIT"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_command("move").is_err());
        assert!(parse_command("vacate -1").is_err());
        assert!(parse_command("launch").is_err());
    }
}
