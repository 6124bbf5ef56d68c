//! Operator console: line commands on stdin

use std::io::BufRead;
use std::str::FromStr;
use std::thread;

use tracing::{info, warn};

use crate::pipeline::ControlHandle;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Start(String),
    Stop(String),
    Health(Option<String>),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}' (expected start, stop, health or quit)")]
    Unknown(String),
    #[error("'{0}' needs a stream id")]
    MissingId(&'static str),
}

impl FromStr for OperatorCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let id = words.next().map(str::to_string);

        match verb.to_ascii_lowercase().as_str() {
            "start" | "start-stream" => id.map(Self::Start).ok_or(CommandError::MissingId("start")),
            "stop" | "stop-stream" => id.map(Self::Stop).ok_or(CommandError::MissingId("stop")),
            "health" | "get-health" => Ok(Self::Health(id)),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Run one command; returns the text to show the operator
pub fn execute(control: &ControlHandle, command: &OperatorCommand) -> Result<String> {
    match command {
        OperatorCommand::Start(id) => {
            control.start_stream(id)?;
            Ok(format!("starting {}", id))
        }
        OperatorCommand::Stop(id) => {
            control.stop_stream(id)?;
            Ok(format!("stopping {}", id))
        }
        OperatorCommand::Health(Some(id)) => {
            let health = control.health(id)?;
            Ok(format!("{}: {}", id, health))
        }
        OperatorCommand::Health(None) => Ok(control
            .health_all()
            .into_iter()
            .map(|(id, health)| format!("{}: {}", id, health))
            .collect::<Vec<_>>()
            .join("\n")),
        OperatorCommand::Quit => Ok("shutting down".to_string()),
    }
}

/// Stdin is read on a plain thread so a pending read never holds up runtime shutdown
fn stdin_lines() -> flume::Receiver<String> {
    let (tx, rx) = flume::unbounded();
    let spawned = thread::Builder::new()
        .name("argus-console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Console unavailable: {}", e);
    }
    rx
}

/// Read commands from stdin until `quit`. On end of input this never returns,
/// leaving shutdown to the signal handler.
pub async fn console(control: ControlHandle) {
    let lines = stdin_lines();

    while let Ok(line) = lines.recv_async().await {
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match execute(&control, &command) {
            Ok(reply) => println!("{}", reply),
            Err(e) => println!("error: {}", e),
        }
        if command == OperatorCommand::Quit {
            info!("Quit requested from console");
            return;
        }
    }

    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!("start gate".parse(), Ok(OperatorCommand::Start("gate".into())));
        assert_eq!("stop-stream 2".parse(), Ok(OperatorCommand::Stop("2".into())));
        assert_eq!("health".parse(), Ok(OperatorCommand::Health(None)));
        assert_eq!(" HEALTH cam ".parse(), Ok(OperatorCommand::Health(Some("cam".into()))));
        assert_eq!("quit".parse(), Ok(OperatorCommand::Quit));
    }

    #[test]
    fn rejects_bad_commands() {
        assert_eq!("start".parse::<OperatorCommand>(), Err(CommandError::MissingId("start")));
        assert_eq!("reboot".parse::<OperatorCommand>(), Err(CommandError::Unknown("reboot".into())));
        assert_eq!("".parse::<OperatorCommand>(), Err(CommandError::Empty));
    }
}
