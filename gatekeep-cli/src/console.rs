//! Terminal input and slot rendering for `gatekeep run`

use std::io::Write as _;

use gatekeep_proto::LockState;
use gatekeep_session::{ConnectionState, SlotSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// One parsed line of interactive input
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Lock(String),
    Unlock(String),
    Status,
    Reset,
    Quit,
    Empty,
}

pub const HELP: &str = "Commands: lock <role>, unlock <role>, status, reset, quit";

pub fn parse_command(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Input::Empty);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(format!("Too many arguments. {HELP}"));
    }

    match (command.to_ascii_lowercase().as_str(), argument) {
        ("lock", Some(role)) => Ok(Input::Lock(role.to_string())),
        ("unlock", Some(role)) => Ok(Input::Unlock(role.to_string())),
        ("lock" | "unlock", None) => Err(format!("Usage: {command} <role>")),
        ("status", None) => Ok(Input::Status),
        ("reset", None) => Ok(Input::Reset),
        ("quit" | "exit", None) => Ok(Input::Quit),
        _ => Err(format!("Unknown command {line:?}. {HELP}")),
    }
}

/// `door: Scanning...` until the slot is usable, then `door: Connected, Locked`
pub fn render_slot(slot: &SlotSnapshot) -> String {
    match slot.state {
        ConnectionState::ServiceReady => {
            format!("{}: Connected, {}", slot.role, LockState::from_value(slot.last_value))
        }
        _ => format!("{}: Scanning...", slot.role),
    }
}

pub fn not_ready_message(role: &str) -> String {
    format!("Error: Disconnected - cannot lock/unlock {role} without a connection")
}

/// Answer to a `[current]` prompt: blank keeps the current value
pub fn keep_or_replace(answer: Option<&str>, current: &str) -> String {
    match answer.map(str::trim) {
        Some(answer) if !answer.is_empty() => answer.to_string(),
        _ => current.to_string(),
    }
}

/// Line reader over stdin, usable inside `select!`
pub struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next line without its newline, `None` at end of input
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    pub async fn prompt(&mut self, message: &str) -> std::io::Result<Option<String>> {
        print!("{message}");
        std::io::stdout().flush()?;
        self.next_line().await
    }
}
