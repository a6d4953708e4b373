//! Interactive command shell.
//!
//! Reads one command per line and writes one reply per command. The reader
//! and writer are generic so the same loop serves stdin/stdout and tests.

use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::debug;

use crate::Db;

pub const PROMPT: &str = ">>> ";
pub const NOT_FOUND: &str = "NOT_FOUND";

const HELP: &str = "\
Commands:
  get <key>
  put <key> <value...>
  putbat <n>        then n lines of `put <key> <value...>` or `del <key>`
  del <key>
  compact
  log
  cls
  quit
  help";

/// One parsed shell command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Get(&'a str),
    Put(&'a str, &'a str),
    PutBat(usize),
    Del(&'a str),
    Compact,
    Log,
    Clear,
    Quit,
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing key")]
    MissingKey,

    #[error("missing key or value")]
    MissingKeyOrValue,

    #[error("missing batch count")]
    MissingCount,

    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command<'_>>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (cmd, rest) = split_word(line);
    let command = match cmd {
        "get" | "del" => {
            let (key, _) = split_word(rest);
            if key.is_empty() {
                return Err(CommandError::MissingKey);
            }
            if cmd == "get" {
                Command::Get(key)
            } else {
                Command::Del(key)
            }
        }
        "put" => {
            let (key, value) = split_word(rest);
            if key.is_empty() || value.is_empty() {
                return Err(CommandError::MissingKeyOrValue);
            }
            Command::Put(key, value)
        }
        "putbat" => {
            let (n, _) = split_word(rest);
            Command::PutBat(n.parse().map_err(|_| CommandError::MissingCount)?)
        }
        "compact" => Command::Compact,
        "log" => Command::Log,
        "cls" => Command::Clear,
        "quit" => Command::Quit,
        "help" => Command::Help,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn status(ok: bool, op: &str) -> String {
    format!("{op} {}", if ok { "SUCCESS" } else { "FAILED" })
}

/// Runs the command loop until `quit` or end of input.
pub fn run<R: BufRead, W: Write>(db: &Db, input: &mut R, output: &mut W) -> io::Result<()> {
    let mut line = String::new();

    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            debug!("shell input closed");
            return Ok(());
        }

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                writeln!(output, "Error: {e}")?;
                continue;
            }
        };

        debug!(?command, "shell command");
        match command {
            Command::Get(key) => {
                let value = db.get(key);
                writeln!(output, "{}", value.as_deref().unwrap_or(NOT_FOUND))?;
            }
            Command::Put(key, value) => writeln!(output, "{}", status(db.put(key, value), "PUT"))?,
            Command::Del(key) => writeln!(output, "{}", status(db.del(key), "DEL"))?,
            Command::PutBat(n) => {
                let ok = db.putbat(input, n);
                writeln!(output, "{}", status(ok, "PUTBAT"))?;
            }
            Command::Compact => {
                let queued = db.detect_and_schedule();
                let reply = if queued {
                    "COMPACTION SCHEDULED"
                } else {
                    "NOTHING TO COMPACT"
                };
                writeln!(output, "{reply}")?;
            }
            Command::Log => {
                db.refresh_log();
                writeln!(output, "LOG FLUSHED")?;
            }
            Command::Clear => writeln!(output, "{}", status(db.clear(), "CLEAR"))?,
            Command::Help => writeln!(output, "{HELP}")?,
            Command::Quit => {
                writeln!(output, "bye")?;
                return Ok(());
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
