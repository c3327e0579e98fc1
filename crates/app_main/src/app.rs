//! Line-oriented front end
//!
//! Reads one command per line from stdin and prints list status to stdout.
//! Core events are logged and drive display refreshes.

use anyhow::Result;
use app_core::{CoreEvent, Sorter};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Commands understood on stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Next,
    Previous,
    First,
    Last,
    Random,
    Move(String),
    Delete,
    Undo,
    Status,
    Quit,
}

impl Command {
    /// Parse a command line. Returns `None` for anything unrecognised.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next()?;
        let arg = parts.collect::<Vec<_>>().join(" ");

        let command = match (cmd, arg.is_empty()) {
            ("n", true) => Command::Next,
            ("p", true) => Command::Previous,
            ("f", true) => Command::First,
            ("l", true) => Command::Last,
            ("r", true) => Command::Random,
            ("m", false) => Command::Move(arg),
            ("d", true) => Command::Delete,
            ("u", true) => Command::Undo,
            ("s", true) => Command::Status,
            ("q", true) => Command::Quit,
            _ => return None,
        };
        Some(command)
    }
}

const HELP: &str = "commands: n p f l r | m <category> | d | u | s | q";

/// Run the command loop until `q` or end of input
pub fn run(sorter: &Sorter) -> Result<()> {
    subscribe_events(sorter);
    sorter.refresh();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", HELP)?;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let Some(command) = Command::parse(&line) else {
            writeln!(stdout, "{}", HELP)?;
            continue;
        };
        if command == Command::Quit {
            break;
        }

        execute_command(sorter, &command);
        print_status(sorter, &mut stdout)?;
    }

    Ok(())
}

fn execute_command(sorter: &Sorter, command: &Command) {
    tracing::debug!("Command: {:?}", command);
    let list = sorter.list();

    let result = match command {
        Command::Next => Ok(list.next().is_some()),
        Command::Previous => Ok(list.previous().is_some()),
        Command::First => Ok(list.first().is_some()),
        Command::Last => Ok(list.last().is_some()),
        Command::Random => Ok(list.random().is_some()),
        Command::Move(category) => sorter.files().move_current(category).map(|_| true),
        Command::Delete => sorter.files().delete_current().map(|_| true),
        Command::Undo => sorter.files().undo().map(|_| true),
        Command::Status | Command::Quit => Ok(false),
    };

    match result {
        Ok(true) => {
            sorter.show_current();
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!("{:?} failed: {}", command, e);
            eprintln!("{}", e.user_message());
        }
    }
}

fn print_status(sorter: &Sorter, out: &mut impl Write) -> io::Result<()> {
    let status = sorter.status();
    match (status.index, status.path) {
        (Some(index), Some(path)) => writeln!(out, "[{}/{}] {}", index + 1, status.len, path.display()),
        _ => writeln!(out, "[0/{}] no image", status.len),
    }
}

fn subscribe_events(sorter: &Sorter) {
    let cache = Arc::downgrade(sorter.cache());
    let data = Arc::clone(sorter.data());

    sorter.events().subscribe(move |event| match event {
        CoreEvent::ImageReady { path, image } => {
            let (w, h) = image.dimensions();
            tracing::info!("Ready: {} ({}x{}, {} frame(s))", path.display(), w, h, image.frame_count());
        }
        CoreEvent::ImageUnavailable { path } => {
            tracing::warn!("Unavailable: {}", path.display());
        }
        CoreEvent::DisplayRefreshRequested { current } => {
            // The cache drops duplicate requests for the same path
            if let (Some(path), Some(cache)) = (current, cache.upgrade()) {
                if data.current_path().as_ref() == Some(path) {
                    cache.retrieve(path, true, true);
                }
            }
        }
        CoreEvent::ScanStarted => tracing::info!("Scan started"),
        CoreEvent::ScanFinished => tracing::info!("Scan finished: {} images", data.len()),
        CoreEvent::FileTaskFinished { action, path, success } => {
            tracing::info!("{:?} {}: {}", action, path.display(), if *success { "ok" } else { "failed" });
        }
        CoreEvent::ListSizeChanged { .. } | CoreEvent::ListUpdated => {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("n"), Some(Command::Next));
        assert_eq!(Command::parse("  p  "), Some(Command::Previous));
        assert_eq!(Command::parse("m Cats"), Some(Command::Move("Cats".into())));
        assert_eq!(Command::parse("m Good Dogs"), Some(Command::Move("Good Dogs".into())));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("m"), None);
        assert_eq!(Command::parse("n 3"), None);
        assert_eq!(Command::parse("x"), None);
    }
}
