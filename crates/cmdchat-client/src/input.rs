//! Terminal input — the slash-command grammar.
//!
//! Lines starting with `/` become commands; everything else is chat.
//! `/clear` and `/help` act locally and never reach the wire.

use std::path::PathBuf;

use cmdchat_core::envelope::Envelope;

/// What to do with one line of input.
#[derive(Debug, PartialEq, Eq)]
pub enum InputAction {
    /// Send this envelope to the server.
    Send(Envelope),
    /// Read the file and relay it to the room.
    SendFile(PathBuf),
    /// Clear the local screen.
    Clear,
    /// Show the local help text.
    Help,
    /// Clean disconnect.
    Quit,
    /// Unusable input; show the message locally.
    Invalid(String),
    /// Nothing to do (blank line).
    Nothing,
}

pub fn parse_line(line: &str) -> InputAction {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return InputAction::Nothing;
    }
    if !line.starts_with('/') {
        return InputAction::Send(Envelope::Chat {
            sender: String::new(),
            room: String::new(),
            text: line.to_string(),
            ts: 0,
            seq: 0,
        });
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "/nick" => {
            if rest.is_empty() {
                InputAction::Invalid("usage: /nick NAME".into())
            } else {
                InputAction::Send(Envelope::CmdNick { name: rest.to_string() })
            }
        }
        "/join" => {
            if rest.is_empty() {
                InputAction::Invalid("usage: /join ROOM".into())
            } else {
                InputAction::Send(Envelope::CmdJoin { room: rest.to_string() })
            }
        }
        "/send" => {
            if rest.is_empty() {
                InputAction::Invalid("usage: /send PATH".into())
            } else {
                InputAction::SendFile(PathBuf::from(rest))
            }
        }
        "/clear" => InputAction::Clear,
        "/help" => InputAction::Help,
        "/quit" => InputAction::Quit,
        other => InputAction::Invalid(format!("unknown command {other}; try /help")),
    }
}

/// The `/help` text.
pub const HELP: &str = "\
commands:
  /nick NAME   change display name
  /join ROOM   move to another room
  /send PATH   send a file to the room (up to 10 MiB)
  /clear       clear the screen
  /help        this text
  /quit        disconnect and exit";
