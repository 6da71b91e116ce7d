//! Parsing of lines typed into the chat client

use securechat_core::Recipient;

use crate::error::{CliError, Result};

/// What a typed line asks the client to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Private { target: Recipient, text: String },
    WhoIsIn,
    Logout,
    Empty,
}

/// Interpret one line: `/who`, `/pm <target> <text>`, `/logout`, or chat text
pub fn parse_line(line: &str) -> Result<Input> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/who" => Ok(Input::WhoIsIn),
        "/logout" | "/quit" => Ok(Input::Logout),
        "/pm" => {
            let (target, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| CliError::Input("usage: /pm <target> <text>".into()))?;
            Ok(Input::Private {
                target: Recipient::parse(target),
                text: text.trim().to_string(),
            })
        }
        _ => Ok(Input::Chat(line.to_string())),
    }
}
