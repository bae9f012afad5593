//! Per-connection shell sessions. A session starts awaiting a token,
//! guarded by the authentication timer, then loops over command lines
//! until the peer disconnects, exits, or times out. Responses render as
//! human text with ANSI color in echo mode or as one JSON envelope per
//! line in json mode; the commands themselves only ever produce plain
//! structured results.

use super::command::{self, Outcome};
use super::status::Status;
use super::Shared;
use crate::encoding::Value;
use crate::error::Result;

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";
const AUTH_PROMPT: &str = "Access token: ";
const BANNER: &str = concat!("sfdb ", env!("CARGO_PKG_VERSION"), ", type 'help' to list commands");

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Echo,
    Json,
}

struct Auth {
    token: String,
    alias: String,
}

struct Session {
    id: Uuid,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mode: Mode,
    timing: bool,
    auth: Option<Auth>,
    failures: u32,
}

/// Serves one connection to completion, then releases its token slot.
pub(crate) fn run(shared: Arc<Shared>, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            log::error!("Dropping connection without a peer address: {err}");
            return;
        }
    };
    let mut session = Session {
        id: Uuid::new_v4(),
        peer,
        shared: shared.clone(),
        mode: Mode::Echo,
        timing: false,
        auth: None,
        failures: 0,
    };
    if shared.config.logs.save_cli_connections {
        log::info!("Session {} connected from {peer}", session.id);
    }
    if let Err(err) = session.serve(stream) {
        log::error!("Session {} failed: {err}", session.id);
    }
    if let Some(auth) = &session.auth {
        let mut sessions = shared.sessions();
        if let Some(count) = sessions.get_mut(&auth.token) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                sessions.remove(&auth.token);
            }
        }
    }
    if shared.config.logs.save_cli_connections {
        log::info!("Session {} disconnected", session.id);
    }
}

impl Session {
    fn serve(&mut self, mut stream: TcpStream) -> Result<()> {
        // The authentication timer is the socket read timeout; it is
        // lifted once the session is authorized.
        let timeout = Duration::from_millis(self.shared.config.server.cli_authentication_timeout);
        stream.set_read_timeout(Some(timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        self.write(&mut stream, AUTH_PROMPT)?;

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if self.auth.is_some() {
                        continue;
                    }
                    let outcome = Outcome::status(Status::Timeout, "authentication timed out");
                    self.respond(&mut stream, "auth", &outcome, None)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
            let input = line.trim_end_matches(['\n', '\r']).to_string();

            if self.auth.is_none() {
                // Attributes never consume an auth attempt.
                if let Some(attribute) = input.strip_prefix('@') {
                    let outcome = self.attribute(attribute);
                    self.respond(&mut stream, "attribute", &outcome, None)?;
                    self.prompt(&mut stream)?;
                    continue;
                }
                let (outcome, close) = self.authenticate(input.trim());
                let authorized = outcome.status == Status::Authorized;
                self.respond(&mut stream, "auth", &outcome, None)?;
                if close {
                    break;
                }
                if authorized {
                    stream.set_read_timeout(None)?;
                    if self.mode == Mode::Echo {
                        self.write(&mut stream, &format!("{BANNER}\n"))?;
                    }
                }
                self.prompt(&mut stream)?;
                continue;
            }

            let limit = self.shared.input_limit;
            if limit > 0 && input.len() as u64 > limit {
                let outcome =
                    Outcome::status(Status::SizeLimit, format!("input exceeds {limit} bytes"));
                self.respond(&mut stream, "input", &outcome, None)?;
                self.prompt(&mut stream)?;
                continue;
            }

            if let Some(attribute) = input.strip_prefix('@') {
                let outcome = self.attribute(attribute);
                self.respond(&mut stream, "attribute", &outcome, None)?;
                self.prompt(&mut stream)?;
                continue;
            }

            if input.trim().is_empty() {
                self.prompt(&mut stream)?;
                continue;
            }

            let start = Instant::now();
            let outcome = match command::parse(&input) {
                Ok(parsed) => self.shared.registry.dispatch(&parsed, &self.shared),
                Err(err) => Outcome::status(Status::CommandMismatch, err.to_string()),
            };
            let action = input.split_whitespace().next().unwrap_or("command").to_string();
            if outcome.status == Status::Exit {
                self.respond(&mut stream, &action, &outcome, None)?;
                break;
            }
            self.respond(&mut stream, &action, &outcome, Some(start.elapsed()))?;
            self.prompt(&mut stream)?;
        }
        Ok(())
    }

    /// Handles a token presented while unauthorized. Returns the response
    /// and whether the connection must close afterwards.
    fn authenticate(&mut self, token: &str) -> (Outcome, bool) {
        let config = &self.shared.config.server;
        let rejected = Outcome::status(Status::AuthorizeAgain, "access denied, authorize again");

        // A locked-down subject gets the same response as a bad token,
        // with no further counting; the cause only shows in the log.
        let subject = self.shared.lockdown.subject(&self.peer.ip(), token);
        if let Some(subject) = &subject {
            if self.shared.lockdown.is_locked_down(subject) {
                log::warn!("Session {} login rejected for {subject}: lockdown", self.id);
                self.failures += 1;
                let close =
                    config.max_cli_login_attempt > 0 && self.failures >= config.max_cli_login_attempt;
                return (rejected, close);
            }
        }

        let Some(key) = self.shared.tokens.access_keys.get(token) else {
            if let Some(subject) = &subject {
                if let Err(err) = self.shared.lockdown.record_failure(subject) {
                    log::error!("Failed to persist lockdown state: {err}");
                }
            }
            if self.shared.config.logs.save_cli_logins {
                log::warn!("Session {} failed login from {}", self.id, self.peer);
            }
            self.failures += 1;
            let close =
                config.max_cli_login_attempt > 0 && self.failures >= config.max_cli_login_attempt;
            return (rejected, close);
        };

        let mut sessions = self.shared.sessions();
        let count = sessions.get(token).copied().unwrap_or(0);
        if key.max_connections >= 0 && count as i64 >= key.max_connections {
            if self.shared.config.logs.save_cli_logins {
                log::warn!("Session {} rejected, room full for {}", self.id, key.alias);
            }
            return (Outcome::status(Status::FullRoom, "no connection slots left for this token"), true);
        }
        *sessions.entry(token.to_string()).or_insert(0) += 1;
        drop(sessions);

        self.auth = Some(Auth { token: token.to_string(), alias: key.alias.clone() });
        if self.shared.config.logs.save_cli_logins {
            log::info!("Session {} authorized as {}", self.id, key.alias);
        }
        let outcome = Outcome {
            message: format!("authorized as {}", key.alias),
            value: Some(Value::Str(key.alias.clone())),
            status: Status::Authorized,
            print_value: false,
        };
        (outcome, false)
    }

    /// Applies an `@` attribute line.
    fn attribute(&mut self, attribute: &str) -> Outcome {
        let mut parts = attribute.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("echo"), None, _) => {
                self.mode = Mode::Echo;
                Outcome::status(Status::ModeChanged, "switched to echo mode")
            }
            (Some("json"), None, _) => {
                self.mode = Mode::Json;
                Outcome::status(Status::ModeChanged, "switched to json mode")
            }
            (Some("timing"), Some("on"), None) => {
                self.timing = true;
                Outcome::status(Status::ModeChanged, "timing on")
            }
            (Some("timing"), Some("off"), None) => {
                self.timing = false;
                Outcome::status(Status::ModeChanged, "timing off")
            }
            _ => Outcome::status(Status::CommandMismatch, format!("unknown attribute @{attribute}")),
        }
    }

    /// Writes a response in the session's mode.
    fn respond(
        &self,
        stream: &mut TcpStream,
        action: &str,
        outcome: &Outcome,
        elapsed: Option<Duration>,
    ) -> Result<()> {
        match self.mode {
            Mode::Echo => {
                let mut text = match (&outcome.value, outcome.print_value) {
                    (Some(value), true) => value.to_string(),
                    _ => outcome.message.clone(),
                };
                if !outcome.status.success() {
                    text = format!("{RED}{text}{RESET}");
                }
                if self.timing {
                    if let Some(elapsed) = elapsed {
                        text = format!("{text}\nTook {}ms to execute.", elapsed.as_millis());
                    }
                }
                self.write(stream, &format!("{text}\n"))
            }
            Mode::Json => {
                let envelope = serde_json::json!({
                    "action": action,
                    "message_text": outcome.message,
                    "value": outcome.value.as_ref().map(Value::to_json),
                    "status_code": outcome.status.code(),
                    "status": outcome.status.symbol(),
                    "success": outcome.status.success(),
                });
                self.write(stream, &format!("{envelope}\n"))
            }
        }
    }

    /// Writes the echo-mode prompt: the token prompt while unauthorized,
    /// the alias prompt after. Json mode has no prompts.
    fn prompt(&self, stream: &mut TcpStream) -> Result<()> {
        if self.mode != Mode::Echo {
            return Ok(());
        }
        match &self.auth {
            Some(auth) => self.write(stream, &format!("{}> ", auth.alias)),
            None => self.write(stream, AUTH_PROMPT),
        }
    }

    fn write(&self, stream: &mut TcpStream, text: &str) -> Result<()> {
        stream.write_all(text.as_bytes())?;
        stream.flush()?;
        Ok(())
    }
}
