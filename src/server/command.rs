//! The shell command parser and registry. Input lines are tokenized into
//! a command name, positional arguments, and flags, then dispatched to a
//! built-in command with a shape validator and an executor.

use super::status::Status;
use super::Shared;
use crate::encoding::Value;
use crate::errinput;
use crate::error::Result;
use crate::storage::{sanitize_key, sanitize_value, SetOutcome};

use itertools::Itertools as _;
use std::collections::{BTreeMap, HashMap};

/// Clears the terminal and homes the cursor. Echo-mode clients are
/// terminals; JSON-mode clients can ignore the sequence.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// A tokenized command line. Quoted tokens are always positional, so a
/// literal `--x` or `-x` can be passed by quoting it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    /// Flag name → value for `--name=value`, or None for the boolean
    /// forms `--name` and `-x`.
    pub flags: HashMap<String, Option<String>>,
}

impl ParsedCommand {
    /// Returns true if a boolean or valued flag is present.
    pub fn flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }
}

/// Parses an input line into a command.
pub fn parse(input: &str) -> Result<ParsedCommand> {
    let mut tokens = tokenize(input)?.into_iter();
    let Some((name, _)) = tokens.next() else {
        return errinput!("empty command");
    };
    let mut parsed = ParsedCommand { name, ..ParsedCommand::default() };
    for (token, quoted) in tokens {
        if quoted {
            parsed.args.push(token);
        } else if let Some(flag) = token.strip_prefix("--") {
            match flag.split_once('=') {
                Some((name, value)) => parsed.flags.insert(name.to_string(), Some(value.to_string())),
                None => parsed.flags.insert(flag.to_string(), None),
            };
        } else if token.len() == 2
            && token.starts_with('-')
            && token.chars().nth(1).is_some_and(|c| c.is_ascii_alphabetic())
        {
            parsed.flags.insert(token[1..].to_string(), None);
        } else {
            parsed.args.push(token);
        }
    }
    Ok(parsed)
}

/// Splits an input line into raw tokens, honoring double and single
/// quotes (without escapes). The bool marks quoted tokens.
fn tokenize(input: &str) -> Result<Vec<(String, bool)>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' || c == '\'' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some(q) if q == c => break,
                    Some(ch) => token.push(ch),
                    None => return errinput!("unterminated {c} quote"),
                }
            }
            tokens.push((token, true));
        } else {
            let mut token = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
            tokens.push((token, false));
        }
    }
    Ok(tokens)
}

/// The result of a command, rendered by the session as either echo text
/// or a JSON envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub message: String,
    pub value: Option<Value>,
    pub status: Status,
    /// Echo mode prints the value instead of the message when set.
    pub print_value: bool,
}

impl Outcome {
    pub fn status(status: Status, message: impl Into<String>) -> Self {
        Self { message: message.into(), value: None, status, print_value: false }
    }

    fn response(message: impl Into<String>) -> Self {
        Self::status(Status::Response, message)
    }

    fn value(value: Value) -> Self {
        Self {
            message: value.to_string(),
            value: Some(value),
            status: Status::Response,
            print_value: true,
        }
    }
}

type Validator = fn(&ParsedCommand) -> bool;
type Executor = fn(&ParsedCommand, &Shared) -> Result<Outcome>;

/// A built-in shell command.
pub struct Command {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub summary: &'static str,
    pub usage: &'static str,
    validate: Validator,
    execute: Executor,
}

/// The command registry.
pub struct Registry {
    commands: Vec<Command>,
}

impl Registry {
    pub fn new() -> Self {
        let commands = vec![
            Command {
                name: "help",
                aliases: &[],
                summary: "lists commands or shows their usage",
                usage: "help [command...]",
                validate: |_| true,
                execute: help,
            },
            Command {
                name: "clear",
                aliases: &["cls"],
                summary: "clears the screen",
                usage: "clear",
                validate: |p| p.args.is_empty(),
                execute: clear,
            },
            Command {
                name: "exit",
                aliases: &[],
                summary: "closes the session",
                usage: "exit [status]",
                validate: |p| {
                    p.args.len() <= 1 && p.args.iter().all(|a| a.parse::<i64>().is_ok())
                },
                execute: exit,
            },
            Command {
                name: "info",
                aliases: &[],
                summary: "shows server and storage statistics",
                usage: "info [section...]",
                validate: |_| true,
                execute: info,
            },
            Command {
                name: "get",
                aliases: &[],
                summary: "returns the values of the given keys",
                usage: "get key...",
                validate: |p| !p.args.is_empty(),
                execute: get,
            },
            Command {
                name: "set",
                aliases: &[],
                summary: "stores key/value pairs",
                usage: "set (key value)... | set --json object...",
                validate: |p| {
                    if p.flag("json") || p.flag("j") {
                        !p.args.is_empty()
                    } else {
                        !p.args.is_empty() && p.args.len() % 2 == 0
                    }
                },
                execute: set,
            },
            Command {
                name: "delete",
                aliases: &["remove"],
                summary: "deletes the given keys",
                usage: "delete key...",
                validate: |p| !p.args.is_empty(),
                execute: delete,
            },
            Command {
                name: "sanitize",
                aliases: &[],
                summary: "runs the key or value sanitizer over the input",
                usage: "sanitize (key|value) input... [--trim]",
                validate: |p| {
                    p.args.len() >= 2 && matches!(p.args[0].as_str(), "key" | "value")
                },
                execute: sanitize,
            },
        ];
        Self { commands }
    }

    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name || c.aliases.contains(&name))
    }

    /// Dispatches a parsed command. Unknown names are status 3, validator
    /// failures status 4, and executor errors status 5.
    pub fn dispatch(&self, parsed: &ParsedCommand, shared: &Shared) -> Outcome {
        let Some(command) = self.lookup(&parsed.name) else {
            return Outcome::status(
                Status::CommandNotFound,
                format!("command '{}' not found, try help", parsed.name),
            );
        };
        if !(command.validate)(parsed) {
            return Outcome::status(Status::CommandMismatch, format!("usage: {}", command.usage));
        }
        match (command.execute)(parsed, shared) {
            Ok(outcome) => outcome,
            Err(err) => Outcome::status(Status::UnexpectedError, err.to_string()),
        }
    }
}

fn help(parsed: &ParsedCommand, shared: &Shared) -> Result<Outcome> {
    let registry = &shared.registry;
    if parsed.args.is_empty() {
        let lines: Vec<String> = registry
            .commands
            .iter()
            .map(|c| format!("{:<10} {}", c.name, c.summary))
            .collect();
        return Ok(Outcome::response(lines.join("\n")));
    }
    let lines: Vec<String> = parsed
        .args
        .iter()
        .map(|name| match registry.lookup(name) {
            Some(c) => format!("usage: {}", c.usage),
            None => format!("unknown command '{name}'"),
        })
        .collect();
    Ok(Outcome::response(lines.join("\n")))
}

fn clear(_: &ParsedCommand, _: &Shared) -> Result<Outcome> {
    Ok(Outcome::response(CLEAR_SCREEN))
}

fn exit(parsed: &ParsedCommand, _: &Shared) -> Result<Outcome> {
    let code = parsed.args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
    Ok(Outcome {
        message: "bye".to_string(),
        value: Some(Value::Int(code)),
        status: Status::Exit,
        print_value: false,
    })
}

fn info(parsed: &ParsedCommand, shared: &Shared) -> Result<Outcome> {
    let status = shared.store().status()?;
    let mut sections: Vec<(&str, Vec<(&str, Value)>)> = vec![
        (
            "server",
            vec![
                ("version", Value::Str(env!("CARGO_PKG_VERSION").to_string())),
                ("cli_port", Value::Int(shared.config.server.cli_port as i64)),
                ("sessions", Value::Int(shared.session_count() as i64)),
            ],
        ),
        (
            "memory",
            vec![
                ("used", Value::Int(status.memory_used as i64)),
                ("limit", Value::Int(status.memory_limit as i64)),
            ],
        ),
        (
            "storage",
            vec![
                ("keys", Value::Int(status.keys as i64)),
                ("shards", Value::Int(status.shards as i64)),
                ("active_shards", Value::Int(status.active_shards as i64)),
                ("disk_size", Value::Int(status.disk_size as i64)),
                ("free_slots", Value::Int(status.free_slots as i64)),
                ("entry_limit", Value::Int(status.entry_limit as i64)),
                ("persistent", Value::Bool(status.persistent)),
            ],
        ),
    ];
    if !parsed.args.is_empty() {
        sections.retain(|(name, _)| parsed.args.iter().any(|a| a == name));
        if sections.is_empty() {
            return errinput!("no such info section");
        }
    }

    let mut lines = Vec::new();
    let mut map = BTreeMap::new();
    for (section, fields) in sections {
        let mut section_map = BTreeMap::new();
        for (field, value) in fields {
            lines.push(format!("{section}.{field}: {value}"));
            section_map.insert(field.to_string(), value);
        }
        map.insert(section.to_string(), Value::Map(section_map));
    }
    Ok(Outcome {
        message: lines.join("\n"),
        value: Some(Value::Map(map)),
        status: Status::Response,
        print_value: false,
    })
}

fn get(parsed: &ParsedCommand, shared: &Shared) -> Result<Outcome> {
    let store = shared.store();
    if let [key] = parsed.args.as_slice() {
        return Ok(match store.get(key) {
            Some(value) => Outcome::value(value.clone()),
            None => Outcome::status(Status::KeyNotExist, "key doesn't exist"),
        });
    }
    let mut map = BTreeMap::new();
    for key in &parsed.args {
        if let Some(value) = store.get(key) {
            map.insert(sanitize_key(key, false), value.clone());
        }
    }
    if map.is_empty() {
        return Ok(Outcome::status(Status::KeyNotExist, "keys don't exist"));
    }
    Ok(Outcome::value(Value::Map(map)))
}

fn set(parsed: &ParsedCommand, shared: &Shared) -> Result<Outcome> {
    let mut store = shared.store();
    let (mut inserted, mut updated, mut failed) = (0, 0, 0);
    let mut tally = |outcome: SetOutcome| match outcome {
        SetOutcome::Inserted => inserted += 1,
        SetOutcome::Updated => updated += 1,
        SetOutcome::Failed => failed += 1,
    };

    if parsed.flag("json") || parsed.flag("j") {
        for arg in &parsed.args {
            let json: serde_json::Value = serde_json::from_str(arg)?;
            let serde_json::Value::Object(object) = json else {
                return errinput!("set --json expects JSON objects");
            };
            for (key, value) in object {
                tally(store.set(&key, Value::from_json(value)));
            }
        }
    } else {
        // Pairs apply in order, so a repeated key takes the last value.
        for (key, value) in parsed.args.iter().tuples() {
            tally(store.set(key, Value::Str(value.clone())));
        }
    }

    let mut parts = Vec::new();
    if inserted > 0 {
        parts.push(format!("{} inserted", entries(inserted)));
    }
    if updated > 0 {
        parts.push(format!("{} updated", entries(updated)));
    }
    if failed > 0 {
        parts.push(format!("{} failed", entries(failed)));
    }
    if parts.is_empty() {
        parts.push("nothing to set".to_string());
    }
    Ok(Outcome::response(parts.join(", ")))
}

fn delete(parsed: &ParsedCommand, shared: &Shared) -> Result<Outcome> {
    let mut store = shared.store();
    let deleted = parsed.args.iter().filter(|key| store.remove(key)).count();
    if deleted == 0 {
        return Ok(Outcome::status(Status::KeyNotExist, "key doesn't exist"));
    }
    let items = if deleted == 1 { "1 item".to_string() } else { format!("{deleted} items") };
    Ok(Outcome::response(format!("{items} deleted")))
}

fn sanitize(parsed: &ParsedCommand, _: &Shared) -> Result<Outcome> {
    let trim = parsed.flag("trim");
    let outputs: Vec<String> = match parsed.args[0].as_str() {
        "key" => parsed.args[1..].iter().map(|input| sanitize_key(input, trim)).collect(),
        _ => parsed.args[1..]
            .iter()
            .map(|input| sanitize_value(Value::Str(input.clone())).to_string())
            .collect(),
    };
    let value = match outputs.as_slice() {
        [single] => Value::Str(single.clone()),
        outputs => Value::Seq(outputs.iter().map(|s| Value::Str(s.clone())).collect()),
    };
    Ok(Outcome {
        message: outputs.join(" "),
        value: Some(value),
        status: Status::Response,
        print_value: false,
    })
}

fn entries(n: usize) -> String {
    if n == 1 {
        "1 entry".to_string()
    } else {
        format!("{n} entries")
    }
}
