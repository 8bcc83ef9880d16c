//! Line-oriented operator console.
//!
//! Commands are registered as `name` plus an ordered list of [`ArgSpec`]s.
//! The same name may be registered several times with different specs. A
//! line is split on whitespace; registrations whose arity matches are tried
//! in registration order and the first one whose specs all accept their
//! tokens runs. Actions receive typed [`Args`].
//!
//! Only one action runs at a time. A line that arrives while an action is
//! still running is rejected as busy, never queued.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use colored::Colorize;
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("invalid argument pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    OneOf(Vec<String>),
    Word,
    Integer,
    Boolean,
    Pattern(Regex),
}

/// How one argument position is matched and parsed.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    matcher: Matcher,
}

impl ArgSpec {
    /// Exactly `text`.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            matcher: Matcher::Literal(text.into()),
        }
    }

    /// Any one of `options`.
    pub fn one_of<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matcher: Matcher::OneOf(options.into_iter().map(Into::into).collect()),
        }
    }

    /// ASCII letters only.
    pub fn word() -> Self {
        Self {
            matcher: Matcher::Word,
        }
    }

    /// Decimal digits, parsed as `i64`.
    pub fn integer() -> Self {
        Self {
            matcher: Matcher::Integer,
        }
    }

    /// `true` or `false`.
    pub fn boolean() -> Self {
        Self {
            matcher: Matcher::Boolean,
        }
    }

    /// A regular expression that must match the whole token.
    pub fn pattern(pattern: &str) -> Result<Self, ConsoleError> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            ConsoleError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            matcher: Matcher::Pattern(regex),
        })
    }

    fn parse(&self, token: &str) -> Option<Arg> {
        match &self.matcher {
            Matcher::Literal(text) => (token == text).then(|| Arg::Word(token.to_string())),
            Matcher::OneOf(options) => options
                .iter()
                .any(|option| option == token)
                .then(|| Arg::Word(token.to_string())),
            Matcher::Word => (!token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic()))
                .then(|| Arg::Word(token.to_string())),
            Matcher::Integer => {
                if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                token.parse().ok().map(Arg::Integer)
            }
            Matcher::Boolean => match token {
                "true" => Some(Arg::Boolean(true)),
                "false" => Some(Arg::Boolean(false)),
                _ => None,
            },
            Matcher::Pattern(regex) => regex.is_match(token).then(|| Arg::Word(token.to_string())),
        }
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::Literal(text) => f.write_str(text),
            Matcher::OneOf(options) => write!(f, "<{}>", options.join("|")),
            Matcher::Word => f.write_str("<word>"),
            Matcher::Integer => f.write_str("<integer>"),
            Matcher::Boolean => f.write_str("<true|false>"),
            Matcher::Pattern(regex) => {
                let source = regex.as_str();
                let inner = source
                    .strip_prefix("^(?:")
                    .and_then(|s| s.strip_suffix(")$"))
                    .unwrap_or(source);
                write!(f, "/{inner}/")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Word(String),
    Integer(i64),
    Boolean(bool),
}

/// Parsed arguments, one per registered spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        match self.0.get(index) {
            Some(Arg::Word(word)) => Some(word),
            _ => None,
        }
    }

    pub fn integer(&self, index: usize) -> Option<i64> {
        match self.0.get(index) {
            Some(Arg::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, index: usize) -> Option<bool> {
        match self.0.get(index) {
            Some(Arg::Boolean(b)) => Some(*b),
            _ => None,
        }
    }
}

pub type Action = Arc<dyn Fn(Args) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Registration {
    specs: Vec<ArgSpec>,
    action: Action,
}

impl Registration {
    fn accept(&self, tokens: &[&str]) -> Option<Args> {
        if tokens.len() != self.specs.len() {
            return None;
        }
        self.specs
            .iter()
            .zip(tokens)
            .map(|(spec, token)| spec.parse(token))
            .collect::<Option<Vec<_>>>()
            .map(Args)
    }

    fn usage(&self, command: &str) -> String {
        std::iter::once(command.to_string())
            .chain(self.specs.iter().map(ToString::to_string))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Ran { command: String },
    Busy,
    Empty,
    UnknownCommand { command: String, valid: Vec<String> },
    NoPatternMatch { command: String, patterns: Vec<String> },
    ActionFailed { command: String, error: String },
}

impl Dispatch {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ran { .. })
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ran { command } => write!(f, "{command} completed"),
            Self::Busy => f.write_str("busy"),
            Self::Empty => f.write_str("no command given"),
            Self::UnknownCommand { command, valid } => write!(
                f,
                "unknown command '{command}'; commands: {{ {} }}",
                valid.join(", ")
            ),
            Self::NoPatternMatch { command, patterns } => write!(
                f,
                "arguments don't match any registered pattern for '{command}'; expected one of: {}",
                patterns.join(" | ")
            ),
            Self::ActionFailed { command, error } => write!(f, "{command} failed: {error}"),
        }
    }
}

/// Where dispatch outcomes are reported.
pub trait ConsoleOutput: Send + Sync {
    fn success(&self, identifier: &str, outcome: &Dispatch) {
        tracing::debug!(identifier, %outcome, "Console command finished");
    }

    fn failure(&self, identifier: &str, outcome: &Dispatch) {
        println!("{identifier} {}", outcome.to_string().red());
    }
}

/// Colored stdout output.
pub struct StdoutOutput;

impl ConsoleOutput for StdoutOutput {}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Prefix printed before failure messages.
    pub identifier: String,
    /// When false, lines are lowercased before matching.
    pub case_sensitive: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            identifier: "console:".to_string(),
            case_sensitive: false,
        }
    }
}

pub struct Console {
    config: ConsoleConfig,
    commands: RwLock<BTreeMap<String, Vec<Registration>>>,
    busy: AtomicBool,
    output: Arc<dyn ConsoleOutput>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Console {
    pub fn new(config: ConsoleConfig) -> Self {
        Self::with_output(config, Arc::new(StdoutOutput))
    }

    pub fn with_output(config: ConsoleConfig, output: Arc<dyn ConsoleOutput>) -> Self {
        Self {
            config,
            commands: RwLock::new(BTreeMap::new()),
            busy: AtomicBool::new(false),
            output,
        }
    }

    pub fn register_command<F, Fut>(&self, name: impl Into<String>, specs: Vec<ArgSpec>, action: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: Action = Arc::new(move |args| action(args).boxed());
        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        commands
            .entry(name.into())
            .or_default()
            .push(Registration { specs, action });
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .read()
            .map(|commands| commands.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Match `line` against the registered commands and run the winner.
    pub async fn dispatch(&self, line: &str) -> Dispatch {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Dispatch::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        let line = if self.config.case_sensitive {
            line.trim().to_string()
        } else {
            line.trim().to_lowercase()
        };
        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else {
            return Dispatch::Empty;
        };
        let tokens: Vec<&str> = tokens.collect();

        let selected = {
            let commands = self
                .commands
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(registrations) = commands.get(command) else {
                return Dispatch::UnknownCommand {
                    command: command.to_string(),
                    valid: commands.keys().cloned().collect(),
                };
            };
            let winner = registrations.iter().find_map(|registration| {
                registration
                    .accept(&tokens)
                    .map(|args| (Arc::clone(&registration.action), args))
            });
            match winner {
                Some(winner) => winner,
                None => {
                    return Dispatch::NoPatternMatch {
                        command: command.to_string(),
                        patterns: registrations.iter().map(|r| r.usage(command)).collect(),
                    };
                }
            }
        };

        let (action, args) = selected;
        tracing::debug!(command, args = args.len(), "Running console command");
        match action(args).await {
            Ok(()) => Dispatch::Ran {
                command: command.to_string(),
            },
            Err(e) => Dispatch::ActionFailed {
                command: command.to_string(),
                error: format!("{e:#}"),
            },
        }
    }

    /// Dispatch `line` and report the outcome through the output hooks.
    pub async fn handle_line(&self, line: &str) -> Dispatch {
        let outcome = self.dispatch(line).await;
        if outcome.is_success() {
            self.output.success(&self.config.identifier, &outcome);
        } else {
            self.output.failure(&self.config.identifier, &outcome);
        }
        outcome
    }

    /// Read lines until EOF. Each line is handled in its own task so a line
    /// typed during a running action sees the console as busy.
    pub async fn run<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let console = Arc::clone(&self);
                    tokio::spawn(async move {
                        console.handle_line(&line).await;
                    });
                }
                Ok(None) => {
                    tracing::debug!("Console input closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Console input error");
                    break;
                }
            }
        }
    }
}
