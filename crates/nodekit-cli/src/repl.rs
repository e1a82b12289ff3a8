//! REPL – the `nodekit` interactive shell.
//!
//! Supported slash-commands:
//!   /help                                  – show this list
//!   /init                                  – bring the session up
//!   /shutdown                              – tear the session down
//!   /pub <topic> <type> [json]             – publish one message
//!   /sub <topic> <type>                    – print every message on a topic
//!   /unsub <topic> <n>                     – drop subscription #n
//!   /call <service> <type> [json]          – call a service
//!   /goal <action> <type> [json]           – send an action goal
//!   /param declare|get|set <name> [json]   – node parameters
//!   /status                                – session state and caches
//!   /quit | /exit                          – shut down and exit
//!
//! Line editing runs on a dedicated thread so the Tokio runtime never blocks
//! on the terminal.  The thread only shows the next prompt once the previous
//! command has finished.

use colored::Colorize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nodekit_session::{MessageHandler, NodeSession, SessionError, SubscriptionHandle};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often the shell checks the Ctrl-C flag while idle or busy.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Parameter sub-command of `/param`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamOp {
    Declare { name: String, default_value: Value },
    Get { name: String },
    Set { name: String, value: Value },
}

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Init,
    Shutdown,
    Publish { topic: String, type_name: String, message: Value },
    Subscribe { topic: String, type_name: String },
    Unsubscribe { topic: String, id: usize },
    Call { service: String, type_name: String, request: Value },
    Goal { action: String, type_name: String, goal: Value },
    Param(ParamOp),
    Status,
    Quit,
}

const USAGE_PUB: &str = "usage: /pub <topic> <type> [json]";
const USAGE_SUB: &str = "usage: /sub <topic> <type>";
const USAGE_UNSUB: &str = "usage: /unsub <topic> <n>";
const USAGE_CALL: &str = "usage: /call <service> <type> [json]";
const USAGE_GOAL: &str = "usage: /goal <action> <type> [json]";
const USAGE_PARAM: &str = "usage: /param declare|get|set <name> [json]";

/// Split off the first whitespace-delimited word.
fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(i) => (&input[..i], input[i..].trim_start()),
        None => (input, ""),
    }
}

fn required<'a>(input: &'a str, usage: &str) -> Result<(String, &'a str), String> {
    let (word, rest) = split_word(input);
    if word.is_empty() {
        return Err(usage.to_string());
    }
    Ok((word.to_string(), rest))
}

/// Parse the JSON tail of a command.  An empty tail means `{}`.
fn json_or_empty(input: &str) -> Result<Value, String> {
    if input.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    json_required(input)
}

fn json_required(input: &str) -> Result<Value, String> {
    serde_json::from_str(input.trim()).map_err(|e| format!("invalid JSON: {e}"))
}

fn no_trailing(rest: &str, usage: &str) -> Result<(), String> {
    if rest.trim().is_empty() { Ok(()) } else { Err(usage.to_string()) }
}

/// Parse one shell line into a [`Command`].
pub fn parse(line: &str) -> Result<Command, String> {
    let (head, rest) = split_word(line.trim());
    match head {
        "/help" => Ok(Command::Help),
        "/init" => Ok(Command::Init),
        "/shutdown" => Ok(Command::Shutdown),
        "/status" => Ok(Command::Status),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/pub" => {
            let (topic, rest) = required(rest, USAGE_PUB)?;
            let (type_name, rest) = required(rest, USAGE_PUB)?;
            Ok(Command::Publish { topic, type_name, message: json_or_empty(rest)? })
        }
        "/sub" => {
            let (topic, rest) = required(rest, USAGE_SUB)?;
            let (type_name, rest) = required(rest, USAGE_SUB)?;
            no_trailing(rest, USAGE_SUB)?;
            Ok(Command::Subscribe { topic, type_name })
        }
        "/unsub" => {
            let (topic, rest) = required(rest, USAGE_UNSUB)?;
            let (id, rest) = required(rest, USAGE_UNSUB)?;
            no_trailing(rest, USAGE_UNSUB)?;
            let id = id.trim_start_matches('#').parse::<usize>().map_err(|_| USAGE_UNSUB.to_string())?;
            Ok(Command::Unsubscribe { topic, id })
        }
        "/call" => {
            let (service, rest) = required(rest, USAGE_CALL)?;
            let (type_name, rest) = required(rest, USAGE_CALL)?;
            Ok(Command::Call { service, type_name, request: json_or_empty(rest)? })
        }
        "/goal" => {
            let (action, rest) = required(rest, USAGE_GOAL)?;
            let (type_name, rest) = required(rest, USAGE_GOAL)?;
            Ok(Command::Goal { action, type_name, goal: json_or_empty(rest)? })
        }
        "/param" => {
            let (op, rest) = required(rest, USAGE_PARAM)?;
            let (name, rest) = required(rest, USAGE_PARAM)?;
            let op = match op.as_str() {
                "declare" => ParamOp::Declare { name, default_value: json_required(rest)? },
                "set" => ParamOp::Set { name, value: json_required(rest)? },
                "get" => {
                    no_trailing(rest, USAGE_PARAM)?;
                    ParamOp::Get { name }
                }
                _ => return Err(USAGE_PARAM.to_string()),
            };
            Ok(Command::Param(op))
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell state
// ─────────────────────────────────────────────────────────────────────────────

/// The session plus the numbered subscriptions opened from the prompt.
pub struct Shell {
    session: NodeSession,
    backend: String,
    subscriptions: BTreeMap<usize, (String, SubscriptionHandle)>,
    next_subscription: usize,
}

impl Shell {
    pub fn new(session: NodeSession, backend: impl Into<String>) -> Self {
        Self {
            session,
            backend: backend.into(),
            subscriptions: BTreeMap::new(),
            next_subscription: 1,
        }
    }

    /// Run one command.  Returns `false` when the shell should exit.
    pub async fn execute(&mut self, command: Command) -> bool {
        let outcome = match command {
            Command::Help => {
                cmd_help();
                Ok(())
            }
            Command::Status => {
                self.cmd_status();
                Ok(())
            }
            Command::Quit => return false,
            Command::Init => self.cmd_init().await,
            Command::Shutdown => self.cmd_shutdown().await,
            Command::Publish { topic, type_name, message } => self
                .session
                .publish(&topic, &type_name, &message)
                .map(|()| println!("  {} published on {}", "✓".green(), topic.bold())),
            Command::Subscribe { topic, type_name } => self.cmd_subscribe(topic, &type_name),
            Command::Unsubscribe { topic, id } => self.cmd_unsubscribe(&topic, id),
            Command::Call { service, type_name, request } => self
                .session
                .call_service(&service, &type_name, request)
                .await
                .map(|response| println!("  {} {}", "response:".green(), response)),
            Command::Goal { action, type_name, goal } => {
                let feedback: Arc<dyn MessageHandler> = Arc::new(|fb: &Value| {
                    println!("  {} {}", "feedback:".dimmed(), fb);
                });
                self.session
                    .send_action_goal(&action, &type_name, goal, Some(feedback))
                    .await
                    .map(|result| println!("  {} {}", "result:".green(), result))
            }
            Command::Param(op) => self.cmd_param(op).await,
        };
        if let Err(e) = outcome {
            println!("  {} {}", "✗".red().bold(), e.to_string().red());
        }
        true
    }

    async fn cmd_init(&mut self) -> Result<(), SessionError> {
        if self.session.is_ready() {
            println!("  Session already ready as {}", self.session.fully_qualified_name().bold());
            return Ok(());
        }
        self.session.init().await?;
        println!(
            "  {} node {} is up ({})",
            "✓".green(),
            self.session.fully_qualified_name().bold(),
            self.backend
        );
        Ok(())
    }

    async fn cmd_shutdown(&mut self) -> Result<(), SessionError> {
        self.subscriptions.clear();
        self.session.shutdown().await?;
        println!("  {} session shut down", "✓".green());
        Ok(())
    }

    fn cmd_subscribe(&mut self, topic: String, type_name: &str) -> Result<(), SessionError> {
        let label = topic.clone();
        let handle = self.session.subscribe(&topic, type_name, move |msg: &Value| {
            println!("  {} {}", format!("[{label}]").cyan(), msg);
        })?;
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscriptions.insert(id, (topic.clone(), handle));
        println!("  {} subscription #{} on {}", "✓".green(), id, topic.bold());
        Ok(())
    }

    fn cmd_unsubscribe(&mut self, topic: &str, id: usize) -> Result<(), SessionError> {
        match self.subscriptions.get(&id) {
            Some((sub_topic, handle)) if sub_topic == topic => {
                self.session.unsubscribe(topic, *handle)?;
                self.subscriptions.remove(&id);
                println!("  {} subscription #{} removed", "✓".green(), id);
            }
            _ => println!("  No subscription #{} on {}", id, topic.yellow()),
        }
        Ok(())
    }

    async fn cmd_param(&mut self, op: ParamOp) -> Result<(), SessionError> {
        match op {
            ParamOp::Declare { name, default_value } => {
                self.session.declare_param(&name, default_value)?;
                println!("  {} {} declared", "✓".green(), name.bold());
            }
            ParamOp::Get { name } => match self.session.get_param(&name)? {
                Some(value) => println!("  {} = {}", name.bold(), value),
                None => println!("  {} is not set", name.bold()),
            },
            ParamOp::Set { name, value } => {
                self.session.set_param(&name, value).await?;
                println!("  {} {} updated", "✓".green(), name.bold());
            }
        }
        Ok(())
    }

    fn cmd_status(&self) {
        println!("{}", "Session Status".bold().underline());
        println!("  Backend      : {}", self.backend.yellow());
        println!("  Node         : {}", self.session.fully_qualified_name().bold());
        let state = if self.session.is_ready() { "ready".green() } else { "uninitialized".red() };
        println!("  State        : {}", state);
        println!("  Spin interval: {:?}", self.session.config().spin_interval());
        if self.subscriptions.is_empty() {
            println!("  Subscriptions: none");
        } else {
            println!("  Subscriptions:");
            for (id, (topic, _)) in &self.subscriptions {
                println!("    #{id} {topic}");
            }
        }
    }

    /// Shut the session down before exit.
    pub async fn close(mut self) {
        self.subscriptions.clear();
        if let Err(e) = self.session.shutdown().await {
            warn!(error = %e, "session shutdown on exit failed");
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "nodekit Commands".bold().underline());
    println!("  {}                              – bring the session up", "/init".bold().cyan());
    println!("  {}                          – tear the session down", "/shutdown".bold().cyan());
    println!("  {}       – publish one message", "/pub <topic> <type> [json]".bold().cyan());
    println!("  {}              – print messages on a topic", "/sub <topic> <type>".bold().cyan());
    println!("  {}                 – drop subscription #n", "/unsub <topic> <n>".bold().cyan());
    println!("  {}    – call a service", "/call <service> <type> [json]".bold().cyan());
    println!("  {}     – send an action goal", "/goal <action> <type> [json]".bold().cyan());
    println!("  {} – node parameters", "/param declare|get|set <name> [json]".bold().cyan());
    println!("  {}                            – session state", "/status".bold().cyan());
    println!("  {}                      – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Input thread
// ─────────────────────────────────────────────────────────────────────────────

enum Input {
    Line(String),
    Interrupted,
    Eof,
    Failed(String),
}

/// Start the line-editor thread.  It reads one line each time a unit is sent
/// on the returned ready channel.
fn spawn_input(history: Option<PathBuf>) -> (mpsc::Receiver<Input>, std::sync::mpsc::Sender<()>) {
    let (line_tx, line_rx) = mpsc::channel::<Input>(1);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

    std::thread::spawn(move || {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.blocking_send(Input::Failed(e.to_string()));
                return;
            }
        };
        if let Some(path) = &history
            && editor.load_history(path).is_err()
        {
            debug!(path = %path.display(), "no shell history yet");
        }
        let prompt = format!("{} ", "nodekit>".bold().cyan());

        while ready_rx.recv().is_ok() {
            let input = match editor.readline(&prompt) {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if let Some(path) = &history
                        && let Err(e) = editor.save_history(path)
                    {
                        debug!(error = %e, "failed to save shell history");
                    }
                    Input::Line(line)
                }
                Err(ReadlineError::Interrupted) => Input::Interrupted,
                Err(ReadlineError::Eof) => Input::Eof,
                Err(e) => Input::Failed(e.to_string()),
            };
            let last = !matches!(input, Input::Line(_));
            if line_tx.blocking_send(input).is_err() || last {
                break;
            }
        }
    });

    (line_rx, ready_tx)
}

async fn wait_for_flag(flag: &AtomicBool) {
    let mut poll = tokio::time::interval(SHUTDOWN_POLL);
    while !flag.load(Ordering::SeqCst) {
        poll.tick().await;
    }
}

/// Entry point for the interactive shell.
///
/// `shutdown` is the Ctrl-C flag; once set the current command is abandoned,
/// the session is shut down and the function returns.
pub async fn run(mut shell: Shell, shutdown: Arc<AtomicBool>, history: Option<PathBuf>) {
    let (mut lines, ready) = spawn_input(history);

    loop {
        if ready.send(()).is_err() {
            break;
        }
        let input = tokio::select! {
            input = lines.recv() => input,
            _ = wait_for_flag(&shutdown) => break,
        };

        let line = match input {
            Some(Input::Line(line)) => line,
            Some(Input::Interrupted) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Some(Input::Eof) | None => break,
            Some(Input::Failed(e)) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("  {} Type {} for available commands.", e.red(), "/help".bold());
                continue;
            }
        };
        let keep_going = tokio::select! {
            keep_going = shell.execute(command) => keep_going,
            _ = wait_for_flag(&shutdown) => {
                println!("  {}", "interrupted".yellow());
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    info!("shell exiting");
    shell.close().await;
    println!("{}", "Goodbye.".green());
}
