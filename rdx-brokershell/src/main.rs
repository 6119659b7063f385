use anyhow::Result;
use colored::Colorize;
use hyperbroker::prelude::*;
use hyperbroker::{ENGINE_NAME, VERSION as LIB_VERSION};
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

const LOGO_TEXT: &str = r"
    __                          __               __
   / /_  __  ______  ___  _____/ /_  _________  / /_____  _____
  / __ \/ / / / __ \/ _ \/ ___/ __ \/ ___/ __ \/ //_/ _ \/ ___/
 / / / / /_/ / /_/ /  __/ /  / /_/ / /  / /_/ / ,< /  __/ /
/_/ /_/\__, / .___/\___/_/  /_.___/_/   \____/_/|_|\___/_/
      /____/_/
";

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            let colored_command = command.yellow().bold();
            let colored_rest = rest.yellow();
            Cow::Owned(format!("{} {}", colored_command, colored_rest))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", LOGO_TEXT.cyan());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";

    println!("{}", "-".repeat(72).dimmed());
    println!("{}", version_string);
    println!("{}", license_blurb.dimmed());
    println!("{}", "-".repeat(72).dimmed());
}

/// Spawns tasks that print the system and tick streams.
fn spawn_event_listeners(engine: &BrokerEngine, is_listening_to_ticks: Arc<AtomicBool>) {
    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            if let SystemEvent::TickDrained { .. } = event {
                continue;
            }
            println!("\n<-- [SYSTEM EVENT] {:?}\n>> ", event);
        }
    });

    let mut tick_rx = engine.subscribe_tick_events();
    tokio::spawn(async move {
        while let Ok(event) = tick_rx.recv().await {
            if is_listening_to_ticks.load(Ordering::Relaxed) && event.tick_count % 30 == 0 {
                println!("<-- [RAW TICK] Tick #{}", event.tick_count);
            }
        }
    });
}

/// The shell's own bookkeeping: small numeric handles for subscriptions.
struct Shell {
    engine: BrokerEngine,
    subscriptions: BTreeMap<usize, (String, SubscriberId)>,
    next_handle: usize,
    is_listening_to_ticks: Arc<AtomicBool>,
}

impl Shell {
    fn broker(&self) -> &Broker {
        self.engine.broker()
    }

    /// Executes one command line. Returns `false` when the shell should exit.
    fn execute(&mut self, args: &[&str]) -> bool {
        let Some(command) = args.first() else {
            return true;
        };
        match *command {
            "add" => self.add(args.get(1), args.get(2)),
            "sub" => self.subscribe(args.get(1)),
            "unsub" => self.unsubscribe(args.get(1)),
            "raise" => match args.get(1) {
                Some(name) => match self.broker().raise(name) {
                    Ok(Some(batch)) => println!("--> Raised '{}', queued as {:?}.", name, batch),
                    Ok(None) => println!("--> Raised '{}'.", name),
                    Err(e) => println!("Error: {}", e),
                },
                None => println!("Usage: raise <CHANNEL>"),
            },
            "set" => self.set(args.get(1), args.get(2)),
            "list" => self.list(),
            "pending" => {
                let dispatcher = self.engine.dispatcher();
                println!(
                    "--> {} callbacks pending in {} batches ({:?}).",
                    dispatcher.pending_callbacks(),
                    dispatcher.pending_batches(),
                    dispatcher.policy()
                );
            }
            "drain" => {
                let report = self.engine.drain();
                println!(
                    "--> Drained {} callbacks ({} panicked).",
                    report.invoked, report.panicked
                );
            }
            "reset" => {
                self.broker().reset();
                self.subscriptions.clear();
                println!("--> Registry cleared. All handles are now invalid.");
            }
            "start" | "stop" => {
                if let Some(&"ticks") = args.get(1) {
                    let listening = *command == "start";
                    self.is_listening_to_ticks.store(listening, Ordering::Relaxed);
                    println!("--> Tick stream printing {}.", if listening { "on" } else { "off" });
                } else {
                    println!("Unknown '{}' command. Try '{} ticks'.", command, command);
                }
            }
            "help" => print_help(),
            "exit" => return false,
            other => println!("Unknown command: '{}'. Type 'help'.", other),
        }
        true
    }

    fn add(&self, name: Option<&&str>, payload: Option<&&str>) {
        let Some(name) = name else {
            println!("Usage: add <CHANNEL> [unit|bool]");
            return;
        };
        let result = match payload.copied().unwrap_or("unit") {
            "unit" => self.broker().add(*name, BasicChannel::default()),
            "bool" => self.broker().add(*name, BoolChannel::default()),
            other => {
                println!("Error: unknown payload '{}'. Use 'unit' or 'bool'.", other);
                return;
            }
        };
        match result {
            Ok(()) => println!("--> Added channel '{}'.", name),
            Err(e) => println!("Error: {}", e),
        }
    }

    fn subscribe(&mut self, name: Option<&&str>) {
        let Some(name) = name else {
            println!("Usage: sub <CHANNEL>");
            return;
        };
        let handle = self.next_handle;
        let result = match self.broker().subscribe_value(name, move |value: bool| {
            println!("<-- [CALLBACK #{}] value is {}", handle, value);
        }) {
            Err(BrokerError::PayloadMismatch { .. }) => self.broker().subscribe(name, move || {
                println!("<-- [CALLBACK #{}] fired", handle);
            }),
            other => other,
        };
        match result {
            Ok(id) => {
                self.subscriptions.insert(handle, (name.to_string(), id));
                self.next_handle += 1;
                println!("--> Subscribed to '{}' with handle: #{}", name, handle);
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    fn unsubscribe(&mut self, handle: Option<&&str>) {
        let Some(handle) = handle.and_then(|h| h.parse::<usize>().ok()) else {
            println!("Usage: unsub <HANDLE>  (handles are numbers, see 'list')");
            return;
        };
        let Some((name, id)) = self.subscriptions.remove(&handle) else {
            println!("Error: Invalid handle #{}. Use 'list' to see active handles.", handle);
            return;
        };
        match self.broker().unsubscribe(&name, id) {
            Ok(true) => println!("--> Handle #{} unsubscribed from '{}'.", handle, name),
            Ok(false) => println!("--> Handle #{} was no longer subscribed.", handle),
            Err(e) => println!("Error: {}", e),
        }
    }

    fn set(&self, name: Option<&&str>, value: Option<&&str>) {
        let (Some(name), Some(value)) = (name, value.and_then(|v| v.parse::<bool>().ok())) else {
            println!("Usage: set <CHANNEL> <true|false>");
            return;
        };
        match self.broker().get::<bool>(name) {
            Ok(channel) => {
                channel.update_value(value);
                println!("--> '{}' is now {}.", name, value);
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    fn list(&self) {
        println!("Channels:");
        for name in self.broker().names() {
            let payload = self.broker().payload_type(&name).unwrap_or("?");
            let subscribers = self.broker().subscriber_count(&name).unwrap_or(0);
            println!("  {:<20} {:<6} {} subscribers", name, payload, subscribers);
        }
        println!("Handles:");
        for (handle, (name, id)) in &self.subscriptions {
            println!("  Handle #{}: {} {:?}", handle, name, id);
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  add <C> [unit|bool]   - Registers a channel.");
    println!("  sub <C>               - Subscribes a printing callback; returns a handle.");
    println!("  unsub <H>             - Removes a subscription by its handle.");
    println!("  raise <C>             - Raises a channel.");
    println!("  set <C> <true|false>  - Updates a bool channel's value (raises it).");
    println!("  list                  - Shows channels and active handles.");
    println!("  pending               - Shows callbacks waiting for ticks.");
    println!("  drain                 - Runs every pending callback now.");
    println!("  reset                 - Clears the registry.");
    println!("  start ticks           - Begins printing the raw tick stream.");
    println!("  stop ticks            - Stops printing the raw tick stream.");
    println!("  exit                  - Quits the shell.");
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = BrokerConfig::load(config_path.as_deref())?;
    let engine = BrokerEngine::new(config)?;
    let engine_handle = engine.clone();

    let is_listening_to_ticks = Arc::new(AtomicBool::new(false));
    spawn_event_listeners(&engine_handle, is_listening_to_ticks.clone());

    info!("Spawning {} in the background...", ENGINE_NAME.cyan());
    tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            eprintln!("\nEngine stopped with an error: {}", e);
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut shell = Shell {
        engine: engine_handle,
        subscriptions: BTreeMap::new(),
        next_handle: 0,
        is_listening_to_ticks,
    };

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                if !shell.execute(&args) {
                    break;
                }
            }
            Err(_) => {
                println!("Exiting brokershell...");
                break;
            }
        }
    }

    Ok(())
}
