//! `nodekit-cli` – interactive shell over a node session.
//!
//! This binary:
//!
//! 1. Initialises tracing (optionally exporting spans over OTLP).
//! 2. Checks for `~/.nodekit/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 3. Builds the configured middleware (in-process loopback or rosbridge)
//!    and a `NodeSession` on top of it.
//! 4. Drops the user into an **interactive shell** with slash-commands
//!    (`/init`, `/pub`, `/sub`, `/call`, `/goal`, `/param`, `/help`, …).
//! 5. Intercepts **Ctrl-C** to leave the shell and shut the session down.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use config::{Backend, Config};
use nodekit_middleware::{GoalOutcome, Loopback, Middleware, Rosbridge};
use nodekit_session::NodeSession;

fn main() {
    let _telemetry = telemetry::init_tracing("nodekit");

    print_banner();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the session down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    info!(backend = %cfg.backend, node = %cfg.session.fully_qualified_name(), "configuration resolved");

    let middleware = build_middleware(&cfg);
    let session = NodeSession::new(middleware, cfg.session.clone());
    let backend_label = match cfg.backend {
        Backend::Loopback => "loopback".to_string(),
        Backend::Rosbridge => format!("rosbridge @ {}", cfg.rosbridge_url),
    };

    println!("  Backend: {}", backend_label.yellow());
    println!();
    println!(
        "  Type {} to start the node, {} for a list of commands.\n",
        "/init".bold().cyan(),
        "/help".bold().cyan()
    );

    // ── Interactive shell ─────────────────────────────────────────────────
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the Tokio runtime");
            eprintln!("{}: {}", "Fatal".red().bold(), e);
            std::process::exit(1);
        }
    };
    let shell = repl::Shell::new(session, backend_label);
    runtime.block_on(repl::run(shell, shutdown, Some(config::history_path())));
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware
// ─────────────────────────────────────────────────────────────────────────────

fn build_middleware(cfg: &Config) -> Arc<dyn Middleware> {
    match cfg.backend {
        Backend::Rosbridge => Arc::new(Rosbridge::new(cfg.rosbridge_url.clone())),
        Backend::Loopback => Arc::new(loopback_with_demo_servers()),
    }
}

/// A loopback graph with an echo service and a countdown action, so every
/// shell command has something to talk to offline.
fn loopback_with_demo_servers() -> Loopback {
    let loopback = Loopback::new();
    loopback.serve("/echo", "nodekit/srv/Echo", |request| Ok(request.clone()));
    loopback.serve_action("/countdown", "nodekit/action/Countdown", |goal| {
        match goal["from"].as_u64() {
            Some(from) if from <= 100 => GoalOutcome::Succeeded {
                feedback: (0..from).rev().map(|left| json!({ "remaining": left })).collect(),
                result: json!({ "done": true }),
            },
            _ => GoalOutcome::Rejected,
        }
    });
    loopback
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      nodekit First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up nodekit.\n");

    let mut cfg = Config::default();

    println!("  Which middleware should the shell use?");
    println!("    1) Loopback   (default, in-process, no robot needed)");
    println!("    2) rosbridge  (WebSocket connection to a ROS 2 graph)");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.backend = Backend::Rosbridge;
        cfg.rosbridge_url = prompt_line(
            &format!("  rosbridge URL [{}]: ", cfg.rosbridge_url),
            &cfg.rosbridge_url,
        );
    }

    cfg.session.node_name = prompt_line(
        &format!("  Node name [{}]: ", cfg.session.node_name),
        &cfg.session.node_name,
    );
    cfg.session.namespace = prompt_line(
        &format!("  Namespace [{}]: ", cfg.session.namespace),
        &cfg.session.namespace,
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                 __     __   _ __ "#.bold().cyan());
    println!("{}", r#"   ____  ____  / /__  / /__(_) /_"#.bold().cyan());
    println!("{}", r#"  / __ \/ __ \/ / _ \/ //_/ / __/"#.bold().cyan());
    println!("{}", r#" / / / / /_/ / /  __/ ,< / / /_  "#.bold().cyan());
    println!("{}", r#"/_/ /_/\____/_/\___/_/|_/_/\__/  "#.bold().cyan());
    println!();
    println!("  {} {}", "nodekit".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Node session shell for ROS 2 graphs");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
