// parley: desktop driver for the call and chat core
//
// Runs two simulated clients against the in-process relay so call flows can be
// exercised without a browser or a chat server.

mod config;
mod sim;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use parley_core::{CallEvent, CallStatus, ChatMessage, MessageContent};
use sim::{CallOptions, CallReport, ChatView, TranscriptEntry};
use std::time::Duration;
use tokio::task::LocalSet;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley call and chat simulator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a call between two users
    Call {
        #[arg(long, default_value = "alice")]
        caller: String,
        #[arg(long, default_value = "bob")]
        callee: String,
        /// How long the callee lets it ring before answering
        #[arg(long, default_value = "300")]
        accept_delay_ms: u64,
        /// Local candidates each side gathers
        #[arg(long, default_value = "3")]
        candidates: usize,
        /// The callee blocks the microphone prompt
        #[arg(long)]
        deny_permission: bool,
        /// The callee is already in another call
        #[arg(long)]
        callee_busy: bool,
        /// How long the connected call lasts before the caller hangs up
        #[arg(long, default_value = "500")]
        hold_ms: u64,
    },
    /// Simulate a direct and a group conversation with a voice note
    Chat {
        #[arg(long, default_value = "alice")]
        first: String,
        #[arg(long, default_value = "bob")]
        second: String,
        #[arg(long, default_value = "team")]
        group: String,
        /// Size of the recorded voice note
        #[arg(long, default_value = "2048")]
        voice_bytes: usize,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Path,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Call {
            caller,
            callee,
            accept_delay_ms,
            candidates,
            deny_permission,
            callee_busy,
            hold_ms,
        } => {
            let options = CallOptions {
                caller,
                callee,
                accept_delay: Duration::from_millis(accept_delay_ms),
                candidates,
                deny_permission,
                callee_busy,
                hold: Duration::from_millis(hold_ms),
                ..CallOptions::default()
            };
            cmd_call(options).await
        }
        Commands::Chat {
            first,
            second,
            group,
            voice_bytes,
        } => cmd_chat(&first, &second, &group, voice_bytes).await,
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_call(mut options: CallOptions) -> Result<()> {
    let config = config::Config::load()?;
    options.watchdog_tick = Duration::from_millis(config.watchdog_tick_ms);

    println!(
        "{} {} → {}",
        "Simulating call".bold(),
        options.caller.bright_cyan(),
        options.callee.bright_cyan()
    );
    println!();

    let report = LocalSet::new()
        .run_until(sim::simulate_call(&config.client, &options))
        .await?;

    print_call_report(&report);
    Ok(())
}

fn print_call_report(report: &CallReport) {
    for entry in &report.transcript {
        print_transcript_entry(entry);
    }

    println!();
    println!("{}", "Outcome".bold());
    for outcome in &report.outcomes {
        let released = if outcome.captured == outcome.released {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {:<12} {:<22} capture {} acquired / {} released {}",
            outcome.name.bright_cyan(),
            status_label(outcome.status),
            outcome.captured,
            outcome.released,
            released
        );
    }
}

fn print_transcript_entry(entry: &TranscriptEntry) {
    let at = format!("{:>6}ms", entry.at.as_millis()).dimmed();
    let who = format!("{:<12}", entry.who).bright_cyan();
    let what = match &entry.event {
        CallEvent::IncomingCall { from } => format!("🔔 incoming call from {}", from).yellow(),
        CallEvent::StateChanged { status, remote } => {
            format!("{} with {}", status_label(*status), remote).normal()
        }
        CallEvent::LocalMediaReady(handle) => {
            format!("🎙️ local media ready ({:?})", handle.kind()).normal()
        }
        CallEvent::RemoteMediaReady(_) => "🔊 remote media ready".green(),
        CallEvent::Error { kind, message } => format!("❌ {}: {}", kind, message).red(),
    };
    println!("{} {} {}", at, who, what);
}

fn status_label(status: CallStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        CallStatus::Active => label.green().bold(),
        CallStatus::Ended => label.dimmed(),
        CallStatus::Idle | CallStatus::AwaitingLocalMedia | CallStatus::Negotiating => {
            label.yellow()
        }
    }
}

async fn cmd_chat(first: &str, second: &str, group: &str, voice_bytes: usize) -> Result<()> {
    let config = config::Config::load()?;
    let views = sim::simulate_chat(&config.client, first, second, group, voice_bytes).await?;

    for view in &views {
        print_chat_view(view);
    }
    Ok(())
}

fn print_chat_view(view: &ChatView) {
    println!("{} {}", "Chat view of".bold(), view.name.bright_cyan().bold());
    println!("  Online: {}", view.online.join(", "));
    println!("  Groups: {}", view.groups.join(", "));

    for (conversation, messages) in &view.conversations {
        println!();
        println!("  {}", conversation.to_string().bright_yellow());
        if messages.is_empty() {
            println!("    {}", "(no messages)".dimmed());
        }
        for message in messages {
            print_message(message);
        }
    }
    println!();
}

fn print_message(message: &ChatMessage) {
    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Voice(note) => {
            format!("🎤 voice note ({} bytes, {})", note.data.len(), note.mime_type)
        }
    };
    println!("    {}: {}", message.from.bright_cyan(), body);
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
