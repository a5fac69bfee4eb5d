//! # devbridge
//!
//! `devbridge serve` runs the bridge. Every other subcommand is a one-shot
//! agent: connect, send one envelope, print the reply as JSON on stdout.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devbridge_client::{AgentClient, ClientError, REPLY_GRACE};
use devbridge_core::logging::{LogFormat, init_subscriber, with_startup_subscriber};
use devbridge_core::{Envelope, LogFilter, LogLevel};
use devbridge_server::{BridgeServer, ServerConfig};
use devbridge_settings::{BridgeSettings, load_settings, load_settings_from_path};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Bridge between a page's development toolbar and external tooling.
#[derive(Parser, Debug)]
#[command(name = "devbridge", version, about)]
struct Cli {
    /// Settings file (default `~/.devbridge/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Bridge URL for client subcommands (default from settings).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Request timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until Ctrl-C.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind.
        #[arg(long)]
        port: Option<u16>,
        /// Dev server port; the bridge listens on `app_port + 6223`.
        #[arg(long)]
        app_port: Option<u16>,
        /// Where `save-*` artifacts are written.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Log level filter (`RUST_LOG` wins).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Capture the page or one element.
    Screenshot {
        /// CSS selector of the element to capture.
        selector: Option<String>,
        /// `png`, `jpeg` or `webp`.
        #[arg(long)]
        format: Option<String>,
        /// Device pixel scale.
        #[arg(long)]
        scale: Option<f64>,
        /// Lossy quality in `0..=1`.
        #[arg(long)]
        quality: Option<f64>,
    },
    /// Query elements matching a selector.
    Query {
        /// CSS selector.
        selector: String,
        /// Return every match instead of the first.
        #[arg(long)]
        all: bool,
    },
    /// Print buffered console logs, or stream them with `--follow`.
    Logs {
        /// Keep the connection open and print new entries as they arrive.
        #[arg(long)]
        follow: bool,
        /// Only these levels (repeatable).
        #[arg(long = "level")]
        levels: Vec<String>,
        /// Substring the message must contain.
        #[arg(long)]
        pattern: Option<String>,
        /// Exact source the entry must carry.
        #[arg(long)]
        source: Option<String>,
        /// Most recent entries to return.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Evaluate a script in the page (requires `DEVBRIDGE_ALLOW_EXEC=1` there).
    Exec {
        /// Script source.
        code: String,
    },
    /// Click the first element matching a selector.
    Click {
        /// CSS selector.
        selector: String,
    },
    /// Reload the page.
    Refresh {
        /// Bypass the cache.
        #[arg(long)]
        hard: bool,
    },
    /// Recent network activity.
    Network {
        /// Most recent entries to return.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = with_startup_subscriber(|| match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    })
    .context("failed to load settings")?;
    if let Some(ms) = cli.timeout_ms {
        settings.requests.timeout_ms = ms.max(1);
    }

    if let Command::Serve {
        host,
        port,
        app_port,
        output_dir,
        log_level,
    } = cli.command
    {
        if let Some(host) = host {
            settings.server.host = host;
        }
        if let Some(port) = port {
            settings.server.port = port;
        }
        if app_port.is_some() {
            settings.server.app_port = app_port;
        }
        if let Some(dir) = output_dir {
            settings.persistence.output_dir = dir.display().to_string();
        }
        if let Some(level) = log_level {
            settings.logging.level = level;
        }
        serve(&settings).await?;
        return Ok(ExitCode::SUCCESS);
    }

    // Clients keep stderr quiet unless asked.
    init_subscriber("warn", log_format(&settings));
    let url = cli.url.unwrap_or_else(|| settings.bridge_url());
    let timeout = Duration::from_millis(settings.requests.timeout_ms);
    let wait = timeout + REPLY_GRACE;

    let mut client = AgentClient::connect(&url).await?;
    debug!(url = %url, "connected");

    let envelope = match cli.command {
        Command::Logs {
            follow: true,
            levels,
            pattern,
            source,
            ..
        } => {
            let filters = log_filter(&levels, pattern, source)?;
            let code = follow_logs(&mut client, filters, wait).await;
            client.close().await;
            return code;
        }
        command => command_envelope(command)?,
    };

    let outcome = client.call(envelope, wait).await;
    client.close().await;
    match outcome {
        Ok(reply) => {
            println!("{}", render(reply.data().unwrap_or(&Value::Null)));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{}", describe(&err, timeout));
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn serve(settings: &BridgeSettings) -> Result<()> {
    init_subscriber(&settings.logging.level, log_format(settings));

    let config = ServerConfig::from_settings(settings);
    let handle = BridgeServer::new(config)
        .listen()
        .await
        .context("failed to bind bridge")?;
    info!(url = %handle.ws_url(), "bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn follow_logs(
    client: &mut AgentClient,
    filters: LogFilter,
    wait: Duration,
) -> Result<ExitCode> {
    let mut follow = match client.follow_logs(filters, wait).await {
        Ok(follow) => follow,
        Err(err) => {
            eprintln!("{err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    loop {
        tokio::select! {
            entry = follow.next() => {
                let Some(entry) = entry else {
                    eprintln!("connection to bridge closed");
                    return Ok(ExitCode::FAILURE);
                };
                println!("{}", serde_json::to_string(&entry)?);
            }
            _ = tokio::signal::ctrl_c() => return Ok(ExitCode::SUCCESS),
        }
    }
}

/// Build the one envelope a non-streaming subcommand sends.
fn command_envelope(command: Command) -> Result<Envelope> {
    let envelope = match command {
        Command::Serve { .. } => anyhow::bail!("serve does not send a command"),
        Command::Screenshot {
            selector,
            format,
            scale,
            quality,
        } => {
            let mut envelope = Envelope::new("screenshot");
            for (key, value) in [
                ("selector", selector.map(Value::from)),
                ("format", format.map(Value::from)),
                ("scale", scale.map(Value::from)),
                ("quality", quality.map(Value::from)),
            ] {
                if let Some(value) = value {
                    envelope = envelope.with(key, value);
                }
            }
            envelope
        }
        Command::Query { selector, all } => Envelope::new("query-dom")
            .with("selector", json!(selector))
            .with("all", json!(all)),
        Command::Logs {
            levels,
            pattern,
            source,
            limit,
            ..
        } => {
            let filters = log_filter(&levels, pattern, source)?;
            let envelope =
                Envelope::new("get-logs").with("filters", serde_json::to_value(filters)?);
            match limit {
                Some(limit) => envelope.with("limit", json!(limit)),
                None => envelope,
            }
        }
        Command::Exec { code } => Envelope::new("exec-js").with("code", json!(code)),
        Command::Click { selector } => Envelope::new("click").with("selector", json!(selector)),
        Command::Refresh { hard } => Envelope::new("refresh").with("hard", json!(hard)),
        Command::Network { limit } => {
            let envelope = Envelope::new("network");
            match limit {
                Some(limit) => envelope.with("limit", json!(limit)),
                None => envelope,
            }
        }
    };
    Ok(envelope)
}

fn log_filter(
    levels: &[String],
    pattern: Option<String>,
    source: Option<String>,
) -> Result<LogFilter> {
    let levels = if levels.is_empty() {
        None
    } else {
        Some(
            levels
                .iter()
                .map(|level| {
                    serde_json::from_value::<LogLevel>(json!(level.to_ascii_lowercase()))
                        .with_context(|| format!("unknown log level: {level}"))
                })
                .collect::<Result<Vec<_>>>()?,
        )
    };
    Ok(LogFilter {
        levels,
        pattern,
        source,
    })
}

fn log_format(settings: &BridgeSettings) -> LogFormat {
    LogFormat::parse(&settings.logging.format).unwrap_or_default()
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Operator-facing message for a failed command.
fn describe(err: &ClientError, timeout: Duration) -> String {
    if err.is_no_browser() {
        "browser not connected".to_owned()
    } else if err.is_timeout() {
        format!("no response from browser within {}s", timeout.as_secs().max(1))
    } else {
        err.to_string()
    }
}
