use std::io::Write;
use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use testlink::{ExecutionMessage, RunnerConfig, RunnerEngine};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: testlink-runner [--label <name>] [--capability <n>] [--bind <addr>] \
                     [--handshake-timeout <s>]";

struct Args {
    label: Option<String>,
    capability: Option<u32>,
    bind: Option<IpAddr>,
    handshake_timeout: Duration,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --label <name>             Runner label [default: runner-<uuid>]");
            eprintln!("  --capability <n>           Advertised protocol capability [default: 1]");
            eprintln!("  --bind <addr>              Listen address [default: 127.0.0.1]");
            eprintln!("  --handshake-timeout <s>    Seconds to wait for the peer [default: 30]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        label: None,
        capability: None,
        bind: None,
        handshake_timeout: Duration::from_secs(30),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--label" => {
                i += 1;
                parsed.label = Some(args.get(i).ok_or("--label requires a value")?.clone());
            }
            "--capability" => {
                i += 1;
                let raw = args.get(i).ok_or("--capability requires a value")?;
                parsed.capability = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid capability '{raw}'"))?,
                );
            }
            "--bind" => {
                i += 1;
                let raw = args.get(i).ok_or("--bind requires a value")?;
                parsed.bind = Some(raw.parse().map_err(|_| format!("invalid address '{raw}'"))?);
            }
            "--handshake-timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--handshake-timeout requires a value")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid timeout '{raw}'"))?;
                parsed.handshake_timeout = Duration::from_secs(secs);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TESTLINK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("testlink={level},testlink_cli={level}"))
    };

    // stdout is reserved for the port line and forwarded messages.
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn print_message(message: ExecutionMessage) -> bool {
    let line = match serde_json::to_string(&message) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(operation_id = %message.operation_id, error = %e, "Failed to encode message");
            return true;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
        // Nobody is reading; ask the peer to stop.
        tracing::error!(error = %e, "Failed to write message to stdout");
        return false;
    }
    true
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match args.label {
        Some(label) => RunnerConfig::new(label),
        None => RunnerConfig::default(),
    };
    if let Some(capability) = args.capability {
        config = config.with_capability(capability);
    }
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }

    let runner = RunnerEngine::new(config, Arc::new(print_message));
    let port = runner.start().context("failed to start runner")?;
    println!("{}", serde_json::json!({ "port": port }));

    let outcome = tokio::select! {
        result = runner.wait_connected(args.handshake_timeout) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted before the peer connected")),
    };
    if let Err(e) = outcome {
        runner.disconnect().await;
        return Err(e);
    }
    tracing::info!(
        label = %runner.label(),
        capability = ?runner.negotiated_capability(),
        "Execution peer connected"
    );

    tokio::select! {
        _ = runner.closed() => {
            tracing::info!(label = %runner.label(), "Execution peer went away");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(label = %runner.label(), "Interrupted, asking peer to quit");
            runner.send_quit();
        }
    }

    runner.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("testlink-runner")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert!(args.label.is_none());
        assert!(args.capability.is_none());
        assert!(args.bind.is_none());
        assert_eq!(args.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn all_flags() {
        let args = parse_args(&argv(&[
            "--label",
            "ci",
            "--capability",
            "2",
            "--bind",
            "0.0.0.0",
            "--handshake-timeout",
            "5",
        ]))
        .unwrap();
        assert_eq!(args.label.as_deref(), Some("ci"));
        assert_eq!(args.capability, Some(2));
        assert_eq!(args.bind, Some("0.0.0.0".parse().unwrap()));
        assert_eq!(args.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn usage_lists_every_flag() {
        for flag in ["--label", "--capability", "--bind", "--handshake-timeout"] {
            assert!(USAGE.contains(flag), "usage is missing {flag}");
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&["--capability", "many"])).is_err());
        assert!(parse_args(&argv(&["--label"])).is_err());
        assert!(parse_args(&argv(&["extra"])).is_err());
        assert_eq!(parse_args(&argv(&["--help"])).err().as_deref(), Some(""));
    }
}
