use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use retiscan::{AnalyzeError, ClientConfig, HealthStatus, Session};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: retiscan [--url <base>] <command>

Commands:
  health                   Poll backend health once and print it
  predict <image> [--gradcam]
                           Classify a PNG or JPEG fundus image
  model-info               Print the backend's model description
  privacy                  Print the backend's privacy notice

Options:
  --url <base>     Backend address [default: RETISCAN_API_BASE_URL]

Environment:
  RETISCAN_ENV=production  Require an explicit backend address
  RETISCAN_LOG             Log level: debug, info, warn, error
  LOG_FORMAT=json          Emit logs as JSON on stderr";

/// How long to wait for the first health report before giving up.
const HEALTH_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Health,
    Predict { image: PathBuf, gradcam: bool },
    ModelInfo,
    Privacy,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    url: Option<String>,
    command: Command,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RETISCAN_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("retiscan={level},retiscan_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
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
    let mut url: Option<String> = None;
    let mut gradcam = false;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                url = Some(args.get(i).ok_or("--url requires a value")?.clone());
            }
            "--gradcam" => gradcam = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let (name, rest) = positional
        .split_first()
        .ok_or("missing required argument: <command>")?;

    let command = match (*name, rest) {
        ("health", []) => Command::Health,
        ("model-info", []) => Command::ModelInfo,
        ("privacy", []) => Command::Privacy,
        ("predict", [image]) => Command::Predict {
            image: PathBuf::from(*image),
            gradcam,
        },
        ("predict", []) => return Err("predict requires an <image> argument".to_string()),
        ("health" | "model-info" | "privacy" | "predict", [_, ..]) => {
            return Err(format!("unexpected argument: {}", rest[rest.len() - 1]));
        }
        (other, _) => return Err(format!("unknown command: {other}")),
    };

    if gradcam && !matches!(command, Command::Predict { .. }) {
        return Err("--gradcam only applies to predict".to_string());
    }

    Ok(Args { url, command })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ClientConfig::from_env();
    if let Some(url) = args.url {
        config = config.with_base_url(url);
    }

    let session = Session::new(config).context("failed to build HTTP client")?;

    let output = match args.command {
        Command::Health => {
            let status = wait_for_health(&session).await?;
            serde_json::to_value(&status)?
        }
        Command::Predict { image, gradcam } => {
            session
                .select_path(&image)
                .with_context(|| format!("cannot use {}", image.display()))?;
            wait_for_health(&session).await?;
            let result = session.analyze(gradcam).await.map_err(describe_failure)?;
            let mut value = serde_json::to_value(&result)?;
            value["ranked"] = result
                .ranked_probabilities()
                .into_iter()
                .map(|(label, percent)| json!({"label": label, "percent": percent}))
                .collect();
            value
        }
        Command::ModelInfo => session.model_info().await?,
        Command::Privacy => session.privacy_notice().await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    session.shutdown();
    Ok(())
}

/// Start polling and wait for the first settled health state.
async fn wait_for_health(session: &Session) -> anyhow::Result<HealthStatus> {
    let mut rx = session.subscribe_health();
    session.start();
    let status = tokio::time::timeout(
        HEALTH_WAIT,
        rx.wait_for(|s| !matches!(s, HealthStatus::Unknown)),
    )
    .await
    .context("timed out waiting for backend health")?
    .context("health monitor stopped")?
    .clone();
    tracing::info!(status = ?status, "Backend health");
    Ok(status)
}

fn describe_failure(error: AnalyzeError) -> anyhow::Error {
    match error.retry_in_seconds() {
        Some(seconds) => anyhow::anyhow!("{error} (retry in {seconds}s)"),
        None => anyhow::Error::new(error),
    }
}
