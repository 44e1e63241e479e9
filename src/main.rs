use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiofetch::dispatch::ConsoleChannel;
use audiofetch::source::youtube::YtDlpSource;
use audiofetch::transcode::ffmpeg::FfmpegTranscoder;
use audiofetch::{utils, Cli, Commands, Config, Dispatcher, RequesterId};

/// Requester identity used for the local console session
const CONSOLE_REQUESTER: RequesterId = 0;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "audiofetch=debug"
    } else {
        "audiofetch=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Check for required external dependencies
    let missing_deps = utils::check_dependencies().await;
    if !missing_deps.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - tools may be available)");
    }

    let config = Config::load().await?;

    match cli.command {
        Commands::Run => run_session(config).await?,
        Commands::Convert { url, bitrate } => convert_once(config, url, bitrate).await?,
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                config.interactive_setup()?;
            }
        }
    }

    Ok(())
}

fn build_dispatcher(config: Config) -> Dispatcher<ConsoleChannel> {
    Dispatcher::new(
        config,
        ConsoleChannel::new(),
        Arc::new(YtDlpSource::new()),
        Arc::new(FfmpegTranscoder::new()),
    )
}

async fn run_session(config: Config) -> Result<()> {
    let dispatcher = Arc::new(build_dispatcher(config));

    println!("Paste a YouTube link to convert it.");
    println!("Commands: /cancel aborts the running conversion, /allow <id> extends the whitelist, /help, /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();

        match line.as_str() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" | "/start" => dispatcher.handle_help(CONSOLE_REQUESTER).await?,
            "/cancel" => dispatcher.handle_cancel(CONSOLE_REQUESTER),
            _ => {
                if let Some(rest) = line.strip_prefix("/allow ") {
                    match rest.trim().parse::<RequesterId>() {
                        Ok(user) => dispatcher.handle_allow(CONSOLE_REQUESTER, user).await?,
                        Err(_) => eprintln!("Usage: /allow <numeric id>"),
                    }
                    continue;
                }

                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.handle_convert(CONSOLE_REQUESTER, &line).await {
                        tracing::error!("conversion request failed: {e:#}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn convert_once(mut config: Config, url: String, bitrate: Option<u32>) -> Result<()> {
    if let Some(bitrate) = bitrate {
        anyhow::ensure!(bitrate > 0, "bitrate must be positive");
        config.conversion.bitrate = bitrate;
    }

    let dispatcher = build_dispatcher(config);
    dispatcher.handle_convert(CONSOLE_REQUESTER, &url).await?;
    dispatcher.channel().finish_all();

    Ok(())
}
