use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "audiofetch",
    about = "Audiofetch - Convert YouTube videos into size-bounded MP3 audio",
    version,
    long_about = "Fetches a YouTube video, transcodes its audio track into an MP3 bounded by the delivery channel's attachment size cap, and reports progress until completion, cancellation, or failure."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive conversion session
    Run,

    /// Convert a single video and exit
    Convert {
        /// YouTube video URL or bare video id
        #[arg(value_name = "URL")]
        url: String,

        /// Override the configured audio bitrate (kbit/s)
        #[arg(short, long, value_name = "KBPS")]
        bitrate: Option<u32>,
    },

    /// Show or initialize the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}
