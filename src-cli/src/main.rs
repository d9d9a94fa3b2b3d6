//! Subtext Command-Line Interface
//!
//! A headless client for the subtext transcription service, enabling
//! scriptable subtitle generation without the web front end.

mod client;
mod colors;
mod commands;
mod exit_codes;

use clap::{Parser, Subcommand};
use exit_codes::ExitCode;

/// Subtext - Speech-to-subtitle CLI
#[derive(Parser, Debug)]
#[command(name = "subtext")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcribe a local file or remote media URL to SRT subtitles
    Transcribe {
        /// Audio/video file path or media URL
        source: String,

        #[command(flatten)]
        options: TranscribeOptions,
    },
    /// Show service status
    Status,
    /// List available models
    Models,
    /// Show version information
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct TranscribeOptions {
    /// Model variant (use 'subtext models' to list)
    #[arg(short, long)]
    model: Option<String>,

    /// Numeric precision: float16, int8, float32
    #[arg(long, default_value = "float16")]
    precision: String,

    /// Source language code, or 'auto' to detect
    #[arg(short, long, default_value = "auto")]
    language: String,

    /// Task: transcribe or translate
    #[arg(short, long, default_value = "transcribe")]
    task: String,

    /// Disable voice-activity detection
    #[arg(long)]
    no_vad: bool,

    /// Minimum silence between speech regions (seconds)
    #[arg(long, default_value_t = 0.1)]
    min_silence: f64,

    /// Keep raw engine segments instead of merging short neighbours
    #[arg(long)]
    no_merge: bool,

    /// Maximum characters per subtitle line
    #[arg(long, default_value_t = 80)]
    max_chars: usize,

    /// Use the multi-device parallel pipeline
    #[arg(short = 'P', long)]
    parallel: bool,

    /// Convert Simplified Chinese output to Traditional
    #[arg(long)]
    convert: bool,

    /// Also write the SRT to this path
    #[arg(short, long)]
    output: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    // Build the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code.as_i32());
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Transcribe { source, options } => {
            commands::transcribe(source, options, cli.json, cli.quiet).await
        }
        Commands::Status => commands::status(cli.json).await,
        Commands::Models => commands::models(cli.json, cli.quiet).await,
        Commands::Version => {
            commands::version(cli.json);
            ExitCode::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    /// Verify the CLI definition is valid
    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    /// Test parsing a plain transcribe command
    #[test]
    fn parse_transcribe() {
        let cli = Cli::try_parse_from(["subtext", "transcribe", "talk.wav"]).unwrap();
        match cli.command {
            Commands::Transcribe { source, options } => {
                assert_eq!(source, "talk.wav");
                assert!(options.model.is_none());
                assert_eq!(options.precision, "float16");
                assert_eq!(options.language, "auto");
                assert!(!options.no_vad);
                assert!(!options.parallel);
                assert_eq!(options.max_chars, 80);
            }
            _ => panic!("Expected Transcribe command"),
        }
        assert!(!cli.json);
        assert!(!cli.quiet);
    }

    /// Test parsing transcribe with the full option set
    #[test]
    fn parse_transcribe_with_options() {
        let cli = Cli::try_parse_from([
            "subtext",
            "transcribe",
            "https://media.example/v/abc",
            "--model",
            "large-v3",
            "--precision",
            "int8",
            "-l",
            "zh",
            "-t",
            "translate",
            "--no-vad",
            "--min-silence",
            "0.5",
            "--no-merge",
            "--max-chars",
            "60",
            "-P",
            "--convert",
            "-o",
            "/tmp/out.srt",
        ])
        .unwrap();

        match cli.command {
            Commands::Transcribe { source, options } => {
                assert_eq!(source, "https://media.example/v/abc");
                assert_eq!(options.model.as_deref(), Some("large-v3"));
                assert_eq!(options.precision, "int8");
                assert_eq!(options.language, "zh");
                assert_eq!(options.task, "translate");
                assert!(options.no_vad);
                assert_eq!(options.min_silence, 0.5);
                assert!(options.no_merge);
                assert_eq!(options.max_chars, 60);
                assert!(options.parallel);
                assert!(options.convert);
                assert_eq!(options.output.as_deref(), Some("/tmp/out.srt"));
            }
            _ => panic!("Expected Transcribe command"),
        }
    }

    /// Test parsing with global flags after the subcommand
    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["subtext", "status", "--json", "-q"]).unwrap();
        assert!(cli.json);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Status));
    }

    /// Test parsing 'models' command
    #[test]
    fn parse_models() {
        let cli = Cli::try_parse_from(["subtext", "models"]).unwrap();
        assert!(matches!(cli.command, Commands::Models));
    }

    /// Test parsing 'version' command
    #[test]
    fn parse_version() {
        let cli = Cli::try_parse_from(["subtext", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    /// Test missing source returns error
    #[test]
    fn parse_missing_source() {
        let result = Cli::try_parse_from(["subtext", "transcribe"]);
        assert!(result.is_err());
    }

    /// Test invalid command returns error
    #[test]
    fn parse_invalid_command() {
        let result = Cli::try_parse_from(["subtext", "record"]);
        assert!(result.is_err());
    }
}
