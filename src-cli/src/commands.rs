//! CLI command implementations.

use std::io::Write;

use subtext_common::ipc::{Request, Response};
use subtext_common::types::{Precision, Task, TranscribeRequest};

use crate::client::ServiceClient;
use crate::colors;
use crate::exit_codes::ExitCode;
use crate::TranscribeOptions;

/// Build the IPC request from CLI options.
fn build_request(source: String, options: &TranscribeOptions) -> Result<TranscribeRequest, String> {
    let mut request = TranscribeRequest::new(source);

    if let Some(model) = &options.model {
        request.model = model.clone();
    }
    request.precision = Precision::parse(&options.precision)
        .ok_or_else(|| format!("unknown precision '{}'", options.precision))?;
    request.task = Task::parse(&options.task)
        .ok_or_else(|| format!("unknown task '{}'", options.task))?;
    request.language = match options.language.as_str() {
        "auto" | "" => None,
        other => Some(other.to_string()),
    };
    request.use_vad = !options.no_vad;
    request.min_silence_s = options.min_silence;
    request.merge = !options.no_merge;
    request.max_chars = options.max_chars;
    request.parallel = options.parallel;
    request.convert_script = options.convert;

    request.validate()?;
    Ok(request)
}

/// Run a transcription and print the outcome.
pub async fn transcribe(
    source: String,
    options: TranscribeOptions,
    json: bool,
    quiet: bool,
) -> ExitCode {
    let request = match build_request(source, &options) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", colors::error(&e));
            return ExitCode::InvalidArguments;
        }
    };

    if !quiet && !json {
        eprintln!("{}", colors::dim("Transcribing... this can take a while."));
    }

    let client = ServiceClient::new();
    let outcome = match client.request(Request::Transcribe { request }).await {
        Ok(Response::Outcome { outcome }) => outcome,
        Ok(other) => {
            eprintln!("{}", colors::error(&format!("unexpected response: {:?}", other)));
            return ExitCode::GeneralError;
        }
        Err(e) => {
            eprintln!("{}", colors::error(&e.to_string()));
            return e.to_exit_code();
        }
    };

    // Optionally mirror the SRT to a caller-chosen path.
    if let Some(output) = &options.output {
        if let Err(e) = std::fs::write(output, &outcome.subtitles) {
            eprintln!("{}", colors::error(&format!("could not write {}: {}", output, e)));
            return ExitCode::GeneralError;
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
        return ExitCode::Success;
    }

    // SRT on stdout so it pipes; everything else on stderr.
    print!("{}", outcome.subtitles);
    let _ = std::io::stdout().flush();

    if !quiet {
        for warning in &outcome.warnings {
            eprintln!("{}", colors::warning(warning));
        }
        let mut summary = format!(
            "{} subtitle(s), {:.1}s audio in {:.1}s",
            outcome.segment_count, outcome.audio_duration_s, outcome.elapsed_s
        );
        if outcome.elapsed_s > 0.0 {
            summary.push_str(&format!(
                " ({:.1}x realtime)",
                outcome.audio_duration_s / outcome.elapsed_s
            ));
        }
        eprintln!("{}", colors::success(&summary));
        if let Some(path) = &outcome.subtitles_path {
            eprintln!("{}", colors::dim(&format!("saved to {}", colors::path(path))));
        }
    }

    ExitCode::Success
}

/// Show service status.
pub async fn status(json: bool) -> ExitCode {
    let client = ServiceClient::new();
    match client.request(Request::Status).await {
        Ok(Response::Status { status }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&status).unwrap());
            } else {
                println!("{}", colors::header("subtext service"));
                println!(
                    "  sessions: {} of {}",
                    colors::number(&status.active_sessions.to_string()),
                    colors::number(&status.max_sessions.to_string())
                );
                if status.cached_engines.is_empty() {
                    println!("  engines:  {}", colors::dim("none resident"));
                } else {
                    println!("  engines:  {}", status.cached_engines.join(", "));
                }
                println!("  version:  {}", status.version);
            }
            ExitCode::Success
        }
        Ok(other) => {
            eprintln!("{}", colors::error(&format!("unexpected response: {:?}", other)));
            ExitCode::GeneralError
        }
        Err(e) => {
            eprintln!("{}", colors::error(&e.to_string()));
            e.to_exit_code()
        }
    }
}

/// List the model catalogue.
pub async fn models(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();
    match client.request(Request::ListModels).await {
        Ok(Response::Models { models }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&models).unwrap());
            } else {
                if !quiet {
                    println!("{}", colors::header("Available models"));
                }
                for model in models {
                    println!("  {}", model.display_name);
                }
            }
            ExitCode::Success
        }
        Ok(other) => {
            eprintln!("{}", colors::error(&format!("unexpected response: {:?}", other)));
            ExitCode::GeneralError
        }
        Err(e) => {
            eprintln!("{}", colors::error(&e.to_string()));
            e.to_exit_code()
        }
    }
}

/// Show version information.
pub fn version(json: bool) {
    if json {
        println!(r#"{{"version": "{}"}}"#, env!("CARGO_PKG_VERSION"));
    } else {
        println!("subtext {}", env!("CARGO_PKG_VERSION"));
    }
}
