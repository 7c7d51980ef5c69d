//! Interactive translation console.
//!
//! Type a line to translate it, or switch to speech mode to talk into the
//! microphone. `quit` or an empty line ends the session.

mod audio_device;
mod resample;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sonic_core::{SessionStatus, Translator, TranslatorConfig, TranslatorHandle};
use sonic_realtime::codec::EndpointingSensitivity;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OUTPUT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Typed input; silence keeps the audio segment open.
    Text,
    /// Microphone input.
    Speech,
}

#[derive(Parser, Debug)]
#[command(version, about = "Real-time speech and text translation")]
struct Args {
    /// Target language. Defaults to SONIC_TARGET_LANGUAGE or the config file.
    #[arg(short, long)]
    language: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Text)]
    mode: Mode,

    /// Output voice id, e.g. matthew, tiffany, amy.
    #[arg(long)]
    voice: Option<String>,

    /// Turn-detection sensitivity: HIGH, MEDIUM or LOW.
    #[arg(long)]
    sensitivity: Option<EndpointingSensitivity>,

    /// Do not play translated audio.
    #[arg(long)]
    mute: bool,
}

fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.eq_ignore_ascii_case("quit")
}

fn print_output(handle: &mut TranslatorHandle) {
    for chunk in handle.drain_text() {
        println!("{}", chunk);
    }
    // Muted sessions leave audio in the handle's queue.
    handle.drain_audio();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = TranslatorConfig::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.log_level.into())
                .from_env_lossy(),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    if let Some(voice) = args.voice {
        config.voice_id = voice;
    }
    if args.sensitivity.is_some() {
        config.endpointing_sensitivity = args.sensitivity;
    }
    let language = args
        .language
        .unwrap_or_else(|| config.target_language.clone());

    let mut translator = Translator::new(config.connector(), config.session_config());

    // Device streams stay on this task; only their buffers move into the translator.
    let _speaker = if args.mute {
        None
    } else {
        let (stream, sink) = audio_device::open_speaker()?;
        translator = translator.with_audio_sink(Box::new(sink));
        Some(stream)
    };
    let _microphone = if args.mode == Mode::Speech {
        let (stream, source) = audio_device::open_microphone()?;
        translator = translator.with_microphone(Box::new(source));
        Some(stream)
    } else {
        None
    };

    info!(
        provider = ?config.provider,
        language = %language,
        voice = %config.voice_id,
        mode = ?args.mode,
        "Starting translator."
    );
    let mut handle = translator
        .translate(&language)
        .await
        .context("Failed to start the translation session")?;

    match args.mode {
        Mode::Text => println!("Translating to {}. Type text to translate, 'quit' to stop.", language),
        Mode::Speech => println!("Translating speech to {}. Press Enter to stop.", language),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = handle.watch_status();
    let mut ticker = tokio::time::interval(OUTPUT_POLL);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.context("Failed to read stdin")?;
                match line {
                    Some(line) if !is_exit_command(&line) => {
                        if let Err(e) = handle.submit_text(line.trim()) {
                            warn!(error = %e, "Could not submit text.");
                        }
                    }
                    _ => break,
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    SessionStatus::Reconnecting => info!("Reconnecting the stream..."),
                    SessionStatus::Failed(reason) => {
                        eprintln!("Session failed: {}", reason);
                        break;
                    }
                    SessionStatus::Stopped => break,
                    _ => {}
                }
            }
            _ = ticker.tick() => print_output(&mut handle),
        }
    }

    handle.stop();
    let result = handle.join().await;
    print_output(&mut handle);
    result.context("Translator ended with an error")?;
    info!("Session closed.");
    Ok(())
}
