//! Application entry point for the smart-mirror voice assistant.
//!
//! # Startup sequence
//!
//! 1. Load [`AssistantConfig`] (first argument, or the default location).
//! 2. Initialise logging (`debug` when the config asks for it).
//! 3. Create the [`tokio`] runtime.
//! 4. Build the collaborators from config and probe the services.
//! 5. Spawn the interaction controller.
//! 6. Forward terminal commands and Ctrl-C until shutdown.
//!
//! On a terminal the status panel is printed to stdout; otherwise (e.g. under
//! a service manager) it goes to the log.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use mirror_voice::{
    audio::{ClipConverter, FormatConverter, MicrophoneSource, RemoteConverter},
    config::{AssistantConfig, TranscriptionBackend},
    controller::{
        Collaborators, ControllerCommand, DisplaySink, InteractionController, LogDisplay, NoDisplay,
        StatusSnapshot, WatchDisplay,
    },
    llm::{ChatClient, LlmClient},
    speech::{CommandSpeaker, SilentSpeaker, SpeechSynthesizer},
    stt::{HttpTranscriber, TranscriptionClient},
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

fn build_transcriber(config: &AssistantConfig) -> anyhow::Result<Arc<dyn TranscriptionClient>> {
    match config.transcription.backend {
        TranscriptionBackend::Http => {
            Ok(Arc::new(HttpTranscriber::from_config(&config.transcription)))
        }
        #[cfg(feature = "whisper")]
        TranscriptionBackend::Whisper => {
            let engine = mirror_voice::stt::WhisperTranscriber::load(
                &config.transcription,
                &config.language,
            )?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "whisper"))]
        TranscriptionBackend::Whisper => {
            anyhow::bail!("backend \"whisper\" needs a build with `--features whisper`")
        }
    }
}

fn build_converter(config: &AssistantConfig) -> Arc<dyn ClipConverter> {
    let local = FormatConverter::new(config.audio.decode_timeout());
    match &config.transcription.conversion_endpoint {
        Some(endpoint) => {
            log::info!("Unsupported containers will be converted by {endpoint}");
            let remote = RemoteConverter::new(endpoint.clone(), config.transcription.command_timeout());
            Arc::new(local.with_fallback(Arc::new(remote)))
        }
        None => Arc::new(local),
    }
}

/// Log whether the services answer.  Failures are not fatal: the controller
/// copes with services that come up later.
async fn probe_services(config: &AssistantConfig, chat: &ChatClient) {
    if config.transcription.backend == TranscriptionBackend::Http {
        match HttpTranscriber::from_config(&config.transcription).status().await {
            Ok(status) => log::info!(
                "Transcription service {} (model loaded: {})",
                status.status,
                status.model_loaded
            ),
            Err(e) => log::warn!("Transcription service not reachable yet: {e}"),
        }
    }
    match chat.probe().await {
        Ok(()) => log::info!("Language model reachable at {}", config.llm.endpoint),
        Err(e) => log::warn!("Language model not reachable yet: {e}"),
    }
}

/// Print the panel each time the controller publishes.
async fn show_status(mut rx: watch::Receiver<StatusSnapshot>) {
    while rx.changed().await.is_ok() {
        let lines = rx.borrow_and_update().lines();
        for line in lines {
            println!("{line}");
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal commands
// ---------------------------------------------------------------------------

fn parse_command(line: &str) -> Option<ControllerCommand> {
    match line.trim().to_lowercase().as_str() {
        "talk" | "t" => Some(ControllerCommand::Trigger),
        "stop" | "s" => Some(ControllerCommand::StopRecording),
        "sleep" => Some(ControllerCommand::Sleep),
        "suspend" => Some(ControllerCommand::Suspend),
        "resume" => Some(ControllerCommand::Resume),
        "quit" | "exit" | "q" => Some(ControllerCommand::Shutdown),
        _ => None,
    }
}

async fn forward_commands(tx: mpsc::Sender<ControllerCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let command = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(command) => command,
                    None => {
                        if !line.trim().is_empty() {
                            log::warn!("Unknown command {line:?} (talk, stop, sleep, suspend, resume, quit)");
                        }
                        continue;
                    }
                },
                // stdin closed: keep running until Ctrl-C.
                Ok(None) | Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    ControllerCommand::Shutdown
                }
            },
            _ = tokio::signal::ctrl_c() => ControllerCommand::Shutdown,
        };

        let shutdown = command == ControllerCommand::Shutdown;
        if tx.send(command).await.is_err() || shutdown {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // 1. Configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let loaded = match &config_path {
        Some(path) => AssistantConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display())),
        None => AssistantConfig::load(),
    };

    // 2. Logging
    let default_filter = match &loaded {
        Ok(config) if config.debug => "debug",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = loaded.unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e:#}); using defaults");
        AssistantConfig::default()
    });
    log::info!("Mirror voice assistant starting (wake phrase {:?})", config.wake.phrase);

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async move {
        // 4. Collaborators
        let transcriber = build_transcriber(&config)?;
        let chat = ChatClient::from_config(&config.llm);
        probe_services(&config, &chat).await;

        let speaker: Arc<dyn SpeechSynthesizer> = if config.speech.enabled {
            Arc::new(CommandSpeaker::from_config(&config.speech))
        } else {
            Arc::new(SilentSpeaker)
        };
        let display: Arc<dyn DisplaySink> = if !config.display.enabled {
            Arc::new(NoDisplay)
        } else if std::io::stdout().is_terminal() {
            let (display, rx) = WatchDisplay::new(&config.wake.phrase);
            tokio::spawn(show_status(rx));
            Arc::new(display)
        } else {
            Arc::new(LogDisplay)
        };
        let llm: Arc<dyn LlmClient> = Arc::new(chat);

        let collaborators = Collaborators {
            source: Arc::new(MicrophoneSource::default()),
            converter: build_converter(&config),
            transcriber,
            llm,
            speaker,
            display,
        };

        // 5. Controller
        let (command_tx, command_rx) = mpsc::channel(16);
        let controller = InteractionController::new(config, collaborators);
        let controller_task = tokio::spawn(controller.run(command_rx));

        // 6. Commands until shutdown
        log::info!("Type talk, stop, sleep, suspend, resume or quit");
        forward_commands(command_tx).await;
        controller_task.await.context("controller task failed")?;

        log::info!("Mirror voice assistant stopped");
        Ok::<(), anyhow::Error>(())
    })
}
