//! `tonecast` — drive one simulated call through the playout engine.
//!
//! ```text
//! tonecast --text "Press one for sales" \
//!          [--config settings.json] [--digits 1@1500,2@1900] \
//!          [--hangup-at 2500] [--simulated] [--save-config]
//! ```
//!
//! The call uses the scripted synthesis engine and the loopback channel.
//! Digits and hangups are scripted at millisecond offsets from call start.
//! `--simulated` runs on a manual clock so the whole call completes
//! instantly; otherwise audio is paced in real time.
//!
//! The session itself is blocking, so it runs in `spawn_blocking` while an
//! async task forwards its status events to the log. The outcome is printed
//! to stdout as JSON.

mod settings;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::sync::broadcast::error::RecvError;
use tonecast_core::{
    telephony::ChannelProbe, ClockHandle, LoopbackChannel, ManualClock, ScriptedEngine,
    ScriptedInbound, Session, SystemClock,
};
use tracing::{info, warn};

/// Synthesized audio per engine callback (100 ms at 8 kHz).
const CHUNK_BYTES: usize = 800;
/// Gap between callbacks of the real-time engine; faster than playback.
const ENGINE_STEP: Duration = Duration::from_millis(5);
/// Bytes per millisecond of 8 kHz μ-law.
const BYTES_PER_MS: u64 = 8;

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    text: String,
    digits: Vec<(char, u64)>,
    hangup_at: Option<u64>,
    simulated: bool,
    save_config: bool,
}

fn parse_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => cli.config = Some(PathBuf::from(value_of(&mut args, &arg)?)),
            "--text" => cli.text = value_of(&mut args, &arg)?,
            "--digits" => cli.digits = parse_digit_schedule(&value_of(&mut args, &arg)?)?,
            "--hangup-at" => {
                let raw = value_of(&mut args, &arg)?;
                cli.hangup_at = Some(
                    raw.parse()
                        .with_context(|| format!("invalid --hangup-at value '{raw}'"))?,
                );
            }
            "--simulated" => cli.simulated = true,
            "--save-config" => cli.save_config = true,
            other => bail!("unknown argument '{other}'"),
        }
    }

    if cli.text.trim().is_empty() {
        bail!("--text is required");
    }
    Ok(cli)
}

fn value_of(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

/// Parse `key@ms` pairs separated by commas, e.g. `1@150,#@900`.
fn parse_digit_schedule(raw: &str) -> anyhow::Result<Vec<(char, u64)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| -> anyhow::Result<(char, u64)> {
            let (key, at) = part
                .split_once('@')
                .with_context(|| format!("digit '{part}' must look like key@ms"))?;
            let mut chars = key.chars();
            let key = match (chars.next(), chars.next()) {
                (Some(k), None) if k.is_ascii_digit() || k == '*' || k == '#' => k,
                _ => bail!("'{key}' is not a keypad key"),
            };
            let at = at
                .parse()
                .with_context(|| format!("invalid offset in digit '{part}'"))?;
            Ok((key, at))
        })
        .collect()
}

fn build_engine(settings: &AppSettings, text: &str, simulated: bool) -> ScriptedEngine {
    let speech_ms = text.chars().count() as u64 * settings.speech_ms_per_char;
    let bytes = usize::try_from(speech_ms * BYTES_PER_MS).unwrap_or(usize::MAX);

    if simulated {
        // Inline delivery happens before playback starts, so it must fit.
        let fitted = bytes.min(settings.buffer_size);
        if fitted < bytes {
            warn!(
                requested = bytes,
                kept = fitted,
                "simulated speech truncated to the ring capacity"
            );
        }
        return ScriptedEngine::speaking(fitted, CHUNK_BYTES).with_inline_delivery();
    }
    ScriptedEngine::speaking(bytes, CHUNK_BYTES).with_step_interval(ENGINE_STEP)
}

fn build_channel(settings: &AppSettings, cli: &CliArgs, clock: ClockHandle) -> LoopbackChannel {
    let mut channel = LoopbackChannel::new(clock);
    for extension in &settings.extensions {
        channel = channel.with_extension(extension);
    }
    for &(key, at) in &cli.digits {
        channel = channel.at(Duration::from_millis(at), ScriptedInbound::dtmf(key));
    }
    if let Some(at) = cli.hangup_at {
        channel = channel.at(Duration::from_millis(at), ScriptedInbound::Disconnect);
    }
    channel
}

fn log_channel_summary(probe: &ChannelProbe) {
    let frames = probe.frames();
    let last = frames.last().map(|f| f.at.as_millis() as u64);
    info!(
        frames = frames.len(),
        bytes = probe.audio().len(),
        last_frame_ms = ?last,
        routed = ?probe.routed_to(),
        "channel summary"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tonecast=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;

    let settings_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), voice = %settings.voice, "settings loaded");
    if cli.save_config {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("failed to save {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings saved");
    }

    let clock: ClockHandle = if cli.simulated {
        ManualClock::shared()
    } else {
        SystemClock::handle()
    };

    let engine = build_engine(&settings, &cli.text, cli.simulated);
    let mut channel = build_channel(&settings, &cli, clock.clone());
    let probe = channel.probe();
    let mut session = Session::new(settings.session_config(), Box::new(engine), clock);

    let mut status_rx = session.subscribe_status();
    let forwarder = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => info!(status = ?event.status, detail = ?event.detail, "session status"),
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let text = cli.text.clone();
    let result = tokio::task::spawn_blocking(move || session.play(&mut channel, &text))
        .await
        .context("session thread panicked")?;
    // The session (and its status sender) is gone; drain what is left.
    if let Err(e) = forwarder.await {
        warn!("status forwarder failed: {e}");
    }

    log_channel_summary(&probe);
    let outcome = result.context("call failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
