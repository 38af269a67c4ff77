//! `Session` — one call's worth of synthesis, playback and digit collection.
//!
//! ## Lifecycle
//!
//! ```text
//! Session::new()
//!     └─► play(channel, text)
//!           ├─ engine.open(voice) → engine.speak(text, bridge)
//!           ├─ answer the channel if needed, switch it to μ-law
//!           ├─ PlaybackPump + InterruptWatcher until the ring goes inactive
//!           ├─ digit collection (interrupted or after playback), routing
//!           └─ teardown: cancel ring → engine.close() → restore write format
//! ```
//!
//! Teardown runs on every exit once the corresponding setup step happened.
//! The ring is cancelled before the engine is closed so a producer blocked on
//! a full ring is released before its thread is joined.

pub mod digits;
pub mod interrupt;
pub mod playback;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, info_span, warn};

use crate::{
    buffering::RingBuffer,
    clock::ClockHandle,
    config::SessionConfig,
    error::{Result, TonecastError},
    events::{CallResult, SessionOutcome, SessionStatus, SessionStatusEvent},
    synthesis::{SynthesisBridge, SynthesisEngine, SynthesisSink},
    telephony::{CallChannel, WriteFormat, VOICE_VARIABLE},
};

use digits::Collected;
use interrupt::InterruptWatcher;
use playback::{DiagnosticsSnapshot, PlaybackDiagnostics, PlaybackPump, PumpExit};

/// Status events buffered for slow subscribers.
const STATUS_CAP: usize = 64;

pub struct Session {
    config: SessionConfig,
    engine: Box<dyn SynthesisEngine>,
    clock: ClockHandle,
    status: Arc<Mutex<SessionStatus>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl Session {
    pub fn new(config: SessionConfig, engine: Box<dyn SynthesisEngine>, clock: ClockHandle) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        Self {
            config,
            engine,
            clock,
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
            status_tx,
            diagnostics: Arc::new(PlaybackDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Speak `text` into `channel`, honouring hangups and digit presses.
    ///
    /// A hangup is not an error: it comes back as `CallResult::Hangup`.
    ///
    /// # Errors
    /// - `EmptyText` / `InvalidConfig` before anything is opened.
    /// - `EngineUnavailable`, `VoiceUnavailable`, `SpeakFailed`,
    ///   `ChannelSetup` when setup fails.
    /// - `BufferAccounting` if the ring's bookkeeping breaks mid-call.
    pub fn play(&mut self, channel: &mut dyn CallChannel, text: &str) -> Result<SessionOutcome> {
        if text.trim().is_empty() {
            warn!("refusing to speak empty text");
            self.set_status(SessionStatus::Failed, Some("no text to speak".into()));
            return Err(TonecastError::EmptyText);
        }
        if let Err(e) = self.config.validate() {
            self.set_status(SessionStatus::Failed, Some(e.to_string()));
            return Err(e);
        }

        // The override applies to this call only.
        let voice = channel
            .variable(VOICE_VARIABLE)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.config.voice.clone());

        let span = info_span!("session", voice = %voice);
        let _enter = span.enter();
        info!(chars = text.chars().count(), "session starting");

        self.diagnostics.reset();
        let ring = Arc::new(RingBuffer::new(self.config.buffer_size)?);
        let bridge = Arc::new(SynthesisBridge::new(
            Arc::clone(&ring),
            self.config.audio_format(),
            Arc::clone(&self.diagnostics),
        ));

        let mut saved_format = None;
        let result = self.run_call(channel, text, &voice, &ring, &bridge, &mut saved_format);

        ring.cancel();
        self.engine.close();
        if let Some(previous) = saved_format {
            if let Err(e) = channel.set_write_format(previous) {
                warn!(error = %e, format = ?previous, "failed to restore write format");
            }
        }

        let snap = self.diagnostics.snapshot();
        info!(
            frames = snap.frames_emitted,
            bytes = snap.bytes_emitted,
            underruns = snap.underruns,
            sink_errors = snap.sink_errors,
            backpressure_waits = snap.backpressure_waits,
            dropped = snap.chunks_dropped,
            late = snap.late_chunks,
            stops = snap.stop_requests,
            "playback diagnostics"
        );

        match result {
            Ok(outcome) => {
                let detail = outcome.hung_up().then(|| "caller hung up".to_string());
                self.set_status(SessionStatus::Finished, detail);
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "session failed");
                self.set_status(SessionStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn run_call(
        &mut self,
        channel: &mut dyn CallChannel,
        text: &str,
        voice: &str,
        ring: &RingBuffer,
        bridge: &Arc<SynthesisBridge>,
        saved_format: &mut Option<WriteFormat>,
    ) -> Result<SessionOutcome> {
        self.engine.open(voice)?;
        let sink: Arc<dyn SynthesisSink> = Arc::clone(bridge) as Arc<dyn SynthesisSink>;
        self.engine.speak(text, sink)?;

        if !channel.is_up() {
            info!("answering channel");
            channel.answer()?;
        }
        *saved_format = Some(channel.set_write_format(WriteFormat::Ulaw)?);

        self.set_status(SessionStatus::Speaking, None);
        let watcher = InterruptWatcher::new(&self.config);
        let pump = PlaybackPump::new(
            ring,
            self.config.audio_format(),
            self.clock.as_ref(),
            &self.diagnostics,
            self.config.startup_delay(),
        );
        let exit = pump.run(channel, &mut *self.engine, &watcher)?;

        if let Some(fault) = bridge.take_internal_fault() {
            return Err(fault);
        }

        let collected = match exit {
            PumpExit::Hangup => {
                info!("caller hung up during playback");
                None
            }
            PumpExit::Digit(first) => {
                self.set_status(SessionStatus::CollectingDigits, Some("interrupted".into()));
                watcher.finish_interrupted(channel, first)
            }
            PumpExit::Drained if watcher.collects_digits() => {
                self.set_status(SessionStatus::CollectingDigits, None);
                watcher.collect_after_playback(channel)
            }
            PumpExit::Drained => None,
        };

        let hung_up =
            exit == PumpExit::Hangup || collected.as_ref().is_some_and(|c| c.hangup);
        let result = if hung_up {
            CallResult::Hangup
        } else {
            CallResult::Completed
        };

        let routed_extension = match (&collected, result) {
            (Some(c), CallResult::Completed) if self.config.goto_extension => {
                route(channel, c)
            }
            _ => None,
        };

        Ok(SessionOutcome {
            result,
            digits: collected.map(|c| c.digits),
            routed_extension,
            synthesis_fault: bridge.fault(),
            diagnostics: self.diagnostics.snapshot(),
        })
    }

    fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        // No subscribers is fine.
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }
}

/// Send the call to the extension the caller keyed in, if it exists.
fn route(channel: &mut dyn CallChannel, collected: &Collected) -> Option<String> {
    let extension = collected.digits.as_str();
    if extension.is_empty() {
        return None;
    }
    if channel.extension_exists(extension) {
        info!(extension, "routing call to collected extension");
        channel.goto_extension(extension);
        Some(extension.to_string())
    } else {
        info!(extension, "collected digits name no extension; not routing");
        None
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::clock::ManualClock;
    use crate::synthesis::ScriptedEngine;
    use crate::telephony::{LoopbackChannel, ScriptedInbound};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Session and channel sharing one simulated clock.
    fn call(config: SessionConfig, engine: ScriptedEngine) -> (Session, LoopbackChannel) {
        let clock = ManualClock::shared();
        let session = Session::new(config, Box::new(engine), clock.clone());
        (session, LoopbackChannel::new(clock))
    }

    #[test]
    fn empty_text_is_rejected_before_opening() {
        let engine = ScriptedEngine::new(vec![]);
        let probe = engine.probe();
        let (mut session, mut channel) = call(SessionConfig::default(), engine);

        let err = session.play(&mut channel, "   ").unwrap_err();
        assert!(matches!(err, TonecastError::EmptyText));
        assert!(probe.voice().is_none());
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            frame_bytes: 0,
            ..SessionConfig::default()
        };
        let (mut session, mut channel) = call(config, ScriptedEngine::new(vec![]));
        assert!(matches!(
            session.play(&mut channel, "hi"),
            Err(TonecastError::InvalidConfig(_))
        ));
    }

    #[test]
    fn voice_override_comes_from_channel() {
        let engine = ScriptedEngine::speaking(160, 160).with_inline_delivery();
        let probe = engine.probe();
        let (mut session, channel) = call(SessionConfig::default(), engine);
        let mut channel = channel.with_variable(VOICE_VARIABLE, "Callie-8kHz");

        session.play(&mut channel, "hello").unwrap();
        assert_eq!(probe.voice().as_deref(), Some("Callie-8kHz"));
        assert_eq!(session.config().voice, "Allison-8kHz");
    }

    #[test]
    fn ringing_channel_is_answered_and_format_restored() {
        let clock = ManualClock::shared();
        let engine = ScriptedEngine::speaking(320, 160).with_inline_delivery();
        let mut session = Session::new(SessionConfig::default(), Box::new(engine), clock.clone());
        let mut channel = LoopbackChannel::new(clock)
            .ringing()
            .with_write_format(WriteFormat::Alaw);
        let probe = channel.probe();

        let outcome = session.play(&mut channel, "hello").unwrap();
        assert_eq!(outcome.result, CallResult::Completed);
        assert!(probe.answered());
        assert_eq!(
            probe.format_history(),
            vec![WriteFormat::Ulaw, WriteFormat::Alaw]
        );
        assert_eq!(outcome.diagnostics.frames_emitted, 2);
    }

    #[test]
    fn status_events_trace_the_call() {
        let engine = ScriptedEngine::speaking(160, 160).with_inline_delivery();
        let (mut session, mut channel) = call(SessionConfig::default(), engine);
        let mut rx = session.subscribe_status();

        session.play(&mut channel, "hello").unwrap();

        assert_eq!(rx.try_recv().unwrap().status, SessionStatus::Speaking);
        assert_eq!(rx.try_recv().unwrap().status, SessionStatus::Finished);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn routes_to_existing_extension() {
        let clock = ManualClock::shared();
        let config = SessionConfig {
            goto_extension: true,
            dtmf_timeout_ms: 500,
            max_digits: 3,
            ..SessionConfig::default()
        };
        let engine = ScriptedEngine::speaking(160, 160).with_inline_delivery();
        let mut session = Session::new(config, Box::new(engine), clock.clone());
        let mut channel = LoopbackChannel::new(clock)
            .with_extension("42")
            .at(ms(300), ScriptedInbound::dtmf('4'))
            .at(ms(400), ScriptedInbound::dtmf('2'));
        let probe = channel.probe();

        let outcome = session.play(&mut channel, "press two digits").unwrap();
        assert_eq!(outcome.digits.as_deref(), Some("42"));
        assert_eq!(outcome.routed_extension.as_deref(), Some("42"));
        assert_eq!(probe.routed_to().as_deref(), Some("42"));
    }

    #[test]
    fn unknown_extension_is_not_routed() {
        let clock = ManualClock::shared();
        let config = SessionConfig {
            goto_extension: true,
            dtmf_timeout_ms: 500,
            max_digits: 1,
            ..SessionConfig::default()
        };
        let engine = ScriptedEngine::speaking(160, 160).with_inline_delivery();
        let mut session = Session::new(config, Box::new(engine), clock.clone());
        let mut channel = LoopbackChannel::new(clock).at(ms(300), ScriptedInbound::dtmf('7'));
        let probe = channel.probe();

        let outcome = session.play(&mut channel, "hello").unwrap();
        assert_eq!(outcome.digits.as_deref(), Some("7"));
        assert!(outcome.routed_extension.is_none());
        assert!(probe.routed_to().is_none());
    }
}
