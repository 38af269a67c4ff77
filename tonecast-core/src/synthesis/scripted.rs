//! `ScriptedEngine` — replays a fixed list of synthesis events from its own
//! thread.
//!
//! Stands in for a real TTS backend in the simulator binary and in tests.
//! Events are delivered on a dedicated worker thread, so the bridge sees the
//! same foreign-thread callbacks a real engine produces. `stop_now` and
//! `close` reach the worker through a crossbeam channel that doubles as its
//! pacing timer.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{SynthesisEngine, SynthesisEvent, SynthesisFault, SynthesisSink};
use crate::error::{Result, TonecastError};

/// μ-law encoding of a zero sample.
const ULAW_SILENCE: u8 = 0xFF;

/// One scripted callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Audio(Vec<u8>),
    End,
    Error(SynthesisFault),
    Unknown(u32),
    /// Hold the worker for a while (simulates a slow engine).
    Pause(Duration),
}

/// Shared view of what the engine was asked to do.
#[derive(Debug, Clone, Default)]
pub struct EngineProbe {
    stops: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    voice: Arc<Mutex<Option<String>>>,
    text: Arc<Mutex<Option<String>>>,
}

impl EngineProbe {
    pub fn stop_requests(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn voice(&self) -> Option<String> {
        self.voice.lock().clone()
    }

    pub fn text(&self) -> Option<String> {
        self.text.lock().clone()
    }
}

pub struct ScriptedEngine {
    script: Vec<ScriptStep>,
    step_interval: Duration,
    open_failure: Option<String>,
    voices: Option<Vec<String>>,
    failing_stop: bool,
    inline: bool,
    opened: bool,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    probe: EngineProbe,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            step_interval: Duration::ZERO,
            open_failure: None,
            voices: None,
            failing_stop: false,
            inline: false,
            opened: false,
            stop_tx: None,
            worker: None,
            probe: EngineProbe::default(),
        }
    }

    /// `total_bytes` of μ-law audio in `chunk_bytes` callbacks, then `End`.
    pub fn speaking(total_bytes: usize, chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        let mut script: Vec<ScriptStep> = (0..total_bytes)
            .step_by(chunk_bytes)
            .map(|start| {
                let len = chunk_bytes.min(total_bytes - start);
                ScriptStep::Audio(vec![ULAW_SILENCE; len])
            })
            .collect();
        script.push(ScriptStep::End);
        Self::new(script)
    }

    /// Delay before each step.
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    /// Make `open` fail as if the engine could not be reached.
    pub fn with_open_failure(mut self, reason: impl Into<String>) -> Self {
        self.open_failure = Some(reason.into());
        self
    }

    /// Restrict the voices `open` accepts.
    pub fn with_voices(mut self, voices: &[&str]) -> Self {
        self.voices = Some(voices.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Make every `stop_now` report failure.
    pub fn with_failing_stop(mut self) -> Self {
        self.failing_stop = true;
        self
    }

    /// Deliver the whole script from inside `speak`, on the caller's thread.
    /// Pauses are skipped. The script's audio must fit the ring, since
    /// nothing drains it until `speak` returns.
    pub fn with_inline_delivery(mut self) -> Self {
        self.inline = true;
        self
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }
}

fn deliver_step(sink: &dyn SynthesisSink, step: &ScriptStep) {
    match step {
        ScriptStep::Audio(bytes) => sink.deliver(SynthesisEvent::Audio(bytes)),
        ScriptStep::End => sink.deliver(SynthesisEvent::End),
        ScriptStep::Error(fault) => sink.deliver(SynthesisEvent::Error(fault)),
        ScriptStep::Unknown(code) => sink.deliver(SynthesisEvent::Unknown(*code)),
        ScriptStep::Pause(_) => {}
    }
}

/// Wait up to `interval` for a stop signal. Returns `true` if the worker
/// should stop.
fn stopped_within(stop_rx: &Receiver<()>, interval: Duration) -> bool {
    if interval.is_zero() {
        return !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty));
    }
    !matches!(stop_rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
}

impl SynthesisEngine for ScriptedEngine {
    fn open(&mut self, voice: &str) -> Result<()> {
        if let Some(reason) = &self.open_failure {
            return Err(TonecastError::EngineUnavailable(reason.clone()));
        }
        if let Some(voices) = &self.voices {
            if !voices.iter().any(|v| v == voice) {
                return Err(TonecastError::VoiceUnavailable(voice.to_string()));
            }
        }
        *self.probe.voice.lock() = Some(voice.to_string());
        self.opened = true;
        debug!(voice, "scripted engine opened");
        Ok(())
    }

    fn speak(&mut self, text: &str, sink: Arc<dyn SynthesisSink>) -> Result<()> {
        if !self.opened {
            return Err(TonecastError::SpeakFailed("engine not open".into()));
        }
        *self.probe.text.lock() = Some(text.to_string());

        let script = std::mem::take(&mut self.script);
        if self.inline {
            for step in &script {
                deliver_step(sink.as_ref(), step);
            }
            return Ok(());
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = self.step_interval;

        let worker = thread::Builder::new()
            .name("tonecast-synth".into())
            .spawn(move || {
                for step in script {
                    if stopped_within(&stop_rx, interval) {
                        debug!("scripted synthesis stopped");
                        return;
                    }
                    if let ScriptStep::Pause(pause) = &step {
                        if stopped_within(&stop_rx, *pause) {
                            debug!("scripted synthesis stopped during pause");
                            return;
                        }
                        continue;
                    }
                    deliver_step(sink.as_ref(), &step);
                }
            })
            .map_err(|e| TonecastError::SpeakFailed(e.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop_now(&mut self) -> Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.try_send(());
        }
        if self.failing_stop {
            return Err(TonecastError::Other(anyhow::anyhow!(
                "scripted engine refused to stop"
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender disconnects the worker's stop channel.
        self.stop_tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("scripted synthesis worker panicked");
            }
        }
        if self.opened {
            info!("scripted engine closed");
        }
        self.opened = false;
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.close();
        }
    }
}
