//! Continuous single-PID sampling ("scope") and raw CAN bus monitoring.
//!
//! At most one such loop runs per engine. Both are stopped through the same
//! watch channel and both put the adapter back to headers/spaces off.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{decode_pid_response, ProtocolEngine, AT_TIMEOUT, BROADCAST_ADDRESS};
use crate::error::ObdError;
use crate::pid::{registry, PidDefinition};
use crate::transport::COMMAND_TIMEOUT;

/// STPX response timeout, in adapter milliseconds
const FAST_EXECUTE_TIMEOUT_MS: u32 = 200;
const FAST_EXECUTE_TIMEOUT: Duration = Duration::from_millis(200);
/// Pause after a failed sample so a dead link does not spin
const SAMPLE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// First read after `STMA`; the monitor never prompts
const MONITOR_START_TIMEOUT: Duration = Duration::from_millis(200);
const MONITOR_POLL_WINDOW: Duration = Duration::from_millis(100);

/// One decoded scope value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSample {
    /// Milliseconds since the loop started
    pub timestamp_ms: u64,
    pub value: f64,
}

type LoopSlot = Mutex<Option<watch::Sender<bool>>>;

/// Clears the loop slot when the loop exits, however it exits.
struct LoopGuard<'a> {
    slot: &'a LoopSlot,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

fn lock(slot: &LoopSlot) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `STPX` single-request command
pub fn stpx_command(header: u16, data: &str, responses: u8, timeout_ms: u32) -> String {
    format!("STPX H:{header:03X}, D:{data}, R:{responses}, T:{timeout_ms}")
}

impl ProtocolEngine {
    fn begin_loop(&self) -> Result<(LoopGuard<'_>, watch::Receiver<bool>), ObdError> {
        let mut slot = lock(&self.loop_slot);
        if slot.is_some() {
            return Err(ObdError::ScopeAlreadyRunning);
        }
        let (tx, rx) = watch::channel(false);
        *slot = Some(tx);
        Ok((LoopGuard { slot: &self.loop_slot }, rx))
    }

    /// True while a scope or monitor loop is active.
    pub fn is_loop_running(&self) -> bool {
        lock(&self.loop_slot).is_some()
    }

    /// Ask the running scope (or monitor) loop to stop after the current
    /// iteration. No-op when nothing runs.
    pub fn stop_scope(&self) {
        if let Some(tx) = lock(&self.loop_slot).as_ref() {
            tx.send_replace(true);
        }
    }

    pub fn stop_can_monitor(&self) {
        self.stop_scope();
    }

    /// Sample one PID repeatedly until [`stop_scope`](Self::stop_scope).
    ///
    /// `target_hz` of 0 means as fast as the adapter answers. Individual
    /// sample failures are skipped; only a lost connection ends the loop
    /// with an error.
    pub async fn start_scope<F>(&self, pid: &str, mut on_sample: F, target_hz: u32) -> Result<(), ObdError>
    where
        F: FnMut(ScopeSample) + Send,
    {
        let def = registry()
            .resolve(pid)
            .ok_or_else(|| ObdError::UnknownPid(pid.to_string()))?;
        let (_guard, mut stop) = self.begin_loop()?;

        let fast = self.capabilities().supports_fast_execute;
        let budget = (target_hz > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(target_hz)));
        info!(pid = def.name, fast, target_hz, "Scope started");

        let started = Instant::now();
        let mut samples: u64 = 0;
        let outcome = loop {
            if *stop.borrow() {
                break Ok(());
            }

            let iteration = Instant::now();
            let mut pause = None;
            match self.scope_sample(def, fast).await {
                Ok(Some(value)) => {
                    samples += 1;
                    on_sample(ScopeSample {
                        timestamp_ms: started.elapsed().as_millis() as u64,
                        value,
                    });
                }
                Ok(None) => {}
                Err(ObdError::NotConnected) => break Err(ObdError::NotConnected),
                Err(e) => {
                    debug!("Scope sample failed: {}", e);
                    pause = Some(SAMPLE_ERROR_BACKOFF);
                }
            }

            if let Some(budget) = budget {
                let elapsed = iteration.elapsed();
                if elapsed < budget {
                    pause = Some(pause.map_or(budget - elapsed, |p| p.max(budget - elapsed)));
                }
            }
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop.changed() => {}
                }
            }
        };

        self.restore_display().await;
        info!(samples, "Scope stopped");
        outcome
    }

    async fn scope_sample(&self, def: &PidDefinition, fast: bool) -> Result<Option<f64>, ObdError> {
        let response = if fast {
            let command = stpx_command(
                BROADCAST_ADDRESS,
                &format!("01{:02X}", def.pid),
                1,
                FAST_EXECUTE_TIMEOUT_MS,
            );
            self.command(&command, FAST_EXECUTE_TIMEOUT).await?
        } else {
            self.command(&def.command(), COMMAND_TIMEOUT).await?
        };
        Ok(decode_pid_response(&response, def).map(|r| r.value))
    }

    /// Stream raw bus frames (one text line each) until
    /// [`stop_can_monitor`](Self::stop_can_monitor).
    pub async fn start_can_monitor<F>(&self, mut on_frame: F) -> Result<(), ObdError>
    where
        F: FnMut(&str) + Send,
    {
        if !self.capabilities().supports_bus_monitor {
            return Err(ObdError::Unsupported("bus monitor"));
        }
        let (_guard, stop) = self.begin_loop()?;
        info!("CAN monitor started");

        let mut frames: u64 = 0;
        let outcome = self.run_monitor(&mut on_frame, &mut frames, stop).await;

        // Any byte ends the monitor
        if let Err(e) = self.conn.interrupt(AT_TIMEOUT).await {
            warn!("Could not stop bus monitor: {}", e);
        }
        self.restore_display().await;
        info!(frames, "CAN monitor stopped");
        outcome
    }

    async fn run_monitor<F>(
        &self,
        on_frame: &mut F,
        frames: &mut u64,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ObdError>
    where
        F: FnMut(&str) + Send,
    {
        self.command("ATH1", AT_TIMEOUT).await?;
        self.command("ATS1", AT_TIMEOUT).await?;

        let mut emit = |text: &str| {
            for line in text.split(['\r', '\n']).map(str::trim) {
                if line.is_empty() || line == ">" {
                    continue;
                }
                *frames += 1;
                on_frame(line);
            }
        };

        emit(&self.command("STMA", MONITOR_START_TIMEOUT).await?);
        while !*stop.borrow() {
            emit(&self.conn.read_pending(MONITOR_POLL_WINDOW).await?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::super::tests::engine_with;
    use super::*;
    use crate::engine::AdapterCapabilities;
    use crate::mock::MockAdapter;

    #[test]
    fn test_stpx_format() {
        assert_eq!(stpx_command(0x7DF, "010C", 1, 200), "STPX H:7DF, D:010C, R:1, T:200");
    }

    #[tokio::test]
    async fn test_stop_from_callback_ends_after_one_sample() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        let engine = Arc::new(engine_with(&adapter).await);

        let mut samples = Vec::new();
        let stopper = engine.clone();
        engine
            .start_scope(
                "RPM",
                |sample| {
                    samples.push(sample);
                    stopper.stop_scope();
                },
                0,
            )
            .await
            .unwrap();

        assert_eq!(samples.len(), 1);
        assert!((samples[0].value - 1726.0).abs() < 0.01);
        assert_eq!(adapter.count("010C"), 1);
        assert_eq!(adapter.count("ATH0"), 1);
        assert_eq!(adapter.count("ATS0"), 1);
        assert!(!engine.is_loop_running());
    }

    #[tokio::test]
    async fn test_second_loop_is_rejected() {
        let adapter = MockAdapter::new();
        adapter.respond("010D", "410D32");
        let engine = Arc::new(engine_with(&adapter).await);

        let seen = Arc::new(AtomicUsize::new(0));
        let task = {
            let engine = engine.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                engine
                    .start_scope("SPEED", move |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }, 50)
                    .await
            })
        };

        while seen.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(engine.is_loop_running());
        assert!(matches!(
            engine.start_scope("RPM", |_| {}, 0).await,
            Err(ObdError::ScopeAlreadyRunning)
        ));

        engine.stop_scope();
        task.await.unwrap().unwrap();
        assert!(!engine.is_loop_running());
        assert_eq!(adapter.count("ATH0"), 1);
    }

    #[tokio::test]
    async fn test_unknown_pid_does_not_claim_the_slot() {
        let adapter = MockAdapter::new();
        let engine = engine_with(&adapter).await;

        assert!(matches!(
            engine.start_scope("NOT_A_PID", |_| {}, 0).await,
            Err(ObdError::UnknownPid(_))
        ));
        assert!(!engine.is_loop_running());
        assert!(adapter.commands().is_empty());
    }

    #[tokio::test]
    async fn test_fast_execute_path() {
        let adapter = MockAdapter::new();
        adapter.respond("STPX H:7DF, D:010C, R:1, T:200", "410C1AF8");
        let engine = Arc::new(engine_with(&adapter).await);
        engine.set_capabilities(AdapterCapabilities {
            is_vendor_extended: true,
            supports_fast_execute: true,
            ..AdapterCapabilities::default()
        });

        let stopper = engine.clone();
        let mut count = 0;
        engine
            .start_scope("0C", |_| {
                count += 1;
                stopper.stop_scope();
            }, 0)
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(adapter.count("010C"), 0);
    }

    #[tokio::test]
    async fn test_monitor_requires_support() {
        let adapter = MockAdapter::new();
        let engine = engine_with(&adapter).await;
        assert!(matches!(
            engine.start_can_monitor(|_| {}).await,
            Err(ObdError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_forwards_frames_and_restores() {
        let adapter = MockAdapter::new();
        adapter.respond_without_prompt("STMA", "7E8 03 41 0D 32\n7E8 03 41 0D 33");
        let engine = Arc::new(engine_with(&adapter).await);
        engine.set_capabilities(AdapterCapabilities {
            is_vendor_extended: true,
            supports_bus_monitor: true,
            ..AdapterCapabilities::default()
        });

        let stopper = engine.clone();
        let mut frames = Vec::new();
        engine
            .start_can_monitor(|frame| {
                frames.push(frame.to_string());
                stopper.stop_can_monitor();
            })
            .await
            .unwrap();

        assert_eq!(frames, vec!["7E8 03 41 0D 32", "7E8 03 41 0D 33"]);
        let commands = adapter.commands();
        assert_eq!(commands, vec!["ATH1", "ATS1", "STMA", "", "ATH0", "ATS0"]);
        assert!(!adapter.headers_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_on_busy_bus_still_restores() {
        let adapter = MockAdapter::new();
        adapter.respond_streaming("STMA", "7E8 03 41 0D 32");
        let engine = Arc::new(engine_with(&adapter).await);
        engine.set_capabilities(AdapterCapabilities {
            is_vendor_extended: true,
            supports_bus_monitor: true,
            ..AdapterCapabilities::default()
        });

        let stopper = engine.clone();
        let mut frames = Vec::new();
        let run = engine.start_can_monitor(|frame| {
            frames.push(frame.to_string());
            stopper.stop_can_monitor();
        });
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("monitor never stopped")
            .unwrap();

        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f == "7E8 03 41 0D 32"));
        assert_eq!(adapter.commands(), vec!["ATH1", "ATS1", "STMA", "", "ATH0", "ATS0"]);
        assert!(!adapter.headers_enabled());
        assert!(!adapter.spaces_enabled());
        assert!(!engine.is_loop_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_hz_spaces_samples() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        let engine = Arc::new(engine_with(&adapter).await);

        let samples = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let engine = engine.clone();
            let samples = samples.clone();
            tokio::spawn(async move {
                engine
                    .start_scope("RPM", move |sample| {
                        samples.lock().unwrap().push(sample);
                    }, 10)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(1050)).await;
        engine.stop_scope();
        task.await.unwrap().unwrap();

        let samples = samples.lock().unwrap();
        assert!((10..=11).contains(&samples.len()), "{} samples", samples.len());
        for pair in samples.windows(2) {
            assert!(pair[1].timestamp_ms - pair[0].timestamp_ms >= 99, "{pair:?}");
        }
    }

    #[tokio::test]
    async fn test_failed_sample_does_not_end_scope() {
        let adapter = MockAdapter::new();
        adapter.respond_once("010C", "NO DATA");
        adapter.respond("010C", "410C1AF8");
        let engine = Arc::new(engine_with(&adapter).await);

        let stopper = engine.clone();
        let mut samples = Vec::new();
        engine
            .start_scope("RPM", |sample| {
                samples.push(sample);
                stopper.stop_scope();
            }, 0)
            .await
            .unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(adapter.count("010C"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_ends_when_link_drops() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let conn = Arc::new(crate::transport::Connection::from_stream(
            crate::transport::TransportKind::Tcp,
            client,
        ));
        let engine = ProtocolEngine::new(conn.clone());

        let run = engine.start_scope("RPM", |_| {}, 0);
        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("scope kept retrying a dead link");

        assert!(matches!(outcome, Err(ObdError::NotConnected)));
        assert!(!conn.is_connected());
        assert!(!engine.is_loop_running());
    }
}
