//! Keep-alive audio bursts.
//!
//! Many speakers power down after 30–120 s of silence. This task wakes
//! every five seconds and pipes about one second of inaudible audio to
//! the device's sink through a short-lived `pacat` invocation.
//!
//! The infrasound method (2 Hz sine, −50 dB) defeats the digital-silence
//! detection some speakers apply to plain zeros.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use btaudio_core::KeepAliveMethod;

const SAMPLE_RATE: u32 = 44_100;
const CHANNELS: u32 = 1;
const BURST_SECONDS: f64 = 1.0;
const TICK: Duration = Duration::from_secs(5);
/// Interval after three consecutive spawn failures.
const DEGRADED_TICK: Duration = Duration::from_secs(30);
const FAILURES_BEFORE_DEGRADE: u32 = 3;
/// How long `stop()` waits for an in-flight pacat.
const STOP_GRACE: Duration = Duration::from_secs(2);

const INFRASOUND_FREQ: f64 = 2.0;
const INFRASOUND_AMPLITUDE: f64 = 100.0;

/// One keep-alive task per device; exists only while the device is
/// connected and its idle mode demands it.
pub struct KeepAlive {
    sink: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Start the burst loop against `sink`.
    pub fn start(sink: String, method: KeepAliveMethod, server: Option<String>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sink_name = sink.clone();
        let handle = tokio::spawn(async move {
            burst_loop(sink_name, method, server, token).await;
        });
        info!(sink = %sink, ?method, "keep-alive started");
        Self {
            sink,
            cancel,
            handle,
        }
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    /// Cancel the loop and wait briefly for any in-flight process.
    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, self.handle).await.is_err() {
            warn!(sink = %self.sink, "keep-alive did not stop within grace, abandoning");
        } else {
            info!(sink = %self.sink, "keep-alive stopped");
        }
    }
}

async fn burst_loop(
    sink: String,
    method: KeepAliveMethod,
    server: Option<String>,
    cancel: CancellationToken,
) {
    let pcm = generate_pcm(method);
    let mut consecutive_failures = 0u32;
    loop {
        // bound the burst so a wedged pacat cannot pin the loop
        let result = match tokio::time::timeout(TICK, play_burst(&sink, &server, &pcm)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::other("pacat burst timed out")),
        };
        match result {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    sink = %sink,
                    failures = consecutive_failures,
                    error = %e,
                    "keep-alive burst failed"
                );
            }
        }
        let tick = if consecutive_failures >= FAILURES_BEFORE_DEGRADE {
            DEGRADED_TICK
        } else {
            TICK
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(sink = %sink, "keep-alive loop cancelled");
                return;
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

async fn play_burst(sink: &str, server: &Option<String>, pcm: &[u8]) -> std::io::Result<()> {
    let mut cmd = Command::new("pacat");
    if let Some(server) = server {
        cmd.env("PULSE_SERVER", server);
    }
    let mut child = cmd
        .arg("--device")
        .arg(sink)
        .arg("--format=s16le")
        .arg(format!("--rate={SAMPLE_RATE}"))
        .arg(format!("--channels={CHANNELS}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("no stdin on pacat"))?;
    stdin.write_all(pcm).await?;
    drop(stdin);
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("pacat exited with {status}")))
    }
}

fn generate_pcm(method: KeepAliveMethod) -> Vec<u8> {
    match method {
        KeepAliveMethod::Silence => generate_silence(),
        KeepAliveMethod::Infrasound => generate_infrasound(),
    }
}

/// PCM zeros, one burst worth.
fn generate_silence() -> Vec<u8> {
    let samples = (SAMPLE_RATE as f64 * BURST_SECONDS) as usize;
    vec![0u8; samples * 2]
}

/// A 2 Hz sine at amplitude 100/32767 (about −50 dB). Well below both
/// the hearing threshold and what most drivers can reproduce, but not
/// digitally silent.
fn generate_infrasound() -> Vec<u8> {
    let samples = (SAMPLE_RATE as f64 * BURST_SECONDS) as usize;
    let mut data = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let t = i as f64 / SAMPLE_RATE as f64;
        let value =
            (INFRASOUND_AMPLITUDE * (2.0 * std::f64::consts::PI * INFRASOUND_FREQ * t).sin()) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_all_zeros() {
        let pcm = generate_silence();
        assert_eq!(pcm.len(), SAMPLE_RATE as usize * 2);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn infrasound_is_quiet_but_not_silent() {
        let pcm = generate_infrasound();
        assert_eq!(pcm.len(), SAMPLE_RATE as usize * 2);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 0, "infrasound must not be digital silence");
        assert!(
            peak <= INFRASOUND_AMPLITUDE as u16,
            "amplitude bounded at {INFRASOUND_AMPLITUDE}"
        );
    }

    #[test]
    fn infrasound_completes_whole_cycles() {
        // 2 Hz over 1 s is two full periods: the last sample should be
        // near zero so consecutive bursts do not click.
        let pcm = generate_infrasound();
        let last = i16::from_le_bytes([pcm[pcm.len() - 2], pcm[pcm.len() - 1]]);
        assert!(last.unsigned_abs() < 5);
    }

    #[tokio::test]
    async fn stop_cancels_quickly() {
        let ka = KeepAlive::start(
            "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink".into(),
            KeepAliveMethod::Silence,
            None,
        );
        // the first burst fails fast without a server; stop must not hang
        tokio::time::timeout(Duration::from_secs(3), ka.stop())
            .await
            .expect("stop within grace");
    }
}
