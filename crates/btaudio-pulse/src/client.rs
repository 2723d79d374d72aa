//! The PulseAudio client: sink enumeration, card profiles, suspend.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use btaudio_core::{Address, AudioProfile, Error, Result, SinkState};

use crate::parse::parse_sinks;

/// Socket paths probed when `PULSE_SERVER` is not set, in order.
const FALLBACK_SERVERS: &[&str] = &["unix:/run/audio/pulse.sock", "unix:/run/audio/native"];

/// Profile names tried per audio profile. PulseAudio and PipeWire
/// disagree on hyphens, so both spellings are attempted.
const A2DP_PROFILES: &[&str] = &["a2dp_sink", "a2dp-sink"];
const HFP_PROFILES: &[&str] = &[
    "handsfree_head_unit",
    "handsfree-head-unit",
    "headset_head_unit",
    "headset-head-unit",
];

const SINK_WAIT_POLL: Duration = Duration::from_secs(1);

/// One Bluetooth sink as seen by the daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkInfo {
    pub name: String,
    pub state: SinkState,
    pub volume_pct: u32,
    pub mute: bool,
}

impl SinkInfo {
    /// The device this sink belongs to, derived from its name.
    pub fn address(&self) -> Option<Address> {
        Address::from_sink_name(&self.name)
    }
}

/// Client handle; cheap to clone.
#[derive(Clone)]
pub struct PulseClient {
    /// Resolved server address; `None` uses pactl's default socket.
    server: Option<String>,
}

impl PulseClient {
    /// Resolve the server and verify it answers.
    ///
    /// Order: `PULSE_SERVER`, the known socket paths, the default
    /// native socket. Fails with `PulseUnavailable` when nothing
    /// answers.
    pub async fn connect() -> Result<Self> {
        if let Ok(server) = std::env::var("PULSE_SERVER") {
            let client = Self {
                server: Some(server.clone()),
            };
            if client.ping().await {
                info!(server, "connected to PulseAudio via PULSE_SERVER");
                return Ok(client);
            }
            return Err(Error::PulseUnavailable(format!(
                "PULSE_SERVER={server} did not answer"
            )));
        }
        for server in FALLBACK_SERVERS {
            let client = Self {
                server: Some((*server).to_string()),
            };
            if client.ping().await {
                info!(server, "connected to PulseAudio");
                return Ok(client);
            }
            debug!(server, "PulseAudio not reachable");
        }
        let client = Self { server: None };
        if client.ping().await {
            info!("connected to PulseAudio via default socket");
            return Ok(client);
        }
        Err(Error::PulseUnavailable(
            "no PulseAudio server at PULSE_SERVER or any known socket path".into(),
        ))
    }

    /// The resolved server address, if not the default socket.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub(crate) fn pactl(&self) -> Command {
        let mut cmd = Command::new("pactl");
        if let Some(server) = &self.server {
            cmd.env("PULSE_SERVER", server);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn ping(&self) -> bool {
        match self.pactl().arg("info").output().await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    async fn run_pactl(&self, args: &[&str]) -> Result<std::process::Output> {
        self.pactl()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::PulseUnavailable(format!("pactl: {e}")))
    }

    /// All Bluetooth sinks currently known to the server.
    pub async fn list_bt_sinks(&self) -> Result<Vec<SinkInfo>> {
        let out = self.run_pactl(&["list", "sinks"]).await?;
        if !out.status.success() {
            return Err(Error::PulseUnavailable(format!(
                "pactl list sinks: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(parse_sinks(&text)
            .into_iter()
            .filter(|s| s.name.to_ascii_lowercase().contains("bluez"))
            .collect())
    }

    /// The sink for a device, if one exists right now.
    pub async fn sink_for_address(&self, address: &Address) -> Result<Option<SinkInfo>> {
        Ok(self
            .list_bt_sinks()
            .await?
            .into_iter()
            .find(|s| address.matches_sink_name(&s.name)))
    }

    /// Wait for a device's sink to appear, polling once a second.
    pub async fn wait_for_sink(&self, address: &Address, wait: Duration) -> Result<SinkInfo> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(sink) = self.sink_for_address(address).await? {
                info!(sink = %sink.name, "sink ready");
                return Ok(sink);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::SinkTimeout {
                    address: address.to_string(),
                    timeout_s: wait.as_secs(),
                });
            }
            tokio::time::sleep(SINK_WAIT_POLL).await;
        }
    }

    /// Switch a device's card to the requested profile, trying each
    /// known profile name until one sticks. For A2DP a final
    /// `off → profile` cycle forces sink recreation; for HFP that would
    /// destroy the card, so it fails fast instead.
    pub async fn set_card_profile(&self, address: &Address, profile: AudioProfile) -> bool {
        let card = format!("bluez_card.{}", address.underscored());
        let candidates = match profile {
            AudioProfile::A2dp => A2DP_PROFILES,
            AudioProfile::Hfp => HFP_PROFILES,
        };
        for name in candidates {
            if self.try_set_profile(&card, name).await {
                info!(%card, profile = name, "card profile set");
                return true;
            }
        }
        if profile == AudioProfile::A2dp {
            info!(%card, "cycling card profile off -> a2dp");
            let _ = self.try_set_profile(&card, "off").await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            for name in candidates {
                if self.try_set_profile(&card, name).await {
                    info!(%card, profile = name, "card profile set after cycle");
                    return true;
                }
            }
        }
        warn!(%card, profile = profile.label(), "card profile activation failed");
        false
    }

    async fn try_set_profile(&self, card: &str, profile: &str) -> bool {
        match self
            .run_pactl(&["set-card-profile", card, profile])
            .await
        {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                debug!(
                    card,
                    profile,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "set-card-profile failed"
                );
                false
            }
            Err(e) => {
                debug!(card, profile, %e, "pactl unavailable");
                false
            }
        }
    }

    /// Suspend a sink, releasing its A2DP transport.
    pub async fn suspend_sink(&self, sink_name: &str) -> Result<()> {
        let out = self.run_pactl(&["suspend-sink", sink_name, "1"]).await?;
        if out.status.success() {
            info!(sink = sink_name, "sink suspended");
            Ok(())
        } else {
            Err(Error::PulseUnavailable(format!(
                "suspend-sink {sink_name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    /// Resume a previously suspended sink.
    pub async fn resume_sink(&self, sink_name: &str) -> Result<()> {
        let out = self.run_pactl(&["suspend-sink", sink_name, "0"]).await?;
        if out.status.success() {
            info!(sink = sink_name, "sink resumed");
            Ok(())
        } else {
            Err(Error::PulseUnavailable(format!(
                "resume sink {sink_name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    /// Reload `module-bluez5-discover`, forcing the server to
    /// re-register its Bluetooth handlers with BlueZ. Last rung of the
    /// profile-activation ladder.
    pub async fn reload_bluetooth_module(&self) -> Result<()> {
        let out = self.run_pactl(&["list", "modules", "short"]).await?;
        let text = String::from_utf8_lossy(&out.stdout);
        let index = text
            .lines()
            .find(|line| line.contains("module-bluez5-discover"))
            .and_then(|line| line.split_whitespace().next())
            .map(str::to_string);
        let Some(index) = index else {
            return Err(Error::PulseUnavailable(
                "module-bluez5-discover is not loaded".into(),
            ));
        };
        let _ = self.run_pactl(&["unload-module", &index]).await?;
        info!(index, "unloaded module-bluez5-discover");
        tokio::time::sleep(Duration::from_secs(2)).await;
        let out = self
            .run_pactl(&["load-module", "module-bluez5-discover"])
            .await?;
        if out.status.success() {
            info!("reloaded module-bluez5-discover");
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        } else {
            Err(Error::PulseUnavailable(format!(
                "load-module module-bluez5-discover: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    /// Set sink volume. On Bluetooth sinks this propagates to AVRCP
    /// absolute volume, changing the speaker's own level.
    pub async fn set_sink_volume(&self, sink_name: &str, pct: u8) -> Result<()> {
        let vol = format!("{}%", pct.min(100));
        let out = self
            .run_pactl(&["set-sink-volume", sink_name, &vol])
            .await?;
        if out.status.success() {
            info!(sink = sink_name, volume = %vol, "sink volume set");
            Ok(())
        } else {
            Err(Error::PulseUnavailable(format!(
                "set-sink-volume {sink_name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_info_maps_back_to_address() {
        let sink = SinkInfo {
            name: "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink".into(),
            state: SinkState::Running,
            volume_pct: 50,
            mute: false,
        };
        assert_eq!(
            sink.address().unwrap().to_string(),
            "AA:BB:CC:DD:EE:01"
        );
    }

    #[tokio::test]
    #[ignore = "requires a running PulseAudio server"]
    async fn connect_and_list() {
        let client = PulseClient::connect().await.unwrap();
        let _ = client.list_bt_sinks().await.unwrap();
    }
}
