//! MPRIS player object registered with BlueZ.
//!
//! BlueZ forwards AVRCP passthrough commands from a connected speaker
//! as method calls on this object. Every command updates the player's
//! own state, emits the `PropertiesChanged` signal the speaker's
//! display tracks, and forwards a typed command to the coordinator.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::object_server::SignalContext;
use zbus::zvariant::{ObjectPath, Value};

use btaudio_core::{Error, Result};

/// Object path of the exported player.
pub const PLAYER_PATH: &str = "/org/mpris/MediaPlayer2";
/// Well-known name owned for the player.
pub const PLAYER_NAME: &str = "org.mpris.MediaPlayer2.btaudiod";

/// A command a speaker sent through AVRCP.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCommand {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    Seek { offset_us: i64 },
    /// New volume in percent.
    Volume(u8),
}

impl MediaCommand {
    /// The command name as published on the bus (`mpris_event` payload).
    pub fn name(&self) -> &'static str {
        match self {
            MediaCommand::Play => "Play",
            MediaCommand::Pause => "Pause",
            MediaCommand::PlayPause => "PlayPause",
            MediaCommand::Stop => "Stop",
            MediaCommand::Next => "Next",
            MediaCommand::Previous => "Previous",
            MediaCommand::Seek { .. } => "Seek",
            MediaCommand::Volume(_) => "Volume",
        }
    }

    /// Optional detail string for the event payload.
    pub fn detail(&self) -> Option<String> {
        match self {
            MediaCommand::Seek { offset_us } => Some(format!("offset={offset_us}")),
            MediaCommand::Volume(pct) => Some(format!("{pct}%")),
            _ => None,
        }
    }
}

/// What the speaker's display shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Stopped => "Stopped",
        }
    }
}

struct PlayerIface {
    status: PlaybackStatus,
    volume: f64,
    tx: mpsc::UnboundedSender<MediaCommand>,
}

impl PlayerIface {
    fn forward(&self, command: MediaCommand) {
        debug!(command = command.name(), "AVRCP command received");
        if self.tx.send(command).is_err() {
            warn!("media command receiver gone");
        }
    }
}

#[zbus::interface(name = "org.mpris.MediaPlayer2.Player")]
impl PlayerIface {
    async fn play(&mut self, #[zbus(signal_context)] ctxt: SignalContext<'_>) {
        self.status = PlaybackStatus::Playing;
        let _ = self.playback_status_changed(&ctxt).await;
        self.forward(MediaCommand::Play);
    }

    async fn pause(&mut self, #[zbus(signal_context)] ctxt: SignalContext<'_>) {
        self.status = PlaybackStatus::Paused;
        let _ = self.playback_status_changed(&ctxt).await;
        self.forward(MediaCommand::Pause);
    }

    async fn play_pause(&mut self, #[zbus(signal_context)] ctxt: SignalContext<'_>) {
        self.status = if self.status == PlaybackStatus::Playing {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        };
        let _ = self.playback_status_changed(&ctxt).await;
        self.forward(MediaCommand::PlayPause);
    }

    async fn stop(&mut self, #[zbus(signal_context)] ctxt: SignalContext<'_>) {
        self.status = PlaybackStatus::Stopped;
        let _ = self.playback_status_changed(&ctxt).await;
        self.forward(MediaCommand::Stop);
    }

    fn next(&self) {
        self.forward(MediaCommand::Next);
    }

    fn previous(&self) {
        self.forward(MediaCommand::Previous);
    }

    fn seek(&self, offset: i64) {
        self.forward(MediaCommand::Seek { offset_us: offset });
    }

    fn set_position(&self, _track: ObjectPath<'_>, _position: i64) {}

    fn open_uri(&self, _uri: String) {}

    #[zbus(property)]
    fn playback_status(&self) -> String {
        self.status.as_str().to_string()
    }

    #[zbus(property)]
    fn volume(&self) -> f64 {
        self.volume
    }

    #[zbus(property)]
    fn set_volume(&mut self, value: f64) {
        let clamped = value.clamp(0.0, 1.0);
        if (clamped - self.volume).abs() > 0.01 {
            self.volume = clamped;
            self.forward(MediaCommand::Volume((clamped * 100.0).round() as u8));
        }
    }

    #[zbus(property)]
    fn metadata(&self) -> HashMap<String, Value<'static>> {
        let mut meta = HashMap::new();
        meta.insert("xesam:title".to_string(), Value::from("Bluetooth Audio"));
        meta.insert("mpris:length".to_string(), Value::from(0i64));
        meta
    }

    #[zbus(property)]
    fn position(&self) -> i64 {
        0
    }

    #[zbus(property)]
    fn minimum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn maximum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn loop_status(&self) -> String {
        "None".to_string()
    }

    #[zbus(property)]
    fn shuffle(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_go_next(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_go_previous(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_play(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_pause(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_seek(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_control(&self) -> bool {
        true
    }
}

#[zbus::proxy(interface = "org.bluez.Media1", default_service = "org.bluez")]
trait Media1 {
    fn register_player(
        &self,
        player: &ObjectPath<'_>,
        properties: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_player(&self, player: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// The exported player plus its BlueZ registration.
///
/// Registration must happen before the first device connect — BlueZ
/// binds a speaker's AVRCP session to whatever players exist at
/// connect time.
pub struct MprisPlayer {
    connection: zbus::Connection,
    adapter_path: String,
    registered: bool,
}

impl MprisPlayer {
    /// Export the player on the system bus, own the well-known name,
    /// and register with `org.bluez.Media1` on the given adapter.
    pub async fn register(
        adapter_name: &str,
        tx: mpsc::UnboundedSender<MediaCommand>,
    ) -> Result<Self> {
        let iface = PlayerIface {
            status: PlaybackStatus::Stopped,
            volume: 1.0,
            tx,
        };
        let connection = zbus::connection::Builder::system()
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?
            .name(PLAYER_NAME)
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?
            .serve_at(PLAYER_PATH, iface)
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?
            .build()
            .await
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;

        let adapter_path = format!("/org/bluez/{adapter_name}");
        let mut player = Self {
            connection,
            adapter_path,
            registered: false,
        };
        player.register_with_bluez().await?;
        player.registered = true;
        Ok(player)
    }

    async fn register_with_bluez(&self) -> Result<()> {
        let media = Media1Proxy::builder(&self.connection)
            .path(self.adapter_path.as_str())
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?
            .build()
            .await
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;

        let path = ObjectPath::try_from(PLAYER_PATH)
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
        let mut properties: HashMap<&str, Value> = HashMap::new();
        properties.insert("PlaybackStatus", Value::from("Stopped"));
        properties.insert("LoopStatus", Value::from("None"));
        properties.insert("Rate", Value::from(1.0f64));
        properties.insert("Shuffle", Value::from(false));
        properties.insert("Volume", Value::from(1.0f64));
        properties.insert("Position", Value::from(0i64));
        properties.insert("MinimumRate", Value::from(1.0f64));
        properties.insert("MaximumRate", Value::from(1.0f64));
        properties.insert("CanGoNext", Value::from(true));
        properties.insert("CanGoPrevious", Value::from(true));
        properties.insert("CanPlay", Value::from(true));
        properties.insert("CanPause", Value::from(true));
        properties.insert("CanSeek", Value::from(false));
        properties.insert("CanControl", Value::from(true));

        media
            .register_player(&path, properties)
            .await
            .map_err(|e| Error::DbusUnavailable(format!("RegisterPlayer: {e}")))?;
        info!(path = PLAYER_PATH, adapter = %self.adapter_path, "MPRIS player registered with BlueZ");
        Ok(())
    }

    /// The shared system-bus connection (AVRCP watches reuse it).
    pub fn connection(&self) -> &zbus::Connection {
        &self.connection
    }

    /// Push a playback status to the speaker's display.
    pub async fn set_playback_status(&self, status: PlaybackStatus) -> Result<()> {
        let iface_ref = self
            .connection
            .object_server()
            .interface::<_, PlayerIface>(PLAYER_PATH)
            .await
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
        let mut iface = iface_ref.get_mut().await;
        if iface.status != status {
            iface.status = status;
            iface
                .playback_status_changed(iface_ref.signal_context())
                .await
                .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
            debug!(status = status.as_str(), "playback status pushed");
        }
        Ok(())
    }

    /// Unregister from BlueZ; the exported object goes away with the
    /// connection.
    pub async fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let Ok(path) = ObjectPath::try_from(PLAYER_PATH) else {
            return;
        };
        let builder = match Media1Proxy::builder(&self.connection).path(self.adapter_path.as_str())
        {
            Ok(builder) => builder,
            Err(_) => return,
        };
        if let Ok(media) = builder.build().await {
            if let Err(e) = media.unregister_player(&path).await {
                debug!(error = %e, "UnregisterPlayer failed (BlueZ may already have dropped us)");
            }
        }
        info!("MPRIS player unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_and_details() {
        assert_eq!(MediaCommand::Play.name(), "Play");
        assert_eq!(MediaCommand::Play.detail(), None);
        assert_eq!(MediaCommand::Volume(42).detail().as_deref(), Some("42%"));
        assert_eq!(
            MediaCommand::Seek { offset_us: -100 }.detail().as_deref(),
            Some("offset=-100")
        );
    }

    #[test]
    fn volume_setter_clamps_and_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut iface = PlayerIface {
            status: PlaybackStatus::Stopped,
            volume: 1.0,
            tx,
        };
        iface.set_volume(0.655);
        assert_eq!(rx.try_recv().unwrap(), MediaCommand::Volume(66));
        iface.set_volume(7.0);
        assert_eq!(rx.try_recv().unwrap(), MediaCommand::Volume(100));
        // a change under one percent is ignored
        iface.set_volume(0.999);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[ignore = "requires the system bus and BlueZ"]
    async fn register_on_live_bus() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let _ = MprisPlayer::register("hci0", tx).await;
    }
}
