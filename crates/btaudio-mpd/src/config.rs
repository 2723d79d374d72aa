//! MPD config generation.

use std::path::{Path, PathBuf};

use btaudio_core::Address;

/// File layout for one device's MPD instance, rooted under the data
/// directory so databases survive restarts while configs are transient.
#[derive(Debug, Clone)]
pub struct MpdLayout {
    pub root: PathBuf,
}

impl MpdLayout {
    pub fn new(data_dir: &Path, address: &Address) -> Self {
        Self {
            root: data_dir.join("mpd").join(address.underscored()),
        }
    }

    pub fn music_dir(&self) -> PathBuf {
        self.root.join("music")
    }

    pub fn db_file(&self) -> PathBuf {
        self.root.join("database")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("mpd.pid")
    }

    pub fn conf_file(&self) -> PathBuf {
        self.root.join("mpd.conf")
    }

    /// Render the config document targeting one PulseAudio sink.
    pub fn render(&self, port: u16, display_name: &str, sink_name: &str) -> String {
        format!(
            r#"music_directory     "{music}"
db_file             "{db}"
state_file          "{state}"
pid_file            "{pid}"
bind_to_address     "127.0.0.1"
port                "{port}"
auto_update         "no"

audio_output {{
    type    "pulse"
    name    "{name}"
    sink    "{sink}"
}}

input {{
    plugin  "curl"
}}
"#,
            music = self.music_dir().display(),
            db = self.db_file().display(),
            state = self.state_file().display(),
            pid = self.pid_file().display(),
            port = port,
            name = display_name,
            sink = sink_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_per_device() {
        let a = MpdLayout::new(Path::new("/data"), &Address::parse("AA:BB:CC:DD:EE:01").unwrap());
        let b = MpdLayout::new(Path::new("/data"), &Address::parse("AA:BB:CC:DD:EE:02").unwrap());
        assert_ne!(a.root, b.root);
        assert!(a.conf_file().starts_with("/data/mpd/AA_BB_CC_DD_EE_01"));
    }

    #[test]
    fn config_references_sink_and_port() {
        let layout = MpdLayout::new(
            Path::new("/data"),
            &Address::parse("AA:BB:CC:DD:EE:01").unwrap(),
        );
        let conf = layout.render(6601, "Kitchen (DDEE01)", "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink");
        assert!(conf.contains(r#"port                "6601""#));
        assert!(conf.contains(r#"sink    "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink""#));
        assert!(conf.contains(r#"name    "Kitchen (DDEE01)""#));
        assert!(conf.contains(r#"bind_to_address     "127.0.0.1""#));
    }
}
