//! AVRCP `MediaPlayer1` watch.
//!
//! When a speaker exposes its own AVRCP player, BlueZ creates a
//! `player*` child node under the device object. This module discovers
//! that node and subscribes to its property changes, forwarding them as
//! typed signals. Most plain speakers never expose one — their buttons
//! arrive through the registered MPRIS player instead — so not finding
//! a node is normal.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use btaudio_core::{Address, Error, Result};

const WATCH_RETRIES: u32 = 3;
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// One AVRCP property change from a device's own player node.
#[derive(Debug, Clone)]
pub struct AvrcpSignal {
    pub address: Address,
    pub property: String,
    pub value: String,
}

/// A live subscription; abort on forget to terminate deterministically.
pub struct AvrcpWatch {
    handle: JoinHandle<()>,
    pub player_path: String,
}

impl AvrcpWatch {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for AvrcpWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Discover the device's `player*` node and subscribe to its
/// `MediaPlayer1` property changes.
///
/// Retries a few times — BlueZ creates the node a moment after A2DP
/// comes up. Returns `Ok(None)` when the device simply has no player;
/// the caller applies its own cooldown before searching again.
pub async fn watch_media_player(
    connection: &zbus::Connection,
    adapter_name: &str,
    address: &Address,
    tx: mpsc::Sender<AvrcpSignal>,
) -> Result<Option<AvrcpWatch>> {
    let device_path = format!(
        "/org/bluez/{adapter_name}/dev_{}",
        address.underscored()
    );

    for attempt in 0..WATCH_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(WATCH_RETRY_DELAY).await;
        }
        match find_player_node(connection, &device_path).await? {
            Some(node) => {
                let player_path = format!("{device_path}/{node}");
                let handle =
                    subscribe_player(connection, &player_path, address.clone(), tx).await?;
                info!(%address, player = %player_path, "AVRCP player watch started");
                return Ok(Some(AvrcpWatch {
                    handle,
                    player_path,
                }));
            }
            None => {
                debug!(
                    %address,
                    attempt = attempt + 1,
                    "no AVRCP player node yet"
                );
            }
        }
    }
    debug!(%address, "no AVRCP player after retries (normal for plain speakers)");
    Ok(None)
}

/// Introspect the device node and pick the first `player*` child.
async fn find_player_node(
    connection: &zbus::Connection,
    device_path: &str,
) -> Result<Option<String>> {
    let proxy = zbus::fdo::IntrospectableProxy::builder(connection)
        .destination("org.bluez")
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?
        .path(device_path.to_string())
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?
        .build()
        .await
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
    let xml = match proxy.introspect().await {
        Ok(xml) => xml,
        // the device node itself may be gone mid-disconnect
        Err(_) => return Ok(None),
    };
    Ok(parse_player_node(&xml))
}

/// Pull the first `<node name="playerN"/>` out of introspection XML.
fn parse_player_node(xml: &str) -> Option<String> {
    let mut rest = xml;
    while let Some(start) = rest.find("<node name=\"") {
        let tail = &rest[start + "<node name=\"".len()..];
        let end = tail.find('"')?;
        let name = &tail[..end];
        if name.starts_with("player") {
            return Some(name.to_string());
        }
        rest = &tail[end..];
    }
    None
}

async fn subscribe_player(
    connection: &zbus::Connection,
    player_path: &str,
    address: Address,
    tx: mpsc::Sender<AvrcpSignal>,
) -> Result<JoinHandle<()>> {
    let proxy = zbus::fdo::PropertiesProxy::builder(connection)
        .destination("org.bluez")
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?
        .path(player_path.to_string())
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?
        .build()
        .await
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
    let mut changes = proxy
        .receive_properties_changed()
        .await
        .map_err(|e| Error::DbusUnavailable(e.to_string()))?;

    Ok(tokio::spawn(async move {
        while let Some(signal) = changes.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };
            if args.interface_name.as_str() != "org.bluez.MediaPlayer1" {
                continue;
            }
            for (property, value) in args.changed_properties.iter() {
                let rendered = render_value(value);
                debug!(%address, property = %property, value = %rendered, "AVRCP property");
                let sent = tx
                    .send(AvrcpSignal {
                        address: address.clone(),
                        property: property.to_string(),
                        value: rendered,
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }
        }
        debug!(%address, "AVRCP property stream ended");
    }))
}

/// Flatten a variant into a displayable string for event payloads.
fn render_value(value: &zbus::zvariant::Value<'_>) -> String {
    use zbus::zvariant::Value;
    match value {
        Value::Str(s) => s.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::U8(n) => n.to_string(),
        Value::U16(n) => n.to_string(),
        Value::U32(n) => n.to_string(),
        Value::U64(n) => n.to_string(),
        Value::I16(n) => n.to_string(),
        Value::I32(n) => n.to_string(),
        Value::I64(n) => n.to_string(),
        Value::F64(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_player_node_in_introspection() {
        let xml = r#"<node>
            <interface name="org.bluez.Device1"/>
            <node name="fd3"/>
            <node name="player0"/>
        </node>"#;
        assert_eq!(parse_player_node(xml).as_deref(), Some("player0"));
    }

    #[test]
    fn no_player_node_is_none() {
        let xml = r#"<node><node name="fd1"/></node>"#;
        assert_eq!(parse_player_node(xml), None);
        assert_eq!(parse_player_node("<node/>"), None);
    }

    #[test]
    fn renders_scalar_values() {
        use zbus::zvariant::Value;
        assert_eq!(render_value(&Value::from("playing")), "playing");
        assert_eq!(render_value(&Value::from(64u16)), "64");
        assert_eq!(render_value(&Value::from(true)), "true");
    }
}
