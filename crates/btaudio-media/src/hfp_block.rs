//! Null HFP profile handler.
//!
//! Some speakers (Bose is the common offender) send volume buttons as
//! HFP `AT+VGS` gain commands instead of AVRCP absolute volume, and
//! BlueZ does not map HFP gain onto the A2DP transport — the buttons
//! appear dead. Registering as the HFP profile handler routes HFP
//! connection attempts to us; closing the RFCOMM fd rejects them, so
//! the speaker falls back to AVRCP.
//!
//! Registration is host-global: it displaces PulseAudio's own HFP
//! handler, which is why it is skipped when any stored device actually
//! uses the HFP audio profile.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedValue, Value};

use btaudio_core::{Error, Result};

const PROFILE_PATH: &str = "/org/btaudiod/null_hfp";
const HFP_UUID: &str = "0000111e-0000-1000-8000-00805f9b34fb";

struct NullHfpIface;

#[zbus::interface(name = "org.bluez.Profile1")]
impl NullHfpIface {
    fn release(&self) {
        debug!("null HFP profile released by BlueZ");
    }

    fn new_connection(
        &self,
        device: ObjectPath<'_>,
        fd: OwnedFd,
        _fd_properties: HashMap<String, OwnedValue>,
    ) {
        info!(device = %device, "rejecting HFP connection");
        drop(fd);
    }

    fn request_disconnection(&self, device: ObjectPath<'_>) {
        debug!(device = %device, "HFP disconnect requested");
    }
}

#[zbus::proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
trait ProfileManager1 {
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Holds the registration; call `unregister` before allowing real HFP.
pub struct HfpBlock {
    connection: zbus::Connection,
    registered: bool,
}

impl HfpBlock {
    /// Export the null handler and claim the HFP UUID.
    ///
    /// Failure here degrades (HFP may still work for volume-challenged
    /// speakers) rather than aborting startup.
    pub async fn register(connection: &zbus::Connection) -> Result<Self> {
        connection
            .object_server()
            .at(PROFILE_PATH, NullHfpIface)
            .await
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;

        let manager = ProfileManager1Proxy::new(connection)
            .await
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
        let path = ObjectPath::try_from(PROFILE_PATH)
            .map_err(|e| Error::DbusUnavailable(e.to_string()))?;
        let mut options: HashMap<&str, Value> = HashMap::new();
        options.insert("Name", Value::from("Null HFP"));
        options.insert("Role", Value::from("client"));

        match manager.register_profile(&path, HFP_UUID, options).await {
            Ok(()) => {
                info!("null HFP handler registered — HFP connections will be rejected");
            }
            Err(e) if e.to_string().contains("AlreadyExists") => {
                info!("null HFP handler already registered");
            }
            Err(e) => {
                warn!(error = %e, "null HFP registration failed, HFP stays available");
                return Err(Error::DbusUnavailable(e.to_string()));
            }
        }
        Ok(Self {
            connection: connection.clone(),
            registered: true,
        })
    }

    /// Release the HFP UUID so real HFP connections can proceed again.
    pub async fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let Ok(path) = ObjectPath::try_from(PROFILE_PATH) else {
            return;
        };
        match ProfileManager1Proxy::new(&self.connection).await {
            Ok(manager) => {
                if let Err(e) = manager.unregister_profile(&path).await {
                    debug!(error = %e, "null HFP unregister failed");
                }
            }
            Err(e) => debug!(error = %e, "profile manager unavailable during unregister"),
        }
        let _ = self
            .connection
            .object_server()
            .remove::<NullHfpIface, _>(PROFILE_PATH)
            .await;
        info!("null HFP handler unregistered — HFP connections allowed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfp_uuid_is_the_handsfree_service_class() {
        assert!(HFP_UUID.starts_with("0000111e"));
    }

    #[tokio::test]
    #[ignore = "requires the system bus and BlueZ"]
    async fn register_and_unregister() {
        let connection = zbus::Connection::system().await.unwrap();
        if let Ok(mut block) = HfpBlock::register(&connection).await {
            block.unregister().await;
        }
    }
}
