//! # btaudio-media
//!
//! The D-Bus objects this daemon exports, plus the AVRCP player watch.
//!
//! BlueZ delivers a speaker's AVRCP button presses by calling methods on
//! a registered media player object; we export an
//! `org.mpris.MediaPlayer2.Player` implementation and register it
//! through `org.bluez.Media1`. The null-HFP profile handler displaces
//! the host's HFP registration so speakers negotiate AVRCP absolute
//! volume instead of HFP gain commands.

pub mod avrcp;
pub mod hfp_block;
pub mod player;

pub use avrcp::{AvrcpSignal, AvrcpWatch};
pub use hfp_block::HfpBlock;
pub use player::{MediaCommand, MprisPlayer, PlaybackStatus};
