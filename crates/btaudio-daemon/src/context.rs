//! The shared handle bundle.
//!
//! Constructed once in `main` and threaded into every component —
//! nothing in this daemon reaches for hidden global state.

use std::path::PathBuf;
use std::sync::Arc;

use btaudio_bus::EventBus;
use btaudio_store::Store;

#[derive(Clone)]
pub struct Context {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub data_dir: PathBuf,
}

impl Context {
    pub fn new(store: Arc<Store>, bus: EventBus, data_dir: PathBuf) -> Self {
        Self {
            store,
            bus,
            data_dir,
        }
    }
}
