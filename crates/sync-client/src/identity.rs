//! Persistent device identity.
//!
//! A device id is generated on first run and written to `<dir>/device_id`.
//! Later runs read it back, so this replica keeps the same vector clock key.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sync_core::{DeviceId, DeviceIdError};
use thiserror::Error;
use tracing::info;

/// File holding the device id, relative to the client's state directory.
pub const DEVICE_ID_FILE: &str = "device_id";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid device id in {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: DeviceIdError,
    },
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Read the device id stored under `dir`, generating and saving one if absent.
pub fn load_or_create_device_id(dir: &Path) -> Result<DeviceId> {
    let path = dir.join(DEVICE_ID_FILE);

    match fs::read_to_string(&path) {
        Ok(content) => content
            .parse()
            .map_err(|source| IdentityError::Invalid { path, source }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let device_id = DeviceId::generate();
            fs::create_dir_all(dir)?;
            fs::write(&path, format!("{}\n", device_id))?;
            info!("Generated device id {} at {:?}", device_id, path);
            Ok(device_id)
        }
        Err(e) => Err(e.into()),
    }
}
