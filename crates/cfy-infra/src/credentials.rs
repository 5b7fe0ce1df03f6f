use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::types::MachineDetails;
use crate::{Error, Result};

const PRIVATE_KEY_MARKER: &str = "PRIVATE KEY-----";

/// Make sure a freshly started machine carries usable credentials.
///
/// Resolution order: a key file already on the machine details, then the
/// driver-level key file, then the password. Some clouds hand back a PEM
/// private key in the password field; it is written to a private temp file
/// and used as the key file instead.
pub fn resolve_credentials(
    mut machine: MachineDetails,
    default_key_file: Option<&Path>,
) -> Result<MachineDetails> {
    if let Some(key_file) = &machine.key_file {
        if !key_file.is_file() {
            return Err(Error::Credentials(format!(
                "the specified key file could not be found: {}",
                key_file.display()
            )));
        }
        return Ok(machine);
    }

    if let Some(key_file) = default_key_file {
        if !key_file.is_file() {
            return Err(Error::Credentials(format!(
                "the specified key file could not be found: {}",
                key_file.display()
            )));
        }
        return Ok(machine.with_key_file(key_file.to_path_buf()));
    }

    match machine.remote_password.take() {
        Some(password) if password.trim_start().starts_with("-----BEGIN") && password.contains(PRIVATE_KEY_MARKER) => {
            debug!("cloud provided a private key for connections to new machines");
            let mut file = tempfile::Builder::new()
                .prefix("cfy-key-")
                .suffix(".pem")
                .tempfile()?;
            file.write_all(password.as_bytes())?;
            let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
            Ok(machine.with_key_file(path))
        }
        Some(password) if !password.trim().is_empty() => {
            debug!("cloud provided a password for connections to new machines");
            machine.remote_password = Some(password);
            Ok(machine)
        }
        _ => Err(Error::Credentials(
            "no credentials (password or key file) supplied for remote connections".into(),
        )),
    }
}
