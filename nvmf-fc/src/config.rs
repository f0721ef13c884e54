//! Transport configuration, loadable from a YAML file. Missing fields
//! assume their default values so a partial config is valid.

use std::{fs, io::Write, path::Path};

use snafu::ResultExt;

use crate::{
    error::{ConfigOpen, ConfigRead, Error},
    transport::FcTransportOpts,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FcConfig {
    /// generic transport options (queue depths, buffer budget)
    pub opts: FcTransportOpts,
    /// cache SRSR buffers per association and send an LS Disconnect to the
    /// initiator when the association is torn down locally
    pub send_ls_disconnect: bool,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            opts: FcTransportOpts::default(),
            send_ls_disconnect: false,
        }
    }
}

impl FcConfig {
    /// Read the configuration from the given file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = path.as_ref().to_string_lossy().into_owned();
        let cfg = fs::read_to_string(path).context(ConfigOpen {
            path: file.clone(),
        })?;
        serde_yaml::from_str(&cfg).context(ConfigRead { path: file })
    }

    /// Write the current configuration out, overwriting what is there.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = path.as_ref().to_string_lossy().into_owned();
        let s = serde_yaml::to_string(&self).expect("config serialization");
        let mut f = fs::File::create(path).context(ConfigOpen {
            path: file.clone(),
        })?;
        f.write_all(s.as_bytes()).context(ConfigOpen { path: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_roundtrip() {
        let cfg = FcConfig::default();
        let s = serde_yaml::to_string(&cfg).unwrap();
        let back: FcConfig = serde_yaml::from_str(&s).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.opts.max_queue_depth, 128);
        assert_eq!(back.opts.max_aq_depth, 32);
    }

    #[test]
    fn partial_config_takes_defaults() {
        let cfg: FcConfig =
            serde_yaml::from_str("send_ls_disconnect: true").unwrap();
        assert!(cfg.send_ls_disconnect);
        assert_eq!(cfg.opts, FcTransportOpts::default());
    }
}
