//! Per-instance configuration, loadable from TOML.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone)]
pub struct Gea2Config {
    pub address: u8,
    pub ignore_destination_address: bool,
    /// Transmission retries after a collision or missing ACK.
    pub retries: u8,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub send_queue_size: usize,
}

impl Default for Gea2Config {
    fn default() -> Gea2Config {
        Gea2Config {
            address: 0xE4,
            ignore_destination_address: false,
            retries: 2,
            receive_buffer_size: 255,
            send_buffer_size: 255,
            send_queue_size: 1024,
        }
    }
}

impl Gea2Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Gea2Config {
        serdeconv::from_toml_file(path).expect("Error loading single-wire link configuration file")
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Gea3Config {
    pub address: u8,
    pub ignore_destination_address: bool,
    pub receive_buffer_size: usize,
    pub send_queue_size: usize,
}

impl Default for Gea3Config {
    fn default() -> Gea3Config {
        Gea3Config {
            address: 0xE4,
            ignore_destination_address: false,
            receive_buffer_size: 255,
            send_queue_size: 1024,
        }
    }
}

impl Gea3Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Gea3Config {
        serdeconv::from_toml_file(path).expect("Error loading full-duplex link configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let toml = serdeconv::to_toml_string(&Gea2Config::default()).unwrap();
        let config: Gea2Config = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(config.address, 0xE4);
        assert_eq!(config.retries, 2);
        assert!(!config.ignore_destination_address);
    }
}
