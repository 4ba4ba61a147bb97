//! Client configuration, loadable from TOML.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// Milliseconds to wait for a response before retrying.
    pub request_timeout: u64,
    /// Retries after the initial attempt before the request fails.
    pub request_retries: u8,
    pub queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            request_timeout: 500,
            request_retries: 2,
            queue_size: 256,
        }
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading ERD client configuration file")
    }
}
