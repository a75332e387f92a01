// P2P Chat - peer-to-peer chat node with presence and reliable file transfer
// over direct TCP connections, no central server.
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: General,
}

#[derive(Deserialize, Debug)]
pub struct General {
    pub username: String,

    pub bind_address: String,

    #[serde(default = "General::default_download_dir")]
    pub download_dir: String,

    #[serde(default = "General::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "General::default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    #[serde(default = "General::default_message_ttl")]
    pub message_ttl: usize,

    #[serde(default = "General::default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "General::default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default = "General::default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,

    #[serde(default = "General::default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,

    #[serde(default = "General::default_large_file_threshold_bytes")]
    pub large_file_threshold_bytes: u64,
}

impl General {
    pub fn default_download_dir() -> String {
        "downloads".to_string()
    }

    pub fn default_heartbeat_interval_secs() -> u64 {
        5
    }

    pub fn default_connection_timeout_secs() -> u64 {
        15
    }

    pub fn default_message_ttl() -> usize {
        100
    }

    pub fn default_chunk_size() -> usize {
        4096
    }

    pub fn default_retry_limit() -> u32 {
        3
    }

    pub fn default_chunk_timeout_secs() -> u64 {
        10
    }

    pub fn default_transfer_timeout_secs() -> u64 {
        60
    }

    pub fn default_large_file_threshold_bytes() -> u64 {
        5 * 1024 * 1024
    }
}
