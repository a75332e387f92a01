// P2P Chat - peer-to-peer chat node with presence and reliable file transfer
// over direct TCP connections, no central server.
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML error {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("refusing to connect to self at {0}:{1}")]
    SelfConnect(String, u16),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
