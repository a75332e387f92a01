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

//! Library surface for the peer-to-peer chat node. The GUI/CLI and
//! argument parsing stay out of scope; this crate exposes [`Node`] and
//! its dependent types for a wrapper to drive.

pub mod config;
pub mod envelope;
pub mod error;
pub mod file_transfer;
pub mod node;
pub mod presence;
pub mod transport;

pub use config::Config;
pub use envelope::Envelope;
pub use error::{ChatError, ChatResult};
pub use file_transfer::TransferStatusInfo;
pub use node::Node;
pub use presence::{MessageCallback, Notification};
pub use transport::PeerAddr;
