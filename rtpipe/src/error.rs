// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::PeerId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("peer {0} is already up")]
    PeerExists(PeerId),

    #[error("no table with id {0}")]
    NoSuchTable(u64),

    #[error("table {0} is not a {1}")]
    WrongTableKind(u64, &'static str),

    #[error("a dump is already in progress for {0}")]
    DumpInProgress(PeerId),

    #[error("pipeline {0} already has a sink attached")]
    AlreadyAttached(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid damping parameters: {0}")]
    InvalidDamping(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
