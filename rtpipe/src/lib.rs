// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route table pipeline for a BGP speaker.
//!
//! Routes learned from peers enter a [`pipeline::Pipeline`] at its
//! [`ribin::RibInTable`] and flow through an ordered chain of stages (flap
//! damping, filter banks, a change cache, next-hop gated admission and
//! background table dumps) before reaching a [`table::RouteSink`], which is
//! either a decision process or a peer's outbound RIB.

pub mod attributes;
pub mod cache;
pub mod clock;
pub mod config;
pub mod damping;
pub mod damping_table;
pub mod dump;
pub mod error;
pub mod filter;
pub mod log;
pub mod nhlookup;
pub mod pipeline;
pub mod plumbing;
pub mod ribin;
pub mod route;
pub mod table;
pub mod types;

#[cfg(test)]
mod proptest;


pub const COMPONENT_RTPIPE: &str = "rtpipe";
pub const MOD_PIPELINE: &str = "pipeline";
pub const MOD_RIBIN: &str = "ribin";
pub const MOD_CACHE: &str = "cache";
pub const MOD_FILTER: &str = "filter";
pub const MOD_DAMPING: &str = "damping";
pub const MOD_NHLOOKUP: &str = "nhlookup";
pub const MOD_DUMP: &str = "dump";
