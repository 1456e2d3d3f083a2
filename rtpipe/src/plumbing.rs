// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standard branch layouts.
//!
//! An input branch carries one peer's routes toward the decision process:
//! source, damping, filters, cache, next-hop gating. An output branch
//! carries the decision process's choices toward one peer: source, filters,
//! cache, with a dump table inserted when the peer is attached.

use crate::cache::CacheTable;
use crate::config::BranchConfig;
use crate::damping::Damping;
use crate::damping_table::DampingTable;
use crate::error::Error;
use crate::filter::FilterTable;
use crate::nhlookup::{NextHopResolver, NhLookupTable};
use crate::pipeline::Pipeline;
use crate::table::RouteSink;
use slog::Logger;
use std::sync::Arc;

/// Build an input branch and attach it to `sink`. Nothing is plumbed if
/// the configuration is invalid.
pub fn input_branch(
    config: &BranchConfig,
    resolver: Arc<dyn NextHopResolver>,
    sink: Box<dyn RouteSink>,
    log: Logger,
) -> Result<Pipeline, Error> {
    config.validate()?;
    let name = config.name.as_str();

    let damping = config
        .damping
        .as_ref()
        .map(Damping::new)
        .transpose()?
        .map(|d| DampingTable::new(format!("{name}/damping"), d, log.clone()));

    let mut filter = FilterTable::new(format!("{name}/filter"), log.clone())
        .with_resolver(resolver.clone());
    filter.reconfigure(&config.filters)?;

    let mut pipeline = Pipeline::new(name, log.clone());
    pipeline.source_mut().set_deletion_chunk(config.deletion_chunk);
    if let Some(damping) = damping {
        pipeline.plumb(Box::new(damping));
    }
    pipeline.plumb(Box::new(filter));
    pipeline.plumb(Box::new(CacheTable::new(
        format!("{name}/cache"),
        log.clone(),
    )));
    if config.nexthop_gating {
        pipeline.plumb(Box::new(NhLookupTable::new(
            format!("{name}/nhlookup"),
            resolver,
            log,
        )));
    }
    pipeline.attach(sink)?;
    Ok(pipeline)
}

/// Build an output branch. The caller attaches it with
/// [`Pipeline::attach_with_dump`] once the receiving peer is ready.
pub fn output_branch(
    config: &BranchConfig,
    log: Logger,
) -> Result<Pipeline, Error> {
    config.validate()?;
    if config.damping.is_some() {
        return Err(Error::InvalidConfig(format!(
            "output branch {} configures damping",
            config.name
        )));
    }
    let name = config.name.as_str();

    let mut filter = FilterTable::new(format!("{name}/filter"), log.clone());
    filter.reconfigure(&config.filters)?;

    let mut pipeline = Pipeline::new(name, log.clone());
    pipeline.source_mut().set_deletion_chunk(config.deletion_chunk);
    pipeline.plumb(Box::new(filter));
    pipeline.plumb(Box::new(CacheTable::new(format!("{name}/cache"), log)));
    Ok(pipeline)
}
