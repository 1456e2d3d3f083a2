// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::types::{PeerType, Prefix};
use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Route flap damping parameters, after RFC 2439.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DampingConfig {
    /// Whether newly flapping routes are damped. Routes that are already
    /// suppressed stay suppressed until released even when this is off.
    pub enabled: bool,

    /// Minutes for the figure of merit to decay by half.
    pub half_life: u32,

    /// Upper bound in minutes on how long a route may be suppressed.
    pub max_hold_down: u32,

    /// Merit below which a suppressed route is released.
    pub reuse: u32,

    /// Merit above which a route is suppressed.
    pub cutoff: u32,
}

impl Default for DampingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            half_life: 15,
            max_hold_down: 60,
            reuse: 750,
            cutoff: 3000,
        }
    }
}

/// One entry of a filter bank. Filters run in the order given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Enforce aggregation marks for a session of the given type.
    Aggregation { ibgp: bool },

    /// Drop routes whose AS path already contains `asn`.
    SimpleAsLoop { asn: u32 },

    /// Route reflection loop detection on input.
    RrInput { bgp_id: Ipv4Addr, cluster_id: Ipv4Addr },

    /// Prepend our AS, into a confederation segment for confederation
    /// peers.
    AsPrepend { asn: u32, confederation: bool },

    /// Set the next hop to ourselves, unless the peer is directly connected
    /// and the current next hop is on the shared subnet.
    NexthopRewrite {
        local_nexthop: IpAddr,
        directly_connected: bool,
        subnet: Option<Prefix>,
    },

    /// Replace a next hop equal to the peer's own address with ours.
    NexthopPeerCheck {
        local_nexthop: IpAddr,
        peer_address: IpAddr,
    },

    /// Drop routes learned over IBGP.
    IbgpLoop,

    /// Route reflection toward an internal peer.
    RrIbgpLoop {
        rr_client: bool,
        bgp_id: Ipv4Addr,
        cluster_id: Ipv4Addr,
    },

    /// Strip route reflection attributes.
    RrPurge,

    LocalPrefInsertion { local_pref: u32 },

    LocalPrefRemoval,

    /// Set the MED from the IGP metric to the next hop.
    MedInsertion,

    MedRemoval,

    /// Honor NO_ADVERTISE, NO_EXPORT and NO_EXPORT_SUBCONFED toward a peer
    /// of the given type.
    KnownCommunity { peer_type: PeerType },

    /// Drop unknown non-transitive attributes and mark unknown transitive
    /// ones partial.
    UnknownAttributes,
}

fn default_deletion_chunk() -> usize {
    crate::ribin::DEFAULT_DELETION_CHUNK
}

fn default_true() -> bool {
    true
}

/// Configuration of one pipeline branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchConfig {
    pub name: String,

    /// Routes withdrawn per background step when a session goes down.
    #[serde(default = "default_deletion_chunk")]
    pub deletion_chunk: usize,

    /// Flap damping, input branches only.
    #[serde(default)]
    pub damping: Option<DampingConfig>,

    #[serde(default)]
    pub filters: Vec<FilterSpec>,

    /// Hold routes until their next hop resolves, input branches only.
    #[serde(default = "default_true")]
    pub nexthop_gating: bool,
}

impl BranchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deletion_chunk: default_deletion_chunk(),
            damping: None,
            filters: Vec::new(),
            nexthop_gating: true,
        }
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_json(&s)
            .with_context(|| format!("parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("empty branch name".into()));
        }
        if self.deletion_chunk == 0 {
            return Err(Error::InvalidConfig(
                "deletion chunk must be positive".into(),
            ));
        }
        if let Some(damping) = &self.damping {
            crate::damping::Damping::new(damping)?;
        }
        for spec in &self.filters {
            crate::filter::build_filter(spec, None)?;
        }
        Ok(())
    }
}

/// Branch configurations for a speaker, one per input or output branch.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct PipelineConfig {
    #[serde(default)]
    pub inputs: Vec<BranchConfig>,

    #[serde(default)]
    pub outputs: Vec<BranchConfig>,
}

impl PipelineConfig {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_json(&s)
            .with_context(|| format!("parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut names = std::collections::BTreeSet::new();
        for branch in self.inputs.iter().chain(self.outputs.iter()) {
            branch.validate()?;
            if !names.insert(branch.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate branch name {}",
                    branch.name
                )));
            }
        }
        for branch in &self.outputs {
            if branch.damping.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "output branch {} configures damping",
                    branch.name
                )));
            }
        }
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&BranchConfig> {
        self.inputs.iter().find(|b| b.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&BranchConfig> {
        self.outputs.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn branch_config_from_json() {
        let config = BranchConfig::from_json(
            r#"{
                "name": "peer-1-in",
                "damping": {
                    "enabled": true,
                    "half_life": 15,
                    "max_hold_down": 60,
                    "reuse": 750,
                    "cutoff": 3000
                },
                "filters": [
                    { "kind": "simple_as_loop", "asn": 65000 },
                    { "kind": "local_pref_insertion", "local_pref": 100 },
                    { "kind": "known_community", "peer_type": "ebgp" }
                ]
            }"#,
        )
        .expect("parse config");
        assert_eq!(
            config.deletion_chunk,
            crate::ribin::DEFAULT_DELETION_CHUNK
        );
        assert!(config.nexthop_gating);
        assert_eq!(config.damping, Some(DampingConfig::default()));
        assert_eq!(
            config.filters[0],
            FilterSpec::SimpleAsLoop { asn: 65000 }
        );
    }

    #[test]
    fn invalid_branch_config_is_rejected() {
        let e = BranchConfig::from_json(
            r#"{
                "name": "peer-1-in",
                "filters": [ { "kind": "simple_as_loop", "asn": 0 } ]
            }"#,
        );
        assert!(matches!(e, Err(Error::InvalidFilter(_))));

        let e = BranchConfig::from_json(
            r#"{
                "name": "peer-1-in",
                "damping": {
                    "enabled": true,
                    "half_life": 15,
                    "max_hold_down": 60,
                    "reuse": 3000,
                    "cutoff": 750
                }
            }"#,
        );
        assert!(matches!(e, Err(Error::InvalidDamping(_))));

        let e = BranchConfig::from_json(r#"{ "name": "x", "filters": 3 }"#);
        assert!(matches!(e, Err(Error::Json(_))));
    }

    #[test]
    fn pipeline_config_from_file() {
        let path = std::env::temp_dir()
            .join(format!("rtpipe-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "inputs": [ { "name": "peer-1-in" } ],
                "outputs": [
                    {
                        "name": "peer-1-out",
                        "filters": [ { "kind": "med_removal" } ]
                    }
                ]
            }"#,
        )
        .expect("write config");
        let config = PipelineConfig::from_file(&path).expect("load config");
        std::fs::remove_file(&path).expect("remove config");

        assert_eq!(config.inputs.len(), 1);
        assert_eq!(
            config.output("peer-1-out").map(|b| b.filters.clone()),
            Some(vec![FilterSpec::MedRemoval])
        );
        assert!(config.input("peer-2-in").is_none());

        let missing = PipelineConfig::from_file(path.with_extension("none"));
        assert!(missing.is_err());
    }

    #[test]
    fn duplicate_branch_names_are_rejected() {
        let e = PipelineConfig::from_json(
            r#"{
                "inputs": [ { "name": "a" } ],
                "outputs": [ { "name": "a" } ]
            }"#,
        );
        assert!(matches!(e, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn schema_names_filter_kinds() {
        let schema = schemars::schema_for!(BranchConfig);
        let json = serde_json::to_string(&schema).expect("serialize schema");
        assert!(json.contains("nexthop_rewrite"));
        assert!(json.contains("max_hold_down"));
    }
}
