//! The table of relay regions, modelled on the DERP map.

use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{client::Transport, defaults::DEFAULT_STUN_PORT};

/// Identifies a relay region.
pub type RegionId = u16;

/// All relay regions that can be used.
///
/// Cloning is cheap and clones share the same table, so the map can be replaced at
/// runtime with [`RelayMap::replace`] and every holder sees the new regions.
#[derive(Debug, Clone, Default)]
pub struct RelayMap {
    regions: Arc<RwLock<BTreeMap<RegionId, Arc<RelayRegion>>>>,
}

impl PartialEq for RelayMap {
    fn eq(&self, other: &Self) -> bool {
        let this = self.regions.read().expect("poisoned");
        let that = other.regions.read().expect("poisoned");
        this.eq(&*that)
    }
}

impl Eq for RelayMap {}

impl RelayMap {
    /// Creates an empty relay map.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the region ids, sorted.
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.read().expect("poisoned").keys().copied().collect()
    }

    /// Returns all regions, sorted by id.
    pub fn regions<T>(&self) -> T
    where
        T: FromIterator<Arc<RelayRegion>>,
    {
        self.regions
            .read()
            .expect("poisoned")
            .values()
            .cloned()
            .collect::<T>()
    }

    /// Is this a known region?
    pub fn contains_region(&self, id: RegionId) -> bool {
        self.regions.read().expect("poisoned").contains_key(&id)
    }

    /// Returns the given region.
    pub fn get_region(&self, id: RegionId) -> Option<Arc<RelayRegion>> {
        self.regions.read().expect("poisoned").get(&id).cloned()
    }

    /// How many regions are known?
    pub fn len(&self) -> usize {
        self.regions.read().expect("poisoned").len()
    }

    /// Are there any regions in this map?
    pub fn is_empty(&self) -> bool {
        self.regions.read().expect("poisoned").is_empty()
    }

    /// Inserts a region, returning the one it replaced.
    pub fn insert(&self, region: RelayRegion) -> Option<Arc<RelayRegion>> {
        self.regions
            .write()
            .expect("poisoned")
            .insert(region.region_id, Arc::new(region))
    }

    /// Removes a region.
    pub fn remove(&self, id: RegionId) -> Option<Arc<RelayRegion>> {
        self.regions.write().expect("poisoned").remove(&id)
    }

    /// Replaces every region with the regions of `other`.
    pub fn replace(&self, other: &RelayMap) {
        if Arc::ptr_eq(&self.regions, &other.regions) {
            return;
        }
        let new = other.regions.read().expect("poisoned").clone();
        *self.regions.write().expect("poisoned") = new;
    }
}

impl FromIterator<RelayRegion> for RelayMap {
    fn from_iter<T: IntoIterator<Item = RelayRegion>>(iter: T) -> Self {
        Self {
            regions: Arc::new(RwLock::new(
                iter.into_iter()
                    .map(|region| (region.region_id, Arc::new(region)))
                    .collect(),
            )),
        }
    }
}

impl From<RelayRegion> for RelayMap {
    fn from(value: RelayRegion) -> Self {
        Self::from_iter([value])
    }
}

impl fmt::Display for RelayMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.region_ids();
        write!(f, "RelayMap{ids:?}")
    }
}

impl Serialize for RelayMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let regions: Vec<Arc<RelayRegion>> = self.regions();
        regions.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelayMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let regions = Vec::<RelayRegion>::deserialize(deserializer)?;
        Ok(regions.into_iter().collect())
    }
}

/// A geographic region running one or more relay nodes.
///
/// All nodes in a region share state, so a packet sent to any node of the region reaches
/// every client connected to that region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    /// Unique id of the region.
    pub region_id: RegionId,
    /// Short human readable name, e.g. "fra".
    #[serde(default)]
    pub region_code: String,
    /// The nodes of the region, in order of preference.
    pub nodes: Vec<RelayNode>,
    /// Do not pick this region as a home region, only use it to reach peers homed there.
    #[serde(default)]
    pub avoid: bool,
    /// The transport to try first when connecting.
    #[serde(default)]
    pub preferred_transport: Transport,
}

impl RelayRegion {
    /// Creates a region with a single node at `url`.
    pub fn from_url(region_id: RegionId, url: Url) -> Self {
        let name = url.host_str().unwrap_or_default().to_string();
        Self {
            region_id,
            region_code: name.clone(),
            nodes: vec![RelayNode {
                name,
                url,
                stun_only: false,
                stun_port: DEFAULT_STUN_PORT,
                ipv4: None,
                ipv6: None,
            }],
            avoid: false,
            preferred_transport: Transport::default(),
        }
    }

    /// Nodes that can carry relayed traffic, skipping STUN-only nodes.
    pub fn relay_nodes(&self) -> impl Iterator<Item = &RelayNode> {
        self.nodes.iter().filter(|n| !n.stun_only)
    }
}

/// A single relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Unique name of the node.
    pub name: String,
    /// Where the relay server is dialed.
    pub url: Url,
    /// The node only answers STUN, it does not relay.
    #[serde(default)]
    pub stun_only: bool,
    /// The STUN port, `0` disables STUN on this node.
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,
    /// A fixed IPv4 address to use instead of resolving the host.
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    /// A fixed IPv6 address to use instead of resolving the host.
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
}

fn default_stun_port() -> u16 {
    DEFAULT_STUN_PORT
}
