//! NUMA topology discovery.
//!
//! The layout is read once from sysfs (`/sys/devices/system/node`): the online node list, the
//! CPUs of every node and the node distance matrix. When sysfs cannot be read the machine is
//! treated as a single node holding every configured CPU.

use crate::error::{AutopinError, TopologyIndexKind};
use crate::prelude::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// Distance the kernel reports between a node and itself.
const LOCAL_DISTANCE: u32 = 10;

/// Immutable CPU to NUMA node mapping and node distance matrix.
///
/// CPU slots run from 0 to `cpu_count() - 1`. A slot that no node lists, such as an offline or
/// possible-but-absent CPU, belongs to no node and is never handed out by [`NumaTopology::cpus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaTopology {
    cpu_to_node: Vec<Option<usize>>,
    cpus_per_node: Vec<Vec<usize>>,
    distances: Vec<Vec<u32>>,
}

impl NumaTopology {
    /// Build a topology from a CPU to node mapping and a square distance matrix.
    pub fn from_parts(
        cpu_to_node: Vec<usize>,
        distances: Vec<Vec<u32>>,
    ) -> Result<Self, AutopinError> {
        let mut node_cpus = vec![Vec::new(); distances.len()];
        for (cpu, &node) in cpu_to_node.iter().enumerate() {
            let Some(cpus) = node_cpus.get_mut(node) else {
                return Err(AutopinError::InvalidTopologyIndex {
                    kind: TopologyIndexKind::Node,
                    index: node,
                    bound: distances.len(),
                });
            };
            cpus.push(cpu);
        }
        Self::from_node_cpus(cpu_to_node.len(), node_cpus, distances)
    }

    /// Build a topology from the CPU list of every node. Slots up to `cpu_count` that no node
    /// lists stay unassigned, CPUs listed beyond it extend the slot range.
    pub fn from_node_cpus(
        cpu_count: usize,
        node_cpus: Vec<Vec<usize>>,
        distances: Vec<Vec<u32>>,
    ) -> Result<Self, AutopinError> {
        let node_count = distances.len();
        if node_count == 0 || node_cpus.len() != node_count {
            return Err(AutopinError::InvalidTopologyIndex {
                kind: TopologyIndexKind::Node,
                index: node_cpus.len(),
                bound: node_count,
            });
        }
        if let Some(row) = distances.iter().find(|row| row.len() != node_count) {
            return Err(AutopinError::InvalidTopologyIndex {
                kind: TopologyIndexKind::Node,
                index: row.len(),
                bound: node_count,
            });
        }

        let listed = node_cpus.iter().flatten().max().map_or(0, |max| max + 1);
        let mut cpu_to_node = vec![None; cpu_count.max(listed)];
        let mut cpus_per_node = Vec::with_capacity(node_count);
        for (node, mut cpus) in node_cpus.into_iter().enumerate() {
            cpus.sort_unstable();
            cpus.dedup();
            for &cpu in &cpus {
                // A CPU belongs to exactly one node
                if cpu_to_node[cpu].replace(node).is_some() {
                    return Err(AutopinError::InvalidTopologyIndex {
                        kind: TopologyIndexKind::Cpu,
                        index: cpu,
                        bound: cpu_to_node.len(),
                    });
                }
            }
            cpus_per_node.push(cpus);
        }

        Ok(Self {
            cpu_to_node,
            cpus_per_node,
            distances,
        })
    }

    /// Uniform topology with every CPU on node 0.
    pub fn single_node(cpu_count: usize) -> Self {
        let cpu_count = cpu_count.max(1);
        Self {
            cpu_to_node: vec![Some(0); cpu_count],
            cpus_per_node: vec![(0..cpu_count).collect()],
            distances: vec![vec![LOCAL_DISTANCE]],
        }
    }

    pub fn discover() -> Result<Self, AutopinError> {
        Self::discover_from(Path::new(SYSFS_NODE_ROOT), configured_cpu_count())
    }

    /// Discover the topology, reporting any failure and falling back to a single node.
    pub fn discover_or_fallback() -> Self {
        match Self::discover() {
            Ok(topology) => topology,
            Err(err) => {
                warn!("{err}, assuming a single NUMA node");
                Self::single_node(configured_cpu_count())
            }
        }
    }

    /// Read the topology from a sysfs node directory. `cpu_count` is a lower bound on the
    /// number of CPU slots, CPUs listed by the nodes extend it.
    pub fn discover_from(root: &Path, cpu_count: usize) -> Result<Self, AutopinError> {
        let online_path = root.join("online");
        let nodes = parse_cpulist(&read_sysfs(&online_path)?)
            .map_err(|reason| invalid_data(&online_path, reason))?;
        if nodes.iter().copied().ne(0..nodes.len()) {
            return Err(invalid_data(
                &online_path,
                format!("non-contiguous node ids {nodes:?}"),
            ));
        }

        let mut node_cpus = Vec::with_capacity(nodes.len());
        let mut distances = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let node_dir = root.join(format!("node{node}"));

            let cpulist_path = node_dir.join("cpulist");
            let cpus = parse_cpulist(&read_sysfs(&cpulist_path)?)
                .map_err(|reason| invalid_data(&cpulist_path, reason))?;
            node_cpus.push(cpus);

            let distance_path = node_dir.join("distance");
            let row = read_sysfs(&distance_path)?
                .split_whitespace()
                .map(str::parse::<u32>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid_data(&distance_path, e.to_string()))?;
            if row.len() != nodes.len() {
                return Err(invalid_data(
                    &distance_path,
                    format!("expected {} distances, got {}", nodes.len(), row.len()),
                ));
            }
            distances.push(row);
        }

        let topology = Self::from_node_cpus(cpu_count, node_cpus, distances)?;
        debug!(
            "Discovered {} NUMA nodes and {} of {} CPUs from {}",
            topology.node_count(),
            topology.cpus().count(),
            topology.cpu_count(),
            root.display()
        );
        Ok(topology)
    }

    pub fn node_count(&self) -> usize {
        self.cpus_per_node.len()
    }

    /// Number of CPU slots, including those no node lists.
    pub fn cpu_count(&self) -> usize {
        self.cpu_to_node.len()
    }

    /// CPUs that belong to a node, ascending.
    pub fn cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpu_to_node
            .iter()
            .enumerate()
            .filter_map(|(cpu, node)| node.map(|_| cpu))
    }

    pub fn contains_cpu(&self, cpu: usize) -> bool {
        self.cpu_to_node.get(cpu).is_some_and(Option::is_some)
    }

    /// Node of `cpu`. Slots outside the range or listed by no node are invalid.
    pub fn node_of(&self, cpu: usize) -> Result<usize, AutopinError> {
        self.cpu_to_node
            .get(cpu)
            .copied()
            .flatten()
            .ok_or(AutopinError::InvalidTopologyIndex {
                kind: TopologyIndexKind::Cpu,
                index: cpu,
                bound: self.cpu_count(),
            })
    }

    /// CPUs of `node`, ascending.
    pub fn cpus_of(&self, node: usize) -> Result<&[usize], AutopinError> {
        self.cpus_per_node
            .get(node)
            .map(Vec::as_slice)
            .ok_or_else(|| self.invalid_node(node))
    }

    pub fn distance(&self, from: usize, to: usize) -> Result<u32, AutopinError> {
        let row = self.distances.get(from).ok_or_else(|| self.invalid_node(from))?;
        row.get(to).copied().ok_or_else(|| self.invalid_node(to))
    }

    fn invalid_node(&self, node: usize) -> AutopinError {
        AutopinError::InvalidTopologyIndex {
            kind: TopologyIndexKind::Node,
            index: node,
            bound: self.node_count(),
        }
    }

    pub fn log_topology(&self) {
        info!(
            "NUMA topology: {} nodes, {} CPUs",
            self.node_count(),
            self.cpu_count()
        );
        for (node, cpus) in self.cpus_per_node.iter().enumerate() {
            info!(
                "  Node {node}: CPUs {cpus:?}, distances {:?}",
                self.distances[node]
            );
        }
    }
}

/// Number of CPUs configured on the machine, online or not.
pub fn configured_cpu_count() -> usize {
    // SAFETY: sysconf has no preconditions
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if count < 1 { 1 } else { count as usize }
}

fn read_sysfs(path: &Path) -> Result<String, AutopinError> {
    std::fs::read_to_string(path).map_err(|source| AutopinError::TopologyUnavailable {
        path: PathBuf::from(path),
        source,
    })
}

fn invalid_data(path: &Path, reason: String) -> AutopinError {
    AutopinError::TopologyUnavailable {
        path: PathBuf::from(path),
        source: std::io::Error::new(ErrorKind::InvalidData, reason),
    }
}

/// Parse a kernel CPU list such as `0-7,16-23`.
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let parse = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid CPU list entry `{part}`: {e}"))
        };
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("invalid CPU range `{part}`"));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(parse(part)?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
