//! Placement: an immutable, versioned consistent-hash model. Given a node's
//! hdist blob, `hashnodes` returns the same ordered replica set for a given
//! hash on every node that holds that blob — the single invariant the rest
//! of the engine leans on to avoid a coordination round-trip on every read.

mod murmur;

use hashfs_util::{einval, Result};

pub const HDIST_SEED: u64 = 0x1337;
pub const MURMUR_SEED: u64 = 0xacab;

pub use murmur::murmur64a;

pub type NodeId = [u8; 16];

/// One node's placement weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub node: NodeId,
    pub public_addr: String,
    pub internal_addr: String,
    pub capacity: u64,
}

/// A single placement snapshot: the ordered membership and weights that a
/// seed is scored against. `locate` never mutates a `Build` — rebalance
/// produces a new one and wraps it alongside the outgoing build in a
/// [`Distribution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub seed: u64,
    pub nodes: Vec<NodeEntry>,
}

impl Build {
    /// Highest-random-weight (rendezvous) scoring: deterministic given
    /// `(seed64, node)`, capacity-weighted, and stable across every node
    /// that holds the same `Build` — no shared mutable state is needed to
    /// agree on an ordering.
    fn score(&self, node: &NodeEntry, seed64: u64) -> (u64, NodeId) {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&seed64.to_le_bytes());
        buf.extend_from_slice(&self.seed.to_le_bytes());
        buf.extend_from_slice(&node.node);
        let h = murmur64a(&buf, MURMUR_SEED);
        // Scale the raw hash by capacity so higher-capacity nodes win ties
        // more often, without ever letting a zero-capacity node rank above
        // a nonzero one.
        let weighted = h.wrapping_mul(node.capacity.max(1));
        // Tie-break on node id so the ordering is total even if two nodes
        // hash identically (capacity 0 vs 0, pathological test inputs).
        (weighted, node.node)
    }

    pub fn ordered_nodes(&self, seed64: u64) -> Vec<NodeId> {
        let mut scored: Vec<((u64, NodeId), NodeId)> = self
            .nodes
            .iter()
            .map(|n| (self.score(n, seed64), n.node))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, id)| id).collect()
    }

    pub fn locate(&self, seed64: u64, replica_count: usize) -> Vec<NodeId> {
        let mut ordered = self.ordered_nodes(seed64);
        ordered.truncate(replica_count.min(self.nodes.len()));
        ordered
    }
}

/// Which build(s) a lookup is scored against. Non-goals of the moment
/// (stable operation) only ever use `Next`; the other three variants exist
/// for the rebalance window (§4.1/§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    /// Placement under the target distribution; used for new writes.
    Next,
    /// Placement under the outgoing distribution; valid only mid-rebalance.
    Prev,
    /// Read side: prefer the first-known location, since an unmigrated
    /// block still lives on its old owner.
    PrevUnionNext,
    /// Delete/decref side: reach every historical owner.
    NextUnionPrev,
}

/// An immutable blob carrying one build (stable) or two (rebalancing), plus
/// a monotonic version used to tell pre- and post-rebalance `use` rows apart
/// (§3 "Age").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    version: u64,
    next: Build,
    prev: Option<Build>,
}

impl Distribution {
    pub fn stable(version: u64, next: Build) -> Distribution {
        Distribution {
            version,
            next,
            prev: None,
        }
    }

    pub fn rebalancing(version: u64, prev: Build, next: Build) -> Distribution {
        Distribution {
            version,
            next,
            prev: Some(prev),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_rebalancing(&self) -> bool {
        self.prev.is_some()
    }

    pub fn next(&self) -> &Build {
        &self.next
    }

    pub fn prev(&self) -> Option<&Build> {
        self.prev.as_ref()
    }

    /// Collapse a two-build distribution back to one, bumping the version.
    /// Called once a rebalance finishes migrating everything to `next`.
    pub fn set_rebalanced(&self) -> Distribution {
        Distribution {
            version: self.version + 1,
            next: self.next.clone(),
            prev: None,
        }
    }

    fn max_replica(&self) -> usize {
        match &self.prev {
            Some(p) => self.next.nodes.len().min(p.nodes.len()),
            None => self.next.nodes.len(),
        }
    }

    /// `replica` is 1-based, over the range `1 <= replica <= N`.
    pub fn hashnodes(&self, which: Which, hash: &[u8], replica: usize) -> Result<Vec<NodeId>> {
        let max = self.max_replica();
        if replica == 0 || replica > max {
            return Err(einval(format!(
                "replica {replica} out of range 1..={max}"
            )));
        }
        if matches!(which, Which::Prev) && self.prev.is_none() {
            return Err(einval("no previous distribution: cluster is not rebalancing"));
        }

        let seed64 = murmur64a(hash, HDIST_SEED);
        match which {
            Which::Next => Ok(vec![self.next.locate(seed64, replica)[replica - 1]]),
            Which::Prev => {
                let prev = self.prev.as_ref().expect("checked above");
                Ok(vec![prev.locate(seed64, replica)[replica - 1]])
            }
            Which::PrevUnionNext => Ok(self.union(seed64, replica, true)),
            Which::NextUnionPrev => Ok(self.union(seed64, replica, false)),
        }
    }

    /// Ordered replica list (all replicas 1..=replica, not just one slot),
    /// used by callers that want the whole placement, e.g. `block_put`'s
    /// propagation fan-out.
    pub fn hashnodes_all(&self, which: Which, hash: &[u8], replica_count: usize) -> Result<Vec<NodeId>> {
        let max = self.max_replica();
        let replica_count = replica_count.min(max);
        let seed64 = murmur64a(hash, HDIST_SEED);
        match which {
            Which::Next => Ok(self.next.locate(seed64, replica_count)),
            Which::Prev => {
                let prev = self
                    .prev
                    .as_ref()
                    .ok_or_else(|| einval("no previous distribution"))?;
                Ok(prev.locate(seed64, replica_count))
            }
            Which::PrevUnionNext => Ok(self.union_all(seed64, replica_count, true)),
            Which::NextUnionPrev => Ok(self.union_all(seed64, replica_count, false)),
        }
    }

    fn union(&self, seed64: u64, replica: usize, prev_first: bool) -> Vec<NodeId> {
        self.union_all(seed64, replica, prev_first)
            .into_iter()
            .skip(replica.saturating_sub(1))
            .take(1)
            .collect()
    }

    fn union_all(&self, seed64: u64, replica_count: usize, prev_first: bool) -> Vec<NodeId> {
        let next_list = self.next.locate(seed64, replica_count);
        let prev_list = self
            .prev
            .as_ref()
            .map(|p| p.locate(seed64, replica_count))
            .unwrap_or_default();
        let (first, second) = if prev_first {
            (prev_list, next_list)
        } else {
            (next_list, prev_list)
        };
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for id in first.into_iter().chain(second) {
            if seen.insert(id) {
                out.push(id);
            }
        }
        out
    }
}

/// Flat binary encode/decode for the blob, since the engine never parses or
/// emits JSON (§1).
pub mod wire {
    use super::*;
    use hashfs_util::fail_einternal;

    pub fn encode(d: &Distribution) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(if d.is_rebalancing() { 2 } else { 1 });
        out.extend_from_slice(&d.version.to_le_bytes());
        if let Some(prev) = &d.prev {
            encode_build(prev, &mut out);
        }
        encode_build(&d.next, &mut out);
        out
    }

    fn encode_build(b: &Build, out: &mut Vec<u8>) {
        out.extend_from_slice(&b.seed.to_le_bytes());
        out.extend_from_slice(&(b.nodes.len() as u32).to_le_bytes());
        for n in &b.nodes {
            out.extend_from_slice(&n.node);
            encode_str(&n.public_addr, out);
            encode_str(&n.internal_addr, out);
            out.extend_from_slice(&n.capacity.to_le_bytes());
        }
    }

    fn encode_str(s: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Distribution> {
        let mut c = Cursor { buf: bytes, pos: 0 };
        let build_count = c.u8()?;
        let version = c.u64()?;
        let (prev, next) = match build_count {
            1 => (None, decode_build(&mut c)?),
            2 => {
                let prev = decode_build(&mut c)?;
                let next = decode_build(&mut c)?;
                (Some(prev), next)
            }
            other => return Err(fail_einternal(format!("bad hdist build count {other}"))),
        };
        Ok(Distribution { version, next, prev })
    }

    fn decode_build(c: &mut Cursor) -> Result<Build> {
        let seed = c.u64()?;
        let count = c.u32()? as usize;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut node = [0u8; 16];
            node.copy_from_slice(c.bytes(16)?);
            let public_addr = c.string()?;
            let internal_addr = c.string()?;
            let capacity = c.u64()?;
            nodes.push(NodeEntry {
                node,
                public_addr,
                internal_addr,
                capacity,
            });
        }
        Ok(Build { seed, nodes })
    }

    struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
            if self.pos + n > self.buf.len() {
                return Err(fail_einternal("hdist blob truncated"));
            }
            let s = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(s)
        }

        fn u8(&mut self) -> Result<u8> {
            Ok(self.bytes(1)?[0])
        }

        fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
        }

        fn u64(&mut self) -> Result<u64> {
            Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
        }

        fn string(&mut self) -> Result<String> {
            let len = self.u32()? as usize;
            let raw = self.bytes(len)?;
            String::from_utf8(raw.to_vec())
                .map_err(|e| fail_einternal(format!("hdist blob has invalid utf8: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8, capacity: u64) -> NodeEntry {
        NodeEntry {
            node: [byte; 16],
            public_addr: format!("10.0.0.{byte}:443"),
            internal_addr: format!("192.168.0.{byte}:443"),
            capacity,
        }
    }

    fn three_node_build() -> Build {
        Build {
            seed: 0x1337,
            nodes: vec![node(1, 100), node(2, 100), node(3, 100)],
        }
    }

    #[test]
    fn placement_is_stable_across_equivalent_builds() {
        // Same blob content, independently constructed, must agree: this is
        // the "every node computes an identical ordered list" invariant.
        let a = Distribution::stable(1, three_node_build());
        let b = Distribution::stable(1, three_node_build());
        let hash = b"some-content-hash-bytes";
        let la = a.hashnodes_all(Which::Next, hash, 2).unwrap();
        let lb = b.hashnodes_all(Which::Next, hash, 2).unwrap();
        assert_eq!(la, lb);
        assert_eq!(la.len(), 2);
    }

    #[test]
    fn replica_out_of_range_is_einval() {
        let d = Distribution::stable(1, three_node_build());
        let err = d.hashnodes(Which::Next, b"h", 4).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EInval);
    }

    #[test]
    fn prev_requires_rebalancing() {
        let d = Distribution::stable(1, three_node_build());
        assert!(d.hashnodes(Which::Prev, b"h", 1).is_err());
    }

    #[test]
    fn union_dedups_nodes_present_in_both_builds() {
        let prev = Build {
            seed: 1,
            nodes: vec![node(1, 100), node(2, 100)],
        };
        let next = Build {
            seed: 1,
            nodes: vec![node(1, 100), node(2, 100), node(3, 100)],
        };
        let d = Distribution::rebalancing(2, prev, next);
        let union = d.hashnodes_all(Which::NextUnionPrev, b"h", 2).unwrap();
        let mut seen = std::collections::HashSet::new();
        for n in &union {
            assert!(seen.insert(*n), "union must not repeat a node");
        }
    }

    #[test]
    fn wire_roundtrip_stable() {
        let d = Distribution::stable(7, three_node_build());
        let bytes = wire::encode(&d);
        let back = wire::decode(&bytes).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn wire_roundtrip_rebalancing() {
        let prev = three_node_build();
        let next = Build {
            seed: 0x1337,
            nodes: vec![node(1, 100), node(2, 100), node(3, 100), node(4, 50)],
        };
        let d = Distribution::rebalancing(9, prev, next);
        let bytes = wire::encode(&d);
        let back = wire::decode(&bytes).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn set_rebalanced_collapses_to_one_build_and_bumps_version() {
        let d = Distribution::rebalancing(3, three_node_build(), three_node_build());
        let collapsed = d.set_rebalanced();
        assert!(!collapsed.is_rebalancing());
        assert_eq!(collapsed.version(), 4);
    }
}
