//! Endpoint selection for LB backends.
//!
//! All algorithm state is worker-local (`Cell`-based): round-robin cursors,
//! per-endpoint in-flight counters and health flags need no locking because
//! a balancer instance is owned by one worker's route table.
use std::{
    cell::Cell,
    collections::BTreeMap,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};

use http::{
    uri::{Authority, Scheme},
    Uri,
};
use rand::Rng;

use crate::route::LbAlgorithm;

/// Total virtual points on the consistent-hash ring.
const RING_POINTS: usize = 1024;

/// Sample size for power-of-N-choices.
const P2C_CHOICES: usize = 2;

/// A concrete upstream target: scheme plus authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTarget {
    pub scheme: Scheme,
    pub authority: Authority,
}

impl NetworkTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, TargetError> {
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| TargetError::MissingHost(uri.to_string()))?;
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        Ok(Self { scheme, authority })
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    pub fn port(&self) -> u16 {
        self.authority.port_u16().unwrap_or(80)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    #[error("endpoint {0} has no host")]
    MissingHost(String),
}

/// One endpoint of a balanced set with its worker-local runtime state.
#[derive(Debug)]
pub struct LbEndpoint {
    target: NetworkTarget,
    healthy: Rc<Cell<bool>>,
    inflight: Rc<Cell<u64>>,
    fade_start: Cell<Option<Instant>>,
}

impl LbEndpoint {
    fn new(target: NetworkTarget) -> Self {
        Self {
            target,
            healthy: Rc::new(Cell::new(true)),
            inflight: Rc::new(Cell::new(0)),
            fade_start: Cell::new(None),
        }
    }

    pub fn target(&self) -> &NetworkTarget {
        &self.target
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.get()
    }

    /// Handle for external health probes.
    pub fn health(&self) -> EndpointHealth {
        EndpointHealth(self.healthy.clone())
    }

    fn fade_progress(&self, fade_in: Option<Duration>, now: Instant) -> f64 {
        match (self.fade_start.get(), fade_in) {
            (Some(start), Some(window)) if !window.is_zero() => {
                let elapsed = now.saturating_duration_since(start);
                if elapsed >= window {
                    self.fade_start.set(None);
                    1.0
                } else {
                    elapsed.as_secs_f64() / window.as_secs_f64()
                }
            }
            _ => 1.0,
        }
    }
}

/// Settable health flag shared with the owning endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHealth(Rc<Cell<bool>>);

impl EndpointHealth {
    pub fn set_healthy(&self, healthy: bool) {
        self.0.set(healthy);
    }

    pub fn is_healthy(&self) -> bool {
        self.0.get()
    }
}

/// RAII in-flight marker around one upstream call; decrements on drop, which
/// covers cancellation.
pub struct InflightGuard {
    counter: Rc<Cell<u64>>,
}

impl InflightGuard {
    fn acquire(counter: Rc<Cell<u64>>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

/// Key material for keyed algorithms; defaults to remote address + path.
pub struct PickKey<'a> {
    pub remote_addr: Option<SocketAddr>,
    pub path: &'a str,
}

impl PickKey<'_> {
    fn hash(&self) -> u64 {
        let mut hash = fnv1a_init();
        if let Some(addr) = self.remote_addr {
            hash = fnv1a_update(hash, addr.ip().to_string().as_bytes());
        }
        fnv1a_update(hash, self.path.as_bytes())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LbError {
    #[error("empty endpoint set")]
    EmptyEndpoints,
}

pub struct Pick<'a> {
    pub target: &'a NetworkTarget,
    pub guard: InflightGuard,
}

pub struct LoadBalancer {
    algorithm: LbAlgorithm,
    endpoints: Vec<LbEndpoint>,
    rr_cursor: Cell<usize>,
    ring: BTreeMap<u64, usize>,
    fade_in: Option<Duration>,
}

impl LoadBalancer {
    pub fn new(
        algorithm: LbAlgorithm,
        targets: Vec<NetworkTarget>,
        fade_in: Option<Duration>,
    ) -> Result<Self, LbError> {
        if targets.is_empty() {
            return Err(LbError::EmptyEndpoints);
        }
        let endpoints: Vec<_> = targets.into_iter().map(LbEndpoint::new).collect();
        let ring = if algorithm == LbAlgorithm::ConsistentHash {
            build_ring(&endpoints)
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            algorithm,
            endpoints,
            rr_cursor: Cell::new(0),
            ring,
            fade_in,
        })
    }

    pub fn endpoints(&self) -> &[LbEndpoint] {
        &self.endpoints
    }

    /// Carry fade state over from the previous generation of this balancer:
    /// endpoints that did not exist before enter their fade window now,
    /// endpoints still fading keep their original start.
    pub fn start_fade_for_new(&self, prev: Option<&LoadBalancer>) {
        let Some(prev) = prev else { return };
        if self.fade_in.is_none() {
            return;
        }
        for ep in &self.endpoints {
            match prev
                .endpoints
                .iter()
                .find(|p| p.target.authority == ep.target.authority)
            {
                Some(old) => ep.fade_start.set(old.fade_start.get()),
                None => ep.fade_start.set(Some(Instant::now())),
            }
        }
    }

    /// Pick one endpoint. Unhealthy endpoints are skipped; when every
    /// endpoint is unhealthy the full set is used instead.
    pub fn pick(&self, key: &PickKey<'_>) -> Pick<'_> {
        let healthy: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].healthy.get())
            .collect();
        let candidates = if healthy.is_empty() {
            (0..self.endpoints.len()).collect()
        } else {
            healthy
        };

        let index = match self.algorithm {
            LbAlgorithm::RoundRobin => {
                let cursor = self.rr_cursor.get();
                self.rr_cursor.set(cursor.wrapping_add(1));
                candidates[cursor % candidates.len()]
            }
            LbAlgorithm::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            LbAlgorithm::ConsistentHash => self.pick_ring(key, &candidates),
            LbAlgorithm::PowerOfRandomNChoices => self.pick_p2c(&candidates),
        };

        let index = self.adjust_for_fade(index, &candidates);
        let ep = &self.endpoints[index];
        Pick {
            target: &ep.target,
            guard: InflightGuard::acquire(ep.inflight.clone()),
        }
    }

    fn pick_ring(&self, key: &PickKey<'_>, candidates: &[usize]) -> usize {
        let hash = key.hash();
        // Next live endpoint clockwise from the key's position.
        self.ring
            .range(hash..)
            .chain(self.ring.range(..hash))
            .map(|(_, &i)| i)
            .find(|i| candidates.contains(i))
            .unwrap_or(candidates[0])
    }

    fn pick_p2c(&self, candidates: &[usize]) -> usize {
        let mut rng = rand::thread_rng();
        let mut best = candidates[rng.gen_range(0..candidates.len())];
        for _ in 1..P2C_CHOICES.min(candidates.len()) {
            let other = candidates[rng.gen_range(0..candidates.len())];
            if self.endpoints[other].inflight.get() < self.endpoints[best].inflight.get() {
                best = other;
            }
        }
        best
    }

    /// During an endpoint's fade window, divert a proportional share of its
    /// traffic to fully ramped candidates.
    fn adjust_for_fade(&self, index: usize, candidates: &[usize]) -> usize {
        let now = Instant::now();
        let progress = self.endpoints[index].fade_progress(self.fade_in, now);
        if progress >= 1.0 {
            return index;
        }
        let ramped: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| i != index && self.endpoints[i].fade_progress(self.fade_in, now) >= 1.0)
            .collect();
        if ramped.is_empty() {
            return index;
        }
        let mut rng = rand::thread_rng();
        if rng.gen_range(0.0..1.0) < progress {
            index
        } else {
            ramped[rng.gen_range(0..ramped.len())]
        }
    }
}

const fn fnv1a_init() -> u64 {
    14695981039346656037
}

fn fnv1a_update(mut hash: u64, data: &[u8]) -> u64 {
    const FNV_PRIME: u64 = 1099511628211;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn build_ring(endpoints: &[LbEndpoint]) -> BTreeMap<u64, usize> {
    let points_per_endpoint = (RING_POINTS / endpoints.len()).max(1);
    let mut ring = BTreeMap::new();
    for (index, ep) in endpoints.iter().enumerate() {
        for vnode in 0..points_per_endpoint {
            let key = format!("{}:{}", ep.target.authority, vnode);
            let hash = fnv1a_update(fnv1a_init(), key.as_bytes());
            ring.insert(hash, index);
        }
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<NetworkTarget> {
        (0..n)
            .map(|i| {
                NetworkTarget::from_uri(&format!("http://10.0.0.{}:80", i + 1).parse().unwrap())
                    .unwrap()
            })
            .collect()
    }

    fn key<'a>(path: &'a str) -> PickKey<'a> {
        PickKey {
            remote_addr: Some("127.0.0.1:9999".parse().unwrap()),
            path,
        }
    }

    #[test]
    fn round_robin_alternates() {
        let lb = LoadBalancer::new(LbAlgorithm::RoundRobin, targets(2), None).unwrap();
        let first = lb.pick(&key("/")).target.authority.clone();
        let second = lb.pick(&key("/")).target.authority.clone();
        let third = lb.pick(&key("/")).target.authority.clone();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn consistent_hash_is_stable_per_key() {
        let lb = LoadBalancer::new(LbAlgorithm::ConsistentHash, targets(5), None).unwrap();
        let a = lb.pick(&key("/users/1")).target.authority.clone();
        for _ in 0..10 {
            assert_eq!(a, lb.pick(&key("/users/1")).target.authority);
        }
    }

    #[test]
    fn consistent_hash_spreads_keys() {
        let lb = LoadBalancer::new(LbAlgorithm::ConsistentHash, targets(5), None).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let path = format!("/k/{i}");
            seen.insert(lb.pick(&key(&path)).target.authority.clone());
        }
        assert!(seen.len() >= 3, "expected spread, got {seen:?}");
    }

    #[test]
    fn p2c_prefers_less_loaded() {
        let lb =
            LoadBalancer::new(LbAlgorithm::PowerOfRandomNChoices, targets(2), None).unwrap();
        // Hold a pile of guards on endpoint 0.
        let loaded = &lb.endpoints()[0];
        let _guards: Vec<_> = (0..64)
            .map(|_| InflightGuard::acquire(loaded.inflight.clone()))
            .collect();
        let mut hits_unloaded = 0;
        for _ in 0..100 {
            let pick = lb.pick(&key("/"));
            if pick.target.authority == lb.endpoints()[1].target.authority {
                hits_unloaded += 1;
            }
        }
        assert!(hits_unloaded > 60, "p2c skewed: {hits_unloaded}");
    }

    #[test]
    fn inflight_guard_decrements_on_drop() {
        let lb = LoadBalancer::new(LbAlgorithm::RoundRobin, targets(1), None).unwrap();
        {
            let _pick = lb.pick(&key("/"));
            assert_eq!(lb.endpoints()[0].inflight(), 1);
        }
        assert_eq!(lb.endpoints()[0].inflight(), 0);
    }

    #[test]
    fn unhealthy_endpoints_are_skipped() {
        let lb = LoadBalancer::new(LbAlgorithm::RoundRobin, targets(2), None).unwrap();
        lb.endpoints()[0].health().set_healthy(false);
        for _ in 0..10 {
            assert_eq!(
                lb.pick(&key("/")).target.authority,
                lb.endpoints()[1].target().authority
            );
        }
    }

    #[test]
    fn all_unhealthy_falls_back_to_full_set() {
        let lb = LoadBalancer::new(LbAlgorithm::RoundRobin, targets(2), None).unwrap();
        for ep in lb.endpoints() {
            ep.health().set_healthy(false);
        }
        let first = lb.pick(&key("/")).target.authority.clone();
        let second = lb.pick(&key("/")).target.authority.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn fading_endpoint_receives_less_traffic() {
        let lb = LoadBalancer::new(
            LbAlgorithm::RoundRobin,
            targets(2),
            Some(Duration::from_secs(3600)),
        )
        .unwrap();
        // Endpoint 0 just entered its fade window.
        lb.endpoints()[0].fade_start.set(Some(Instant::now()));
        let mut faded_hits = 0;
        for _ in 0..100 {
            if lb.pick(&key("/")).target.authority == lb.endpoints()[0].target().authority {
                faded_hits += 1;
            }
        }
        assert!(faded_hits < 20, "fade had no effect: {faded_hits}");
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(matches!(
            LoadBalancer::new(LbAlgorithm::RoundRobin, Vec::new(), None),
            Err(LbError::EmptyEndpoints)
        ));
    }
}
