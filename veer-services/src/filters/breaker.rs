//! Circuit breakers attached to routes as filters.
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use tracing::info;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

const BREAKER_BAG_KEY: &str = "breaker.admitted";
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Policy {
    /// Open after N consecutive failures.
    Consecutive(usize),
    /// Open when the sliding window of the last `window` outcomes holds at
    /// least `failures` failures.
    Rate { failures: usize, window: usize },
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_inflight: bool },
}

struct BreakerCore {
    policy: Policy,
    open_timeout: Duration,
    state: State,
    consecutive_failures: usize,
    window: VecDeque<bool>,
}

impl BreakerCore {
    fn new(policy: Policy, open_timeout: Duration) -> Self {
        Self {
            policy,
            open_timeout,
            state: State::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        match &mut self.state {
            State::Closed => true,
            State::Open { since } => {
                if now.duration_since(*since) >= self.open_timeout {
                    self.state = State::HalfOpen {
                        probe_inflight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_inflight } => {
                if *probe_inflight {
                    false
                } else {
                    *probe_inflight = true;
                    true
                }
            }
        }
    }

    fn record(&mut self, success: bool, now: Instant) {
        match self.state {
            State::HalfOpen { .. } => {
                if success {
                    self.reset();
                } else {
                    self.trip(now);
                }
            }
            State::Closed => {
                if success {
                    self.consecutive_failures = 0;
                } else {
                    self.consecutive_failures += 1;
                }
                if let Policy::Rate { window, .. } = self.policy {
                    self.window.push_back(success);
                    while self.window.len() > window {
                        self.window.pop_front();
                    }
                }
                if self.should_trip() {
                    self.trip(now);
                }
            }
            State::Open { .. } => {}
        }
    }

    fn should_trip(&self) -> bool {
        match self.policy {
            Policy::Consecutive(n) => self.consecutive_failures >= n,
            Policy::Rate { failures, window } => {
                self.window.len() >= window
                    && self.window.iter().filter(|ok| !**ok).count() >= failures
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = State::Open { since: now };
    }

    fn reset(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.window.clear();
    }
}

/// Worker-local registry of breaker state, keyed by route id so that a
/// recreated filter instance keeps the route's breaker history.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RefCell<HashMap<(String, PolicyKey), Rc<RefCell<BreakerCore>>>>,
}

type PolicyKey = (u8, usize, usize);

fn policy_key(policy: Policy) -> PolicyKey {
    match policy {
        Policy::Consecutive(n) => (0, n, 0),
        Policy::Rate { failures, window } => (1, failures, window),
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, route_id: &str, policy: Policy) -> Rc<RefCell<BreakerCore>> {
        self.breakers
            .borrow_mut()
            .entry((route_id.to_string(), policy_key(policy)))
            .or_insert_with(|| {
                Rc::new(RefCell::new(BreakerCore::new(policy, DEFAULT_OPEN_TIMEOUT)))
            })
            .clone()
    }
}

pub(super) struct BreakerFilter {
    registry: Rc<BreakerRegistry>,
    policy: Policy,
}

impl BreakerFilter {
    pub(super) fn create_consecutive(
        registry: Rc<BreakerRegistry>,
        args: &[Arg],
    ) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        let n = args.u64_at(0)? as usize;
        if n == 0 {
            return Err(CreateError::invalid_arg(0, "threshold must be positive"));
        }
        Ok(Rc::new(Self {
            registry,
            policy: Policy::Consecutive(n),
        }))
    }

    pub(super) fn create_rate(
        registry: Rc<BreakerRegistry>,
        args: &[Arg],
    ) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        let failures = args.u64_at(0)? as usize;
        let window = args.u64_at(1)? as usize;
        if failures == 0 || window < failures {
            return Err(CreateError::invalid_arg(
                1,
                "window must be at least the failure threshold",
            ));
        }
        Ok(Rc::new(Self {
            registry,
            policy: Policy::Rate { failures, window },
        }))
    }

    fn core(&self, ctx: &FilterContext) -> Rc<RefCell<BreakerCore>> {
        let route_id = ctx.route_id().unwrap_or("-");
        self.registry.get_or_create(route_id, self.policy)
    }
}

#[async_trait(?Send)]
impl Filter for BreakerFilter {
    async fn request(&self, ctx: &mut FilterContext) {
        let core = self.core(ctx);
        let allowed = core.borrow_mut().allow(Instant::now());
        if allowed {
            ctx.state_bag_mut()
                .insert(BREAKER_BAG_KEY.to_string(), Rc::new(true));
        } else {
            ctx.metrics().incr("breaker.open");
            info!(route = ctx.route_id().unwrap_or("-"), "breaker open, request rejected");
            ctx.serve_status(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    async fn response(&self, ctx: &mut FilterContext) {
        if ctx.state_bag_mut().remove(BREAKER_BAG_KEY).is_none() {
            // this request was rejected by the breaker itself
            return;
        }
        let success = ctx
            .response()
            .map(|resp| !resp.status().is_server_error())
            .unwrap_or(false);
        self.core(ctx).borrow_mut().record(success, Instant::now());
    }
}
