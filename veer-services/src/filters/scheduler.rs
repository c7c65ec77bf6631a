//! LIFO/FIFO admission queues attached to routes as filters.
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;
use futures::channel::oneshot;
use http::StatusCode;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

const SLOT_BAG_KEY_FIFO: &str = "scheduler.slot.fifo";
const SLOT_BAG_KEY_LIFO: &str = "scheduler.slot.lifo";

#[derive(Debug)]
enum AdmissionError {
    QueueFull,
    Timeout,
}

/// Bounded admission queue. A released slot is handed directly to the next
/// waiter: front of the deque for FIFO, back for LIFO.
struct AdmissionQueue {
    lifo: bool,
    max_active: usize,
    max_queue: usize,
    timeout: Duration,
    active: Cell<usize>,
    waiters: RefCell<VecDeque<oneshot::Sender<()>>>,
}

impl AdmissionQueue {
    fn new(lifo: bool, max_active: usize, max_queue: usize, timeout: Duration) -> Rc<Self> {
        Rc::new(Self {
            lifo,
            max_active,
            max_queue,
            timeout,
            active: Cell::new(0),
            waiters: RefCell::new(VecDeque::new()),
        })
    }

    async fn acquire(self: &Rc<Self>) -> Result<SlotGuard, AdmissionError> {
        if self.active.get() < self.max_active {
            self.active.set(self.active.get() + 1);
            return Ok(SlotGuard {
                queue: self.clone(),
            });
        }
        if self.waiters.borrow().len() >= self.max_queue {
            return Err(AdmissionError::QueueFull);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.borrow_mut().push_back(tx);
        match monoio::time::timeout(self.timeout, rx).await {
            // the releaser handed its slot over without touching `active`
            Ok(Ok(())) => Ok(SlotGuard {
                queue: self.clone(),
            }),
            Ok(Err(_)) | Err(_) => Err(AdmissionError::Timeout),
        }
    }

    fn release(&self) {
        loop {
            let next = if self.lifo {
                self.waiters.borrow_mut().pop_back()
            } else {
                self.waiters.borrow_mut().pop_front()
            };
            match next {
                // skip waiters that already timed out
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    self.active.set(self.active.get().saturating_sub(1));
                    return;
                }
            }
        }
    }
}

/// Holds one admission slot; dropping it (end of request, cancellation
/// included) admits the next waiter.
struct SlotGuard {
    queue: Rc<AdmissionQueue>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Admission filter. The queue lives on the filter instance, so a
/// reconfigured route gets a fresh queue while the old one drains with the
/// retired instance.
pub(super) struct SchedulerFilter {
    queue: Rc<AdmissionQueue>,
}

impl SchedulerFilter {
    fn create(args: &[Arg], lifo: bool) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(3)?;
        let max_active = args.u64_at(0)? as usize;
        let max_queue = args.u64_at(1)? as usize;
        let timeout = Duration::from_millis(args.u64_at(2)?);
        if max_active == 0 {
            return Err(CreateError::invalid_arg(0, "max active must be positive"));
        }
        Ok(Rc::new(Self {
            queue: AdmissionQueue::new(lifo, max_active, max_queue, timeout),
        }))
    }

    pub(super) fn create_fifo(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        Self::create(args, false)
    }

    pub(super) fn create_lifo(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        Self::create(args, true)
    }

    fn bag_key(&self) -> &'static str {
        if self.queue.lifo {
            SLOT_BAG_KEY_LIFO
        } else {
            SLOT_BAG_KEY_FIFO
        }
    }
}

#[async_trait(?Send)]
impl Filter for SchedulerFilter {
    async fn request(&self, ctx: &mut FilterContext) {
        match self.queue.acquire().await {
            Ok(guard) => {
                // parked in the state bag so the slot is held until the
                // request (and its response) is done
                ctx.state_bag_mut()
                    .insert(self.bag_key().to_string(), Rc::new(guard));
            }
            Err(e) => {
                ctx.metrics().incr(match e {
                    AdmissionError::QueueFull => "scheduler.rejected.queue-full",
                    AdmissionError::Timeout => "scheduler.rejected.timeout",
                });
                ctx.serve_status(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test(timer_enabled = true)]
    async fn filter_holds_slot_in_state_bag_and_rejects_when_full() {
        use monoio_http::common::body::{FixedBody, HttpBody};
        use veer_core::metrics::default_metrics;

        let filter = SchedulerFilter::create_fifo(&[
            Arg::Number(1.0),
            Arg::Number(0.0),
            Arg::Number(10.0),
        ])
        .unwrap();

        let ctx = || {
            let req = http::Request::builder()
                .uri("/")
                .body(HttpBody::fixed_body(None))
                .unwrap();
            veer_core::filter::FilterContext::new(
                req,
                "t".into(),
                None,
                default_metrics(),
                tracing::Span::none(),
            )
        };

        let mut holder = ctx();
        filter.request(&mut holder).await;
        assert!(!holder.is_served());
        assert!(holder.state_bag().contains_key(SLOT_BAG_KEY_FIFO));

        // the slot is taken and the queue has no capacity
        let mut rejected = ctx();
        filter.request(&mut rejected).await;
        assert!(rejected.is_served());
        assert_eq!(
            rejected.response().unwrap().status(),
            http::StatusCode::SERVICE_UNAVAILABLE
        );

        // dropping the first context frees the slot
        drop(holder);
        let mut admitted = ctx();
        filter.request(&mut admitted).await;
        assert!(!admitted.is_served());
    }

    #[monoio::test(timer_enabled = true)]
    async fn admits_up_to_max_active() {
        let q = AdmissionQueue::new(false, 2, 4, Duration::from_millis(50));
        let a = q.acquire().await.unwrap();
        let _b = q.acquire().await.unwrap();
        assert_eq!(q.active.get(), 2);
        drop(a);
        let _c = q.acquire().await.unwrap();
        assert_eq!(q.active.get(), 2);
    }

    #[monoio::test(timer_enabled = true)]
    async fn queue_full_rejects_immediately() {
        let q = AdmissionQueue::new(false, 1, 0, Duration::from_millis(50));
        let _held = q.acquire().await.unwrap();
        assert!(matches!(q.acquire().await, Err(AdmissionError::QueueFull)));
    }

    #[monoio::test(timer_enabled = true)]
    async fn waiter_times_out() {
        let q = AdmissionQueue::new(false, 1, 4, Duration::from_millis(10));
        let _held = q.acquire().await.unwrap();
        assert!(matches!(q.acquire().await, Err(AdmissionError::Timeout)));
    }

    #[monoio::test(timer_enabled = true)]
    async fn fifo_admits_in_arrival_order_lifo_in_reverse() {
        for (lifo, expected) in [(false, vec![1, 2]), (true, vec![2, 1])] {
            let q = AdmissionQueue::new(lifo, 1, 4, Duration::from_secs(1));
            let held = q.acquire().await.unwrap();
            let order = Rc::new(RefCell::new(Vec::new()));

            let t1 = {
                let q = q.clone();
                let order = order.clone();
                monoio::spawn(async move {
                    let _slot = q.acquire().await.unwrap();
                    order.borrow_mut().push(1);
                })
            };
            // let the first waiter enqueue before the second
            monoio::time::sleep(Duration::from_millis(1)).await;
            let t2 = {
                let q = q.clone();
                let order = order.clone();
                monoio::spawn(async move {
                    let _slot = q.acquire().await.unwrap();
                    order.borrow_mut().push(2);
                })
            };
            monoio::time::sleep(Duration::from_millis(1)).await;

            drop(held);
            t1.await;
            t2.await;
            assert_eq!(*order.borrow(), expected, "lifo={lifo}");
        }
    }
}
