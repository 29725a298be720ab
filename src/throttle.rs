//! Admission loop and the handle used to submit requests to it.
//!
//! A [`Throttle`] owns nothing but the sending half of a bounded FIFO queue.
//! A single worker task holds the bucket, so every token mutation happens in
//! one place and requests are admitted strictly in the order they were queued.
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use log::{debug, info, trace, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketSnapshot, BucketState, Rate};
use crate::config::ThrottleConfig;
use crate::error::err_config;
use crate::{Error, Result};

/// Proof of admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Receipt {
    /// 0-based admission sequence number, equal to the enqueue order.
    pub order: u64,
    /// Tokens charged for this request.
    pub cost: f64,
    /// Time between enqueueing and admission.
    pub waited: Duration,
}

#[derive(Debug)]
pub(crate) enum ThrottleMessage {
    Take {
        cost: Option<f64>,
        rate: Rate,
        enqueued_at: Instant,
        respond_to: oneshot::Sender<Receipt>,
    },
    Inspect {
        respond_to: oneshot::Sender<BucketSnapshot>,
    },
}

/// The single consumer of the admission queue.
struct AdmissionWorker {
    receiver: Receiver<ThrottleMessage>,
    bucket: BucketState,
    cancel: CancellationToken,
}

impl AdmissionWorker {
    async fn run(mut self) {
        info!("admission worker started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = self.receiver.recv() => match msg {
                    Ok(msg) => msg,
                    // every handle is gone and the queue is drained
                    Err(_) => break,
                },
            };
            if !self.handle_message(msg).await {
                break;
            }
        }

        let abandoned = self.receiver.len();
        if abandoned > 0 {
            warn!("admission worker stopped with {abandoned} request(s) still queued");
        }
        self.receiver.close();
        info!(
            "admission worker stopped after admitting {} request(s)",
            self.bucket.snapshot().admitted
        );
    }

    /// Returns false when the worker was canceled mid-request.
    async fn handle_message(&mut self, msg: ThrottleMessage) -> bool {
        match msg {
            ThrottleMessage::Inspect { respond_to } => {
                let _ = respond_to.send(self.bucket.snapshot());
                true
            }
            ThrottleMessage::Take {
                cost,
                rate,
                enqueued_at,
                respond_to,
            } => {
                let cost = self.bucket.effective_cost(cost);
                self.bucket.set_rate(rate, Instant::now());

                if !self.wait_for_tokens(cost).await {
                    warn!("request of cost {cost} abandoned, throttle canceled");
                    return false;
                }

                let order = self.bucket.admit(cost);
                let receipt = Receipt {
                    order,
                    cost,
                    waited: enqueued_at.elapsed(),
                };
                debug!(
                    "admitted #{order} (cost {cost}) after {:?}, {:.3} tokens left",
                    receipt.waited,
                    self.bucket.tokens()
                );
                if respond_to.send(receipt).is_err() {
                    debug!("requester of #{order} went away before admission");
                }
                true
            }
        }
    }

    /// Sleep until the bucket covers `cost`. Returns false if canceled first.
    async fn wait_for_tokens(&mut self, cost: f64) -> bool {
        loop {
            self.bucket.refill(Instant::now());
            if self.bucket.is_sufficient(cost) {
                return true;
            }

            self.bucket.start_clock(Instant::now());
            let sleep = self.bucket.next_sleep(cost);
            trace!("{cost} tokens wanted, sleeping {sleep:?}");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

/// Awaitable admission outcome of one submitted request.
#[derive(Debug)]
pub struct Ticket {
    recv: oneshot::Receiver<Receipt>,
    cancel: CancellationToken,
}

impl Ticket {
    /// Wait for admission. Fails with [`Error::Canceled`] if the throttle
    /// stops first.
    pub async fn receipt(self) -> Result<Receipt> {
        let Ticket { recv, cancel } = self;
        tokio::select! {
            biased;
            receipt = recv => receipt.map_err(|_| Error::Canceled),
            _ = cancel.cancelled() => Err(Error::Canceled),
        }
    }

    /// Resolves to `true` exactly once, when the request is admitted.
    pub async fn admitted(self) -> Result<bool> {
        self.receipt().await.map(|_| true)
    }
}

/// Handle to a running throttle. Cheap to clone; every clone feeds the
/// same queue and bucket.
#[derive(Debug, Clone)]
pub struct Throttle {
    sender: Sender<ThrottleMessage>,
    cancel: CancellationToken,
}

impl Throttle {
    /// Validate `config` and spawn the admission worker on the current tokio
    /// runtime. The worker stops when `cancel` (or [`Throttle::stop`]) fires.
    pub fn new(cancel: CancellationToken, config: ThrottleConfig) -> Result<Self> {
        config.validate()?;
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| err_config!("throttle needs a tokio runtime: {e}"))?;

        let depth = if config.max_queue_depth == 0 {
            warn!("max_queue_depth 0 holds no waiting request, using 1");
            1
        } else {
            config.max_queue_depth
        };
        let (sender, receiver) = async_channel::bounded(depth);
        let cancel = cancel.child_token();
        let worker = AdmissionWorker {
            receiver,
            bucket: BucketState::from_config(&config),
            cancel: cancel.clone(),
        };
        rt.spawn(worker.run());
        debug!("throttle spawned with {config:?}");

        Ok(Self { sender, cancel })
    }

    fn request(&self, rate: Rate, cost: Option<f64>) -> Result<(ThrottleMessage, Ticket)> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if let Some(cost) = cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(err_config!("cost must be finite and non-negative, got {cost}"));
            }
        }

        let (respond_to, recv) = oneshot::channel();
        let msg = ThrottleMessage::Take {
            cost,
            rate,
            enqueued_at: Instant::now(),
            respond_to,
        };
        let ticket = Ticket {
            recv,
            cancel: self.cancel.clone(),
        };
        Ok((msg, ticket))
    }

    /// Queue a request and return its ticket. Waits for a free slot when the
    /// queue is at `max_queue_depth`. `cost: None` charges the default cost.
    pub async fn submit(
        &self,
        rate: impl Into<Rate>,
        cost: impl Into<Option<f64>>,
    ) -> Result<Ticket> {
        let (msg, ticket) = self.request(rate.into(), cost.into())?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            sent = self.sender.send(msg) => sent.map(|_| ticket).map_err(|_| Error::Canceled),
        }
    }

    /// Like [`Throttle::submit`] but fails with [`Error::QueueFull`] instead
    /// of waiting.
    pub fn try_submit(
        &self,
        rate: impl Into<Rate>,
        cost: impl Into<Option<f64>>,
    ) -> Result<Ticket> {
        let (msg, ticket) = self.request(rate.into(), cost.into())?;
        match self.sender.try_send(msg) {
            Ok(()) => Ok(ticket),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Error::Canceled),
        }
    }

    /// Submit and wait for admission.
    pub async fn take(
        &self,
        rate: impl Into<Rate>,
        cost: impl Into<Option<f64>>,
    ) -> Result<bool> {
        self.submit(rate, cost).await?.admitted().await
    }

    /// Bucket state as seen by the worker. Answered in queue order, so it
    /// reflects every request queued before it.
    pub async fn snapshot(&self) -> Result<BucketSnapshot> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let (respond_to, recv) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Canceled),
            sent = self.sender.send(ThrottleMessage::Inspect { respond_to }) => {
                sent.map_err(|_| Error::Canceled)?
            }
        }
        tokio::select! {
            biased;
            snapshot = recv => snapshot.map_err(|_| Error::Canceled),
            _ = self.cancel.cancelled() => Err(Error::Canceled),
        }
    }

    /// Stop the admission worker. Requests not yet admitted are abandoned
    /// and their tickets fail with [`Error::Canceled`].
    pub fn stop(&self) {
        info!("stopping throttle, {} request(s) queued", self.queued());
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the admission worker is still alive.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Number of requests waiting in the queue, not counting the one being served.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(num_tokens: f64, capacity: f64) -> ThrottleConfig {
        ThrottleConfig {
            num_tokens,
            capacity,
            refill_rate: 1.0,
            delay_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_without_runtime() {
        let res = Throttle::new(CancellationToken::new(), config(1.0, 1.0));
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_bad_config() {
        let res = Throttle::new(
            CancellationToken::new(),
            ThrottleConfig {
                delay_ms: 0,
                ..Default::default()
            },
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reject_bad_cost() {
        let throttle = Throttle::new(CancellationToken::new(), config(1.0, 1.0)).unwrap();
        assert!(matches!(
            throttle.try_submit(Rate::Current, -1.0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            throttle.submit(Rate::Current, f64::NAN).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_with_tokens_available() {
        let throttle = Throttle::new(CancellationToken::new(), config(3.0, 3.0)).unwrap();
        let receipt = throttle
            .submit(Rate::Current, 2.0)
            .await
            .unwrap()
            .receipt()
            .await
            .unwrap();
        assert_eq!(receipt.order, 0);
        assert_eq!(receipt.cost, 2.0);
        assert_eq!(receipt.waited, Duration::ZERO);

        let snapshot = throttle.snapshot().await.unwrap();
        assert_eq!(snapshot.tokens, 1.0);
        assert_eq!(snapshot.admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_cost_is_charged() {
        let throttle = Throttle::new(
            CancellationToken::new(),
            ThrottleConfig {
                default_cost: 2.0,
                ..config(5.0, 5.0)
            },
        )
        .unwrap();
        assert!(throttle.take(Rate::Current, None).await.unwrap());
        assert_eq!(throttle.snapshot().await.unwrap().tokens, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_rejects_new_requests() {
        let throttle = Throttle::new(CancellationToken::new(), config(1.0, 1.0)).unwrap();
        throttle.stop();
        assert!(throttle.is_stopped());
        assert!(matches!(
            throttle.submit(Rate::Current, None).await,
            Err(Error::Canceled)
        ));
        assert!(matches!(
            throttle.try_submit(Rate::Current, None),
            Err(Error::Canceled)
        ));
        assert!(matches!(throttle.snapshot().await, Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_only_affects_own_throttle() {
        let parent = CancellationToken::new();
        let a = Throttle::new(parent.clone(), config(1.0, 1.0)).unwrap();
        let b = Throttle::new(parent.clone(), config(1.0, 1.0)).unwrap();
        a.stop();
        assert!(!parent.is_cancelled());
        assert!(b.take(Rate::Current, None).await.unwrap());

        parent.cancel();
        assert!(b.is_stopped());
    }
}
