use crate::protocol::{Frame, Outbound};
use std::pin;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("scheduling a command on the bus failed, the worker is gone")]
    Schedule,
    #[error("the bus worker went away before completing the command")]
    WorkerGone,
    #[error("could not hand the frame to the transport")]
    Send(#[source] std::io::Error),
}

/// Tunables for pacing the shared half-duplex bus.
#[derive(clap::Parser, Clone)]
#[group(id = "bus::Args")]
pub struct Args {
    /// The gap to leave between consecutive outgoing frames.
    ///
    /// The panel protocol does not tolerate back-to-back frames; sends are paced by
    /// this much regardless of which producer queued them.
    #[arg(long, default_value = "50ms")]
    pub frame_spacing: humantime::Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self { frame_spacing: Duration::from_millis(50).into() }
    }
}

/// Byte-level transport collaborator.
///
/// Implementations deliver fully de-framed, checksum-validated frames and own the
/// connection-loss/reconnect policy. `recv` must be cancel-safe; the worker polls it
/// inside a `select!` loop.
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send;
    fn recv(&mut self) -> impl Future<Output = Option<Frame>> + Send;
}

/// The single completion outcome of one [`Outbound`] attempt cycle.
#[derive(Debug)]
pub enum SendOutcome {
    /// The expected response arrived. Carries the matching frame.
    Acked(Frame),
    /// No matcher was attached; the frame went out and that is all we can say.
    Sent,
    /// Every attempt ran out its ack window.
    TimedOut { attempts: u8 },
}

struct Job {
    outbound: Outbound,
    done: oneshot::Sender<SendOutcome>,
}

/// Cloneable producer handle into the bus send queue.
///
/// The queue is the serialization point for the whole adapter: configuration drains
/// and interactive commands are peer producers into the same FIFO, so neither can
/// starve the other as long as each awaits its outcome before queueing more.
#[derive(Clone)]
pub struct BusHandle {
    jobs: UnboundedSender<Job>,
}

impl BusHandle {
    /// Sends one outbound and waits for its single completion outcome.
    pub async fn send(&self, outbound: Outbound) -> Result<SendOutcome, Error> {
        let (done, rx) = oneshot::channel();
        self.jobs.send(Job { outbound, done }).map_err(|_| Error::Schedule)?;
        rx.await.map_err(|_| Error::WorkerGone)
    }
}

pub struct Bus {
    jobs: UnboundedSender<Job>,
    pub worker: tokio::task::JoinHandle<Result<(), Error>>,
}

impl Bus {
    /// Spawns the worker over `transport`. The returned receiver carries every inbound
    /// frame that did not match the in-flight request (status broadcasts, version
    /// change notifications).
    pub fn spawn<T: Transport>(transport: T, args: Args) -> (Bus, UnboundedReceiver<Frame>) {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (unsolicited, unsolicited_rx) = mpsc::unbounded_channel();
        let worker = BusWorker { transport, unsolicited, spacing: *args.frame_spacing };
        let worker = tokio::task::spawn(worker.main_loop(jobs_rx));
        (Bus { jobs, worker }, unsolicited_rx)
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle { jobs: self.jobs.clone() }
    }
}

struct InFlight {
    job: Job,
    /// Frames sent so far for this job, the initial attempt included.
    attempts: u8,
}

struct BusWorker<T> {
    transport: T,
    unsolicited: UnboundedSender<Frame>,
    spacing: Duration,
}

/// What the select loop decided to do next. Sending happens outside the `select!`
/// so nothing borrows the transport while its receive future is alive.
enum Step {
    Inbound(Option<Frame>),
    AckWindowElapsed,
    NextJob(Option<Job>),
    GapOpened,
}

impl<T: Transport> BusWorker<T> {
    async fn main_loop(mut self, mut jobs: UnboundedReceiver<Job>) -> Result<(), Error> {
        let mut inflight: Option<InFlight> = None;
        let mut gap = pin::pin!(tokio::time::sleep_until(Instant::now()));
        let mut ack_deadline = pin::pin!(tokio::time::sleep_until(Instant::now()));
        loop {
            let time_to_send = gap.is_elapsed() && inflight.is_none();
            let step = tokio::select! {
                biased;
                frame = self.transport.recv() => Step::Inbound(frame),
                _ = &mut ack_deadline, if inflight.is_some() => Step::AckWindowElapsed,
                job = jobs.recv(), if time_to_send => Step::NextJob(job),
                // Wakes us back up once the inter-frame gap opens so the job branch
                // above becomes eligible again.
                _ = &mut gap, if !time_to_send && inflight.is_none() => Step::GapOpened,
            };
            match step {
                Step::Inbound(Some(frame)) => self.handle_frame(frame, &mut inflight),
                Step::Inbound(None) => {
                    // Transport closed for good. Anything in flight will never see
                    // its response.
                    if let Some(inf) = inflight.take() {
                        let _ = inf.job.done.send(SendOutcome::TimedOut { attempts: inf.attempts });
                    }
                    return Ok(());
                }
                Step::AckWindowElapsed => {
                    let exhausted = inflight
                        .as_ref()
                        .is_some_and(|inf| inf.attempts > inf.job.outbound.retries);
                    if exhausted {
                        if let Some(inf) = inflight.take() {
                            debug!(
                                message = "retry budget exhausted",
                                action = inf.job.outbound.action,
                                attempts = inf.attempts,
                            );
                            let _ = inf.job.done.send(SendOutcome::TimedOut { attempts: inf.attempts });
                        }
                    } else if let Some(inf) = inflight.as_mut() {
                        // Resend the identical payload unchanged.
                        warn!(
                            message = "ack window elapsed, retrying",
                            action = inf.job.outbound.action,
                            attempt = inf.attempts + 1,
                        );
                        self.transport.send(inf.job.outbound.frame()).await.map_err(Error::Send)?;
                        inf.attempts += 1;
                        gap.as_mut().reset(Instant::now() + self.spacing);
                        if let Some(m) = &inf.job.outbound.response {
                            ack_deadline.as_mut().reset(Instant::now() + m.timeout);
                        }
                    }
                }
                Step::NextJob(None) => return Ok(()),
                Step::NextJob(Some(job)) => {
                    trace!(message = "sending", action = job.outbound.action, payload = ?job.outbound.payload);
                    self.transport.send(job.outbound.frame()).await.map_err(Error::Send)?;
                    gap.as_mut().reset(Instant::now() + self.spacing);
                    match &job.outbound.response {
                        None => {
                            let _ = job.done.send(SendOutcome::Sent);
                        }
                        Some(m) => {
                            ack_deadline.as_mut().reset(Instant::now() + m.timeout);
                            inflight = Some(InFlight { job, attempts: 1 });
                        }
                    }
                }
                Step::GapOpened => {}
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, inflight: &mut Option<InFlight>) {
        let is_match = inflight
            .as_ref()
            .and_then(|inf| inf.job.outbound.response.as_ref())
            .is_some_and(|m| m.matches(&frame));
        if is_match {
            if let Some(inf) = inflight.take() {
                trace!(message = "response matched", action = frame.action);
                let _ = inf.job.done.send(SendOutcome::Acked(frame));
            }
        } else {
            trace!(message = "unsolicited frame", action = frame.action);
            // Nobody listening just means the adapter is being replaced.
            let _ = self.unsolicited.send(frame);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BusEvent {
        Sent(Frame),
        Delivered(Frame),
    }

    type Behavior = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

    /// Scripted transport that records every send with a timestamp and answers from
    /// a programmable behavior function. Unsolicited frames can be pushed through
    /// the injector.
    pub struct MockTransport {
        pub log: Arc<Mutex<Vec<(BusEvent, Instant)>>>,
        behavior: Behavior,
        reply_tx: UnboundedSender<Frame>,
        reply_rx: UnboundedReceiver<Frame>,
    }

    impl MockTransport {
        pub fn new(behavior: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                behavior: Box::new(behavior),
                reply_tx,
                reply_rx,
            }
        }

        /// Acks nothing, ever.
        pub fn dead() -> Self {
            Self::new(|_| Vec::new())
        }

        pub fn injector(&self) -> UnboundedSender<Frame> {
            self.reply_tx.clone()
        }

        pub fn log_handle(&self) -> Arc<Mutex<Vec<(BusEvent, Instant)>>> {
            Arc::clone(&self.log)
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send {
            let mut lock = self.log.lock().unwrap_or_else(|e| e.into_inner());
            lock.push((BusEvent::Sent(frame.clone()), Instant::now()));
            drop(lock);
            for reply in (self.behavior)(&frame) {
                let _ = self.reply_tx.send(reply);
            }
            std::future::ready(Ok(()))
        }

        fn recv(&mut self) -> impl Future<Output = Option<Frame>> + Send {
            async {
                let frame = self.reply_rx.recv().await?;
                let mut lock = self.log.lock().unwrap_or_else(|e| e.into_inner());
                lock.push((BusEvent::Delivered(frame.clone()), Instant::now()));
                drop(lock);
                Some(frame)
            }
        }
    }

    pub fn sent_frames(log: &Arc<Mutex<Vec<(BusEvent, Instant)>>>) -> VecDeque<Frame> {
        log.lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(ev, _)| match ev {
                BusEvent::Sent(f) => Some(f.clone()),
                BusEvent::Delivered(_) => None,
            })
            .collect()
    }
}
