use crate::bus::{self, BusHandle, SendOutcome};
use crate::model::{Category, ConfigVersion, EquipmentModel};
use crate::protocol::{Frame, Outbound};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs when a request transitions into completeness. May push further items into the
/// request, turning it incomplete again (multi-phase fetch: learn the pump count,
/// then fetch that many pump names).
pub type CompletionFn = Box<dyn FnOnce(&mut ConfigRequest, &EquipmentModel) + Send>;

/// One category's outstanding set of configuration items to fetch.
pub struct ConfigRequest {
    pub category: Category,
    pub version: u32,
    pub items: Vec<u8>,
    pub acquired: Vec<u8>,
    oncomplete: Option<CompletionFn>,
}

impl ConfigRequest {
    pub fn new(category: Category, version: u32, items: impl Into<Vec<u8>>) -> Self {
        Self {
            category,
            version,
            items: items.into(),
            acquired: Vec::new(),
            oncomplete: None,
        }
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&mut ConfigRequest, &EquipmentModel) + Send + 'static,
    ) -> Self {
        self.oncomplete = Some(Box::new(callback));
        self
    }

    /// Appends the contiguous ascending run `start..=end`.
    pub fn fill_range(&mut self, start: u8, end: u8) {
        for item in start..=end {
            self.items.push(item);
        }
    }

    /// Prunes every occurrence of `item`; a no-op when it is already absent.
    pub fn remove_item(&mut self, item: u8) {
        let before = self.items.len();
        self.items.retain(|&i| i != item);
        if self.items.len() != before {
            self.acquired.push(item);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for ConfigRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRequest")
            .field("category", &self.category)
            .field("version", &self.version)
            .field("items", &self.items)
            .field("acquired", &self.acquired)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Queuing,
    Draining,
}

/// Published on a watch channel so presentation layers can show sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: QueueState,
    pub percent: u8,
}

impl Progress {
    pub const IDLE: Progress = Progress { state: QueueState::Idle, percent: 100 };
}

/// The outstanding work of one reconciliation pass.
pub struct ConfigQueue {
    pending: VecDeque<ConfigRequest>,
    current: Option<ConfigRequest>,
    total_items: usize,
    closed: bool,
    high_water: u8,
}

impl ConfigQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            total_items: 0,
            closed: false,
            high_water: 0,
        }
    }

    pub fn push(&mut self, request: ConfigRequest) {
        self.total_items += request.items.len();
        self.pending.push_back(request);
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn remaining_items(&self) -> usize {
        let pending: usize = self.pending.iter().map(|r| r.items.len()).sum();
        pending + self.current.as_ref().map_or(0, |r| r.items.len())
    }

    /// Completion percentage, clamped so it never regresses within one drain even when
    /// a completion callback grows the total.
    pub fn percent(&mut self) -> u8 {
        let computed = if self.total_items == 0 {
            100
        } else {
            let remaining = self.remaining_items();
            (100usize.saturating_sub(remaining * 100 / self.total_items)) as u8
        };
        self.high_water = self.high_water.max(computed);
        self.high_water
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Terminal until `reset`. Discards all pending work atomically.
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.current = None;
    }

    pub fn reset(&mut self) {
        self.closed = false;
        self.pending.clear();
        self.current = None;
        self.total_items = 0;
        self.high_water = 0;
    }

    /// Removes the acknowledged item from every request of the matching category.
    ///
    /// Acks are searched across all requests, not only the current one, because the
    /// panel can answer an earlier category after later ones were queued.
    pub fn remove_item(&mut self, category: Category, item: u8) {
        if let Some(current) = self.current.as_mut() {
            if current.category == category {
                current.remove_item(item);
            }
        }
        for request in self.pending.iter_mut() {
            if request.category == category {
                request.remove_item(item);
            }
        }
    }

    /// Runs completion callbacks for every request that has just become complete,
    /// prunes the finished ones and records their categories as attained.
    ///
    /// A callback that pushes new items keeps its request alive for a later pass.
    pub fn harvest_completions(
        &mut self,
        model: &EquipmentModel,
        attained: &mut Vec<(Category, u32)>,
    ) {
        let mut finish = |request: &mut ConfigRequest, total: &mut usize| -> bool {
            if !request.is_complete() {
                return false;
            }
            if let Some(callback) = request.oncomplete.take() {
                callback(request, model);
                *total += request.items.len();
            }
            if request.is_complete() {
                attained.push((request.category, request.version));
                return true;
            }
            false
        };
        let mut total = self.total_items;
        if let Some(mut current) = self.current.take() {
            if !finish(&mut current, &mut total) {
                self.current = Some(current);
            }
        }
        self.pending.retain_mut(|request| !finish(request, &mut total));
        self.total_items = total;
    }

    /// Drops the current request, remaining items included, so one dead category
    /// cannot block the rest of the drain.
    pub fn fail_current(&mut self) -> Option<Category> {
        let current = self.current.take()?;
        Some(current.category)
    }

    /// Promotes the next incomplete request into `current`. Returns false once
    /// nothing remains.
    pub fn advance(&mut self) -> bool {
        loop {
            match &self.current {
                Some(c) if !c.is_complete() => return true,
                _ => match self.pending.pop_front() {
                    Some(next) => self.current = Some(next),
                    None => {
                        self.current = None;
                        return false;
                    }
                },
            }
        }
    }

    pub fn current(&self) -> Option<&ConfigRequest> {
        self.current.as_ref()
    }
}

/// Family-specific strategy the reconciler drives: which requests a version diff
/// expands to, what the poll for one item looks like on the wire, and how to read
/// the panel's acks back into categories and the model.
pub trait ConfigPlanner: Send + Sync {
    fn plan(
        &self,
        local: &ConfigVersion,
        remote: &ConfigVersion,
        model: &EquipmentModel,
    ) -> Vec<ConfigRequest>;

    fn poll_message(&self, category: Category, item: u8) -> Outbound;

    /// Which (category, item) an inbound configuration reply acknowledges.
    fn classify_ack(&self, frame: &Frame) -> Option<(Category, u8)>;

    /// Folds the data carried by a configuration reply into the model. The default
    /// keeps nothing; families override for the items their callbacks depend on.
    fn apply(&self, model: &mut EquipmentModel, category: Category, frame: &Frame) {
        let _ = (model, category, frame);
    }
}

#[derive(Clone)]
pub struct Tuning {
    /// Bus settle time between queueing and the first poll.
    pub settle: Duration,
    /// Re-run reconciliation against the last known remote vector if no version
    /// notification arrives for this long.
    pub stale_after: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self { settle: Duration::from_millis(500), stale_after: Duration::from_secs(300) }
    }
}

/// The configuration-synchronization state machine.
///
/// One task per board adapter. Remote version vectors arrive on a channel (the sole
/// external trigger); each is expanded into requests and drained one poll at a time
/// through the bus, so at most one outbound of ours awaits a response at any instant
/// by construction. Vectors that arrive mid-drain are remembered and replayed after
/// the drain, never run concurrently.
pub struct Reconciler {
    queue: ConfigQueue,
    bus: BusHandle,
    model: Arc<Mutex<EquipmentModel>>,
    planner: Arc<dyn ConfigPlanner>,
    versions: UnboundedReceiver<ConfigVersion>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
    tuning: Tuning,
    new_request: Option<ConfigVersion>,
    last_remote: Option<ConfigVersion>,
}

pub struct ReconcilerHandles {
    pub task: tokio::task::JoinHandle<()>,
    pub versions: UnboundedSender<ConfigVersion>,
    pub progress: watch::Receiver<Progress>,
}

impl Reconciler {
    pub fn spawn(
        bus: BusHandle,
        model: Arc<Mutex<EquipmentModel>>,
        planner: Arc<dyn ConfigPlanner>,
        tuning: Tuning,
        cancel: CancellationToken,
    ) -> ReconcilerHandles {
        let (versions_tx, versions_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::IDLE);
        let reconciler = Reconciler {
            queue: ConfigQueue::new(),
            bus,
            model,
            planner,
            versions: versions_rx,
            progress: progress_tx,
            cancel,
            tuning,
            new_request: None,
            last_remote: None,
        };
        let task = tokio::task::spawn(reconciler.run());
        ReconcilerHandles { task, versions: versions_tx, progress: progress_rx }
    }

    async fn run(mut self) {
        loop {
            let remote = tokio::select! {
                _ = self.cancel.cancelled() => return,
                version = self.versions.recv() => match version {
                    Some(version) => version,
                    None => return,
                },
                _ = tokio::time::sleep(self.tuning.stale_after) => {
                    // Staleness watchdog: a change notification may have been lost on
                    // the bus, so re-check against the last vector we saw.
                    match self.last_remote {
                        Some(version) => {
                            debug!(message = "no version notification for a while, re-checking");
                            version
                        }
                        None => continue,
                    }
                }
            };
            self.reconcile(remote).await;
            while let Some(version) = self.new_request.take() {
                self.reconcile(version).await;
            }
            if self.queue.is_closed() {
                return;
            }
        }
    }

    /// One `queueChanges` pass: expand the version diff into requests, then drain.
    async fn reconcile(&mut self, remote: ConfigVersion) {
        if self.queue.is_closed() {
            return;
        }
        self.last_remote = Some(remote);
        let requests = {
            let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
            if !model.versions.has_changes(&remote) {
                debug!(message = "configuration versions unchanged, nothing to queue");
                self.progress.send_replace(Progress::IDLE);
                return;
            }
            let requests = self.planner.plan(&model.versions, &remote, &model);
            // A dirty category the planner has nothing to fetch for is trivially up
            // to date; commit it now or the sentinel would re-trigger forever.
            let local = model.versions;
            for category in local.dirty_categories(&remote) {
                if !requests.iter().any(|r| r.category == category) {
                    model.versions.set(category, remote.get(category));
                }
            }
            requests
        };
        self.queue.reset();
        self.progress.send_replace(Progress { state: QueueState::Queuing, percent: 0 });
        for request in requests {
            self.queue.push(request);
        }
        if self.queue.total_items() == 0 {
            self.progress.send_replace(Progress::IDLE);
            return;
        }
        info!(message = "queued configuration items", count = self.queue.total_items());
        self.progress.send_replace(Progress { state: QueueState::Draining, percent: 0 });
        tokio::time::sleep(self.tuning.settle).await;
        self.drain(remote).await;
    }

    async fn drain(&mut self, remote: ConfigVersion) {
        let mut attained: Vec<(Category, u32)> = Vec::new();
        let mut unattained: Vec<Category> = Vec::new();
        loop {
            // Version vectors that arrived mid-drain are remembered for a fresh pass
            // after this one; never two concurrent drains.
            while let Ok(version) = self.versions.try_recv() {
                if version != remote {
                    self.new_request = Some(version);
                }
            }
            if !self.queue.advance() {
                break;
            }
            let (category, item) = match self.queue.current() {
                Some(current) => (current.category, current.items[0]),
                None => break,
            };
            let outbound = self.planner.poll_message(category, item);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Torn down mid-flight; the in-flight outbound still resolves on
                    // the bus but nobody acts on it anymore.
                    self.queue.close();
                    return;
                }
                outcome = self.bus.send(outbound) => outcome,
            };
            match outcome {
                Ok(SendOutcome::Acked(frame)) => {
                    let (acked_category, acked_item) = self
                        .planner
                        .classify_ack(&frame)
                        .unwrap_or((category, item));
                    let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
                    self.planner.apply(&mut model, acked_category, &frame);
                    self.queue.remove_item(acked_category, acked_item);
                    self.queue.harvest_completions(&model, &mut attained);
                }
                Ok(SendOutcome::Sent) => {
                    // A family that acks nothing for this poll; count it acquired.
                    let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
                    self.queue.remove_item(category, item);
                    self.queue.harvest_completions(&model, &mut attained);
                }
                Ok(SendOutcome::TimedOut { attempts }) => {
                    warn!(
                        message = "giving up on configuration category",
                        %category,
                        attempts,
                    );
                    if let Some(failed) = self.queue.fail_current() {
                        unattained.push(failed);
                    }
                }
                Err(error) => {
                    warn!(
                        message = "bus went away mid-drain",
                        error = &error as &dyn std::error::Error,
                    );
                    self.queue.close();
                    return;
                }
            }
            let percent = self.queue.percent();
            self.progress.send_replace(Progress { state: QueueState::Draining, percent });
        }
        self.finalize(attained, unattained);
    }

    fn finalize(&mut self, attained: Vec<(Category, u32)>, unattained: Vec<Category>) {
        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        for (category, version) in attained {
            model.versions.set(category, version);
        }
        for category in unattained {
            // Back to the sentinel so the next cycle naturally retries it.
            model.versions.set(category, 0);
        }
        model.last_updated = Some(Instant::now());
        drop(model);
        info!(message = "configuration complete");
        self.progress.send_replace(Progress::IDLE);
    }
}

/// Convenience for command-level callers mapping a bus result onto equipment errors.
pub fn expect_ack(
    outcome: Result<SendOutcome, bus::Error>,
) -> Result<Option<Frame>, crate::error::EquipmentError> {
    match outcome {
        Ok(SendOutcome::Acked(frame)) => Ok(Some(frame)),
        Ok(SendOutcome::Sent) => Ok(None),
        Ok(SendOutcome::TimedOut { attempts }) => {
            Err(crate::error::EquipmentError::Timeout { attempts })
        }
        Err(error) => Err(crate::error::EquipmentError::Bus(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{BusEvent, MockTransport, sent_frames};
    use crate::bus::{Args, Bus};
    use crate::protocol::ResponseMatch;
    use strum::IntoEnumIterator as _;

    const POLL_ACTION: u8 = 222;
    const ACK_ACTION: u8 = 30;

    /// IntelliCenter-flavored planner: one request per dirty category with a fixed
    /// item list, except heaters which are fetched count-first.
    struct TestPlanner;

    impl ConfigPlanner for TestPlanner {
        fn plan(
            &self,
            local: &ConfigVersion,
            remote: &ConfigVersion,
            _model: &EquipmentModel,
        ) -> Vec<ConfigRequest> {
            let mut requests = Vec::new();
            for category in local.dirty_categories(remote) {
                let version = remote.get(category);
                let request = match category {
                    Category::Pumps => ConfigRequest::new(category, version, [0, 1, 2]),
                    Category::Heaters => ConfigRequest::new(category, version, [0])
                        .on_complete(|request, model| {
                            let count = model.heaters.len() as u8;
                            if count > 0 {
                                request.fill_range(1, count);
                            }
                        }),
                    _ => ConfigRequest::new(category, version, [0]),
                };
                requests.push(request);
            }
            requests
        }

        fn poll_message(&self, category: Category, item: u8) -> Outbound {
            Outbound::new(POLL_ACTION, vec![category as u8, item])
                .with_retries(2)
                .with_response(
                    ResponseMatch::action(ACK_ACTION)
                        .with_prefix(&[category as u8, item])
                        .with_timeout(Duration::from_millis(500)),
                )
        }

        fn classify_ack(&self, frame: &Frame) -> Option<(Category, u8)> {
            let category = Category::from_byte(frame.payload_byte(0)?)?;
            Some((category, frame.payload_byte(1)?))
        }

        fn apply(&self, model: &mut EquipmentModel, category: Category, frame: &Frame) {
            // The heater count reply announces four heaters installed.
            if category == Category::Heaters && frame.payload_byte(1) == Some(0) {
                for id in 1..=4 {
                    model.heaters.push(crate::model::Heater {
                        id,
                        body: 1,
                        heater_type: crate::model::HeaterType::Gas,
                    });
                }
            }
        }
    }

    fn synced_versions(version: u32) -> ConfigVersion {
        let mut v = ConfigVersion::default();
        for category in Category::iter() {
            v.set(category, version);
        }
        v
    }

    fn ack_everything(frame: &Frame) -> Vec<Frame> {
        if frame.action == POLL_ACTION {
            vec![Frame::new(16, 33, ACK_ACTION, frame.payload.clone())]
        } else {
            Vec::new()
        }
    }

    struct Fixture {
        handles: ReconcilerHandles,
        model: Arc<Mutex<EquipmentModel>>,
        log: Arc<Mutex<Vec<(BusEvent, Instant)>>>,
        _cancel: CancellationToken,
    }

    fn fixture(
        behavior: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static,
        tuning: Tuning,
    ) -> Fixture {
        let transport = MockTransport::new(behavior);
        let log = transport.log_handle();
        let (bus, _frames) = Bus::spawn(transport, Args::default());
        let model = Arc::new(Mutex::new({
            let mut m = EquipmentModel::default();
            m.versions = synced_versions(1);
            m
        }));
        let cancel = CancellationToken::new();
        let handles = Reconciler::spawn(
            bus.handle(),
            Arc::clone(&model),
            Arc::new(TestPlanner),
            tuning,
            cancel.clone(),
        );
        Fixture { handles, model, log, _cancel: cancel }
    }

    fn quick_tuning() -> Tuning {
        Tuning { settle: Duration::from_millis(10), stale_after: Duration::from_secs(600) }
    }

    async fn wait_for_idle(progress: &mut watch::Receiver<Progress>) {
        loop {
            progress.changed().await.unwrap();
            if progress.borrow().state == QueueState::Idle {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pump_category_drains_and_commits_version() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let remote = synced_versions(1).with(Category::Pumps, 5);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        let sent = sent_frames(&fx.log);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|f| f.payload[0] == Category::Pumps as u8));
        let model = fx.model.lock().unwrap();
        assert_eq!(model.versions.get(Category::Pumps), 5);
        assert!(model.last_updated.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn two_phase_fetch_completes_only_after_follow_up_items() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let remote = synced_versions(1).with(Category::Heaters, 2);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        // One count poll plus four name polls for the four heaters it announced.
        let sent = sent_frames(&fx.log);
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].payload, vec![Category::Heaters as u8, 0]);
        let followups: Vec<u8> = sent.iter().skip(1).map(|f| f.payload[1]).collect();
        assert_eq!(followups, vec![1, 2, 3, 4]);
        let model = fx.model.lock().unwrap();
        assert_eq!(model.versions.get(Category::Heaters), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_vector_queues_nothing() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let remote = synced_versions(1).with(Category::Pumps, 5);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        let sends_after_first = sent_frames(&fx.log).len();
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        assert_eq!(sent_frames(&fx.log).len(), sends_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_category_does_not_block_the_rest() {
        // Pump polls vanish into the void; everything else acks.
        let behavior = |frame: &Frame| {
            if frame.payload[0] == Category::Pumps as u8 {
                Vec::new()
            } else {
                ack_everything(frame)
            }
        };
        let mut fx = fixture(behavior, quick_tuning());
        let remote = synced_versions(1)
            .with(Category::Pumps, 5)
            .with(Category::Chlorinators, 3);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        let model = fx.model.lock().unwrap();
        assert_eq!(model.versions.get(Category::Chlorinators), 3);
        // Unattained: reset to the sentinel so the next cycle retries.
        assert_eq!(model.versions.get(Category::Pumps), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_poll_awaits_a_response() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let remote = synced_versions(1).with(Category::Pumps, 5);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        let log = fx.log.lock().unwrap();
        let mut outstanding = 0i32;
        for (event, _) in log.iter() {
            match event {
                BusEvent::Sent(_) => {
                    outstanding += 1;
                    assert!(outstanding <= 1, "second poll issued before the first resolved");
                }
                BusEvent::Delivered(_) => outstanding -= 1,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mid_drain_vector_is_replayed_after_the_drain() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let first = synced_versions(1).with(Category::Pumps, 5);
        let second = first.with(Category::Chlorinators, 9);
        fx.handles.versions.send(first).unwrap();
        fx.handles.versions.send(second).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        // The second vector may land either before the first drain starts or mid-way
        // through it; either way it must end up reconciled, not dropped.
        loop {
            {
                let model = fx.model.lock().unwrap();
                if model.versions.get(Category::Chlorinators) == 9 {
                    break;
                }
            }
            wait_for_idle(&mut fx.handles.progress).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn percent_is_monotonic_within_a_drain() {
        let mut fx = fixture(ack_everything, quick_tuning());
        let remote = synced_versions(1).with(Category::Heaters, 2);
        let mut seen = Vec::new();
        fx.handles.versions.send(remote).unwrap();
        loop {
            fx.handles.progress.changed().await.unwrap();
            let progress = *fx.handles.progress.borrow();
            seen.push(progress);
            if progress.state == QueueState::Idle {
                break;
            }
        }
        let draining: Vec<u8> = seen
            .iter()
            .filter(|p| p.state == QueueState::Draining)
            .map(|p| p.percent)
            .collect();
        assert!(draining.windows(2).all(|w| w[0] <= w[1]), "{draining:?}");
        assert_eq!(seen.last().map(|p| p.percent), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_retries_unattained_categories() {
        // First three pump polls time out, later ones ack.
        let mut failures = 0;
        let behavior = move |frame: &Frame| {
            if frame.payload[0] == Category::Pumps as u8 && failures < 3 {
                failures += 1;
                Vec::new()
            } else {
                ack_everything(frame)
            }
        };
        let tuning = Tuning { settle: Duration::from_millis(10), stale_after: Duration::from_secs(30) };
        let mut fx = fixture(behavior, tuning);
        let remote = synced_versions(1).with(Category::Pumps, 5);
        fx.handles.versions.send(remote).unwrap();
        wait_for_idle(&mut fx.handles.progress).await;
        assert_eq!(fx.model.lock().unwrap().versions.get(Category::Pumps), 0);
        // No further notifications arrive; the watchdog must fire and finish the job.
        wait_for_idle(&mut fx.handles.progress).await;
        assert_eq!(fx.model.lock().unwrap().versions.get(Category::Pumps), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_queue_ignores_late_outcomes() {
        let transport = MockTransport::dead();
        let log = transport.log_handle();
        let (bus, _frames) = Bus::spawn(transport, Args::default());
        let model = Arc::new(Mutex::new({
            let mut m = EquipmentModel::default();
            m.versions = synced_versions(1);
            m
        }));
        let cancel = CancellationToken::new();
        let handles = Reconciler::spawn(
            bus.handle(),
            Arc::clone(&model),
            Arc::new(TestPlanner),
            quick_tuning(),
            cancel.clone(),
        );
        handles
            .versions
            .send(synced_versions(1).with(Category::Pumps, 5))
            .unwrap();
        // Let the first poll get onto the wire, then tear the adapter down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handles.task.await.unwrap();
        assert!(sent_frames(&log).len() <= 1);
        // The version was never attained and the model was left untouched.
        assert_eq!(model.lock().unwrap().versions.get(Category::Pumps), 1);
    }

    #[test]
    fn request_completion_is_item_emptiness() {
        let mut request = ConfigRequest::new(Category::Circuits, 3, [1, 2]);
        assert!(!request.is_complete());
        request.remove_item(1);
        request.remove_item(1); // absent now, a no-op
        request.remove_item(2);
        assert!(request.is_complete());
        assert_eq!(request.acquired, vec![1, 2]);
    }

    #[test]
    fn fill_range_appends_ascending() {
        let mut request = ConfigRequest::new(Category::Schedules, 1, []);
        request.fill_range(5, 8);
        assert_eq!(request.items, vec![5, 6, 7, 8]);
    }

    #[test]
    fn completion_callback_fires_once_per_transition() {
        let mut queue = ConfigQueue::new();
        queue.push(
            ConfigRequest::new(Category::Features, 2, [0]).on_complete(|request, _model| {
                request.fill_range(1, 2);
            }),
        );
        let model = EquipmentModel::default();
        let mut attained = Vec::new();
        assert!(queue.advance());
        queue.remove_item(Category::Features, 0);
        queue.harvest_completions(&model, &mut attained);
        // Re-armed by the callback: not attained yet, two more items outstanding.
        assert!(attained.is_empty());
        assert_eq!(queue.remaining_items(), 2);
        assert_eq!(queue.total_items(), 3);
        queue.remove_item(Category::Features, 1);
        queue.remove_item(Category::Features, 2);
        queue.harvest_completions(&model, &mut attained);
        assert_eq!(attained, vec![(Category::Features, 2)]);
        assert!(!queue.advance());
    }

    #[test]
    fn close_is_terminal_until_reset() {
        let mut queue = ConfigQueue::new();
        queue.push(ConfigRequest::new(Category::General, 1, [0]));
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.remaining_items(), 0);
        queue.reset();
        assert!(!queue.is_closed());
    }
}
