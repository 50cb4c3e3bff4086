//! Acquisition orchestrator
//! Owns the sampling window, runs the periodic detection cycle on the blocking
//! pool and publishes results. All mutation happens on one task, fed through
//! an unbounded input channel so radio callbacks never wait on it.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::config::acquisition_config::AcquisitionConfig;
use crate::config::signal_config::SignalConfig;
use crate::core::codec::EcgSample;
use crate::core::events::{CoreEvent, EventEmitter, Metric, MetricReading};
use crate::core::processor::{
    CycleAnalysis, HeartRateEstimate, HeartRateSmoother, SignalProcessor, mean_heart_rate,
};
use crate::core::window::{Lead, SamplingWindow};

#[derive(Debug)]
enum AcquisitionInput {
    SessionStarted,
    Samples { session: u64, samples: Vec<EcgSample> },
    SetLead(Lead),
    SetMetric(Metric),
    Start,
    Stop,
    SessionEnded,
}

/// Result of a detection cycle, tagged with what it was computed against.
struct CycleOutcome {
    session: u64,
    epoch: u64,
    cycle: u64,
    analysis: CycleAnalysis,
}

/// Generation of the current radio session. Results are published while
/// holding this lock, so a bump is a hard cut-off.
type SessionGeneration = Arc<Mutex<u64>>;

fn lock_generation(generation: &SessionGeneration) -> MutexGuard<'_, u64> {
    generation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable front door to the acquisition task.
#[derive(Debug, Clone)]
pub struct AcquisitionHandle {
    input: mpsc::UnboundedSender<AcquisitionInput>,
    generation: SessionGeneration,
}

impl AcquisitionHandle {
    fn send(&self, input: AcquisitionInput) -> bool {
        match self.input.send(input) {
            Ok(()) => true,
            Err(e) => {
                warn!("Acquisition task is gone, dropping {:?}", e.0);
                false
            }
        }
    }

    /// Generation of the current radio session.
    pub fn current_session(&self) -> u64 {
        *lock_generation(&self.generation)
    }

    /// Opens a new radio session and returns its generation. Batches must be
    /// posted with this value to be accepted.
    pub fn begin_session(&self) -> u64 {
        let session = {
            let mut generation = lock_generation(&self.generation);
            *generation += 1;
            *generation
        };
        self.send(AcquisitionInput::SessionStarted);
        session
    }

    /// Tears down the current session. Batches and detection results that
    /// belong to it are dropped from now on.
    pub fn end_session(&self) {
        *lock_generation(&self.generation) += 1;
        self.send(AcquisitionInput::SessionEnded);
    }

    /// Queues a decoded batch. Returns false if the batch belongs to a
    /// torn-down session or the task has stopped.
    pub fn post_samples(&self, session: u64, samples: Vec<EcgSample>) -> bool {
        if session != self.current_session() {
            debug!("Dropping {} samples from stale session {}", samples.len(), session);
            return false;
        }
        self.send(AcquisitionInput::Samples { session, samples })
    }

    pub fn set_lead(&self, lead: Lead) {
        self.send(AcquisitionInput::SetLead(lead));
    }

    pub fn set_active_metric(&self, metric: Metric) {
        self.send(AcquisitionInput::SetMetric(metric));
    }

    /// Enables the periodic detection cycle.
    pub fn start(&self) {
        self.send(AcquisitionInput::Start);
    }

    /// Disables detection and clears the window. In-flight cycles are discarded.
    pub fn stop(&self) {
        self.send(AcquisitionInput::Stop);
    }
}

pub struct Orchestrator {
    window: SamplingWindow,
    processor: Arc<SignalProcessor>,
    smoother: HeartRateSmoother,
    emitter: EventEmitter,
    generation: SessionGeneration,
    workers: Arc<Semaphore>,
    metric: Metric,
    active: bool,
    /// Bumped whenever the window is invalidated.
    epoch: u64,
    cycles: u64,
    min_samples: usize,
}

impl Orchestrator {
    /// Spawns the acquisition task. It runs until `shutdown` is cancelled or
    /// every handle is dropped.
    pub fn spawn(
        acquisition: &AcquisitionConfig,
        signal: &SignalConfig,
        emitter: EventEmitter,
        shutdown: CancellationToken,
    ) -> (AcquisitionHandle, JoinHandle<()>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(Mutex::new(0));

        let orchestrator = Orchestrator {
            window: SamplingWindow::new(
                acquisition.window_capacity,
                acquisition.eviction_batch,
                acquisition.default_lead,
            ),
            processor: Arc::new(SignalProcessor::new(signal.clone())),
            smoother: HeartRateSmoother::new(signal),
            emitter,
            generation: generation.clone(),
            workers: Arc::new(Semaphore::new(acquisition.worker_pool_size.max(1))),
            metric: acquisition.active_metric,
            active: false,
            epoch: 0,
            cycles: 0,
            min_samples: acquisition.min_detection_samples(signal.sampling_rate_hz()),
        };

        let period = acquisition.detection_interval();
        let handle = tokio::spawn(orchestrator.run(input_rx, period, shutdown));

        (
            AcquisitionHandle {
                input: input_tx,
                generation,
            },
            handle,
        )
    }

    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<AcquisitionInput>,
        period: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<CycleOutcome>();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Acquisition task started, detection every {:?}", period);
        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(input) => self.handle_input(input),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.start_cycle(&outcome_tx);
                }
                Some(outcome) = outcome_rx.recv() => {
                    self.publish(outcome);
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        info!("Acquisition task stopped");
    }

    fn invalidate(&mut self) {
        self.window.clear();
        self.epoch += 1;
    }

    fn handle_input(&mut self, input: AcquisitionInput) {
        match input {
            AcquisitionInput::SessionStarted => {
                debug!("New session {}", *lock_generation(&self.generation));
                self.invalidate();
            }
            AcquisitionInput::Samples { session, samples } => {
                // Held until the batch is out, so a teardown cannot slip in between.
                let current_session = lock_generation(&self.generation);
                if session != *current_session {
                    debug!("Discarding {} queued samples from session {}", samples.len(), session);
                    return;
                }
                for sample in &samples {
                    self.window.append_sample(sample);
                }
                self.emitter.emit(CoreEvent::RawSampleBatch(samples));
            }
            AcquisitionInput::SetLead(lead) => {
                if lead != self.window.lead() {
                    info!("Switching lead to {:?}", lead);
                    self.window.switch_lead(lead);
                    self.epoch += 1;
                }
            }
            AcquisitionInput::SetMetric(metric) => {
                info!("Active metric set to {:?}", metric);
                self.metric = metric;
            }
            AcquisitionInput::Start => {
                info!("Detection started");
                self.active = true;
            }
            AcquisitionInput::Stop => {
                info!("Detection stopped");
                self.active = false;
                self.invalidate();
            }
            AcquisitionInput::SessionEnded => {
                info!("Session ended, clearing window");
                self.active = false;
                self.invalidate();
                self.smoother.reset();
            }
        }
    }

    fn start_cycle(&mut self, outcome_tx: &mpsc::UnboundedSender<CycleOutcome>) {
        if !self.active {
            return;
        }
        if self.window.len() < self.min_samples {
            debug!(
                "Skipping detection, {} of {} samples buffered",
                self.window.len(),
                self.min_samples
            );
            return;
        }
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            warn!("All detection workers busy, skipping cycle");
            return;
        };

        self.cycles += 1;
        let cycle = self.cycles;
        let session = *lock_generation(&self.generation);
        let epoch = self.epoch;
        let snapshot = self
            .window
            .filtered_snapshot(self.processor.config().calibration_divisor);
        let processor = self.processor.clone();
        let outcome_tx = outcome_tx.clone();

        tokio::task::spawn_blocking(move || {
            let analysis = processor.analyze_centered(&snapshot);
            drop(permit);
            if outcome_tx
                .send(CycleOutcome {
                    session,
                    epoch,
                    cycle,
                    analysis,
                })
                .is_err()
            {
                debug!("Acquisition task gone before cycle {} finished", cycle);
            }
        });
    }

    fn publish(&mut self, outcome: CycleOutcome) {
        if outcome.epoch != self.epoch || !self.active {
            debug!("Dropping stale result of cycle {}", outcome.cycle);
            return;
        }

        let generation = self.generation.clone();
        let current_session = lock_generation(&generation);
        if outcome.session != *current_session {
            debug!("Dropping result of cycle {} from ended session", outcome.cycle);
            return;
        }

        let analysis = outcome.analysis;
        let estimate = self.smoother.publish(analysis.raw_bpm);
        debug!(
            "Cycle {}: {:.1} bpm ({:?}), {} peaks",
            outcome.cycle,
            estimate.bpm,
            estimate.confidence,
            analysis.peaks.len()
        );

        self.emitter.emit(CoreEvent::HeartRate(estimate));
        self.emitter.emit(CoreEvent::HrvMetrics(analysis.hrv));
        self.emitter.emit(CoreEvent::HrvFrequency(analysis.hrv_frequency));
        match self.metric_value(&estimate, &analysis) {
            Some(value) => self.emitter.emit(CoreEvent::Metric(MetricReading {
                metric: self.metric,
                value,
            })),
            None => debug!("No {:?} reading for cycle {}", self.metric, outcome.cycle),
        }
    }

    fn metric_value(&self, estimate: &HeartRateEstimate, analysis: &CycleAnalysis) -> Option<f64> {
        let rate = self.processor.config().sampling_rate_hz();
        match self.metric {
            Metric::HeartRate => Some(estimate.bpm),
            Metric::MeanHr => mean_heart_rate(&analysis.peaks, rate),
            Metric::Rmssd if analysis.peaks.len() >= 2 => Some(analysis.hrv.rmssd * 1000.0),
            Metric::Sdnn if analysis.peaks.len() >= 2 => Some(analysis.hrv.sdnn * 1000.0),
            Metric::Rmssd | Metric::Sdnn => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{self, CoreEvent};
    use crate::core::processor::Confidence;
    use crate::core::processor::tests::beat_signal;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn fast_config() -> AcquisitionConfig {
        AcquisitionConfig {
            detection_interval_ms: 20,
            ..AcquisitionConfig::default()
        }
    }

    fn samples_from(signal: &[i32]) -> Vec<EcgSample> {
        signal
            .iter()
            .map(|&v| EcgSample {
                status_flags: 0,
                ecg1: v,
                ecg2: 0,
                ecg3: -v,
            })
            .collect()
    }

    async fn next_matching<F>(rx: &mut UnboundedReceiver<CoreEvent>, wanted: F) -> Option<CoreEvent>
    where
        F: Fn(&CoreEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            while let Some(event) = rx.recv().await {
                if wanted(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn full_window_publishes_confident_rate() {
        let (emitter, mut rx) = events::channel();
        let shutdown = CancellationToken::new();
        let (handle, task) =
            Orchestrator::spawn(&fast_config(), &SignalConfig::default(), emitter, shutdown.clone());

        let session = handle.begin_session();
        assert!(handle.post_samples(session, samples_from(&beat_signal(1000, 160))));
        handle.start();

        let event = next_matching(&mut rx, |e| matches!(e, CoreEvent::HeartRate(_))).await;
        let Some(CoreEvent::HeartRate(estimate)) = event else {
            panic!("no heart rate published");
        };
        assert_eq!(estimate.confidence, Confidence::High);
        assert!((estimate.bpm - 75.0).abs() < 1e-6);

        let spectrum = next_matching(&mut rx, |e| matches!(e, CoreEvent::HrvFrequency(_))).await;
        let Some(CoreEvent::HrvFrequency(bands)) = spectrum else {
            panic!("no spectral HRV published");
        };
        // A perfectly regular rhythm has no RR variability.
        assert!(bands.total_power < 1e-12, "total power = {}", bands.total_power);

        let reading = next_matching(&mut rx, |e| matches!(e, CoreEvent::Metric(_))).await;
        assert!(matches!(
            reading,
            Some(CoreEvent::Metric(MetricReading { metric: Metric::HeartRate, .. }))
        ));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn selected_metric_is_reported() {
        let (emitter, mut rx) = events::channel();
        let shutdown = CancellationToken::new();
        let (handle, _task) =
            Orchestrator::spawn(&fast_config(), &SignalConfig::default(), emitter, shutdown.clone());

        handle.set_active_metric(Metric::MeanHr);
        let session = handle.begin_session();
        handle.post_samples(session, samples_from(&beat_signal(1000, 120)));
        handle.start();

        let event = next_matching(&mut rx, |e| matches!(e, CoreEvent::Metric(_))).await;
        let Some(CoreEvent::Metric(reading)) = event else {
            panic!("no metric published");
        };
        assert_eq!(reading.metric, Metric::MeanHr);
        assert!((reading.value - 100.0).abs() < 1e-6);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn accepted_batches_are_forwarded_raw() {
        let (emitter, mut rx) = events::channel();
        let shutdown = CancellationToken::new();
        let (handle, _task) =
            Orchestrator::spawn(&fast_config(), &SignalConfig::default(), emitter, shutdown.clone());

        let session = handle.begin_session();
        let batch = samples_from(&[1, 2, 3]);
        handle.post_samples(session, batch.clone());

        let event = next_matching(&mut rx, |e| matches!(e, CoreEvent::RawSampleBatch(_))).await;
        assert_eq!(event, Some(CoreEvent::RawSampleBatch(batch)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn nothing_is_published_while_inactive() {
        let (emitter, mut rx) = events::channel();
        let shutdown = CancellationToken::new();
        let (handle, _task) =
            Orchestrator::spawn(&fast_config(), &SignalConfig::default(), emitter, shutdown.clone());

        let session = handle.begin_session();
        handle.post_samples(session, samples_from(&beat_signal(1000, 160)));

        let published = timeout(Duration::from_millis(200), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, CoreEvent::HeartRate(_)) {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(!matches!(published, Ok(true)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn ended_session_drops_batches_and_results() {
        let (emitter, mut rx) = events::channel();
        let shutdown = CancellationToken::new();
        let (handle, _task) =
            Orchestrator::spawn(&fast_config(), &SignalConfig::default(), emitter, shutdown.clone());

        let session = handle.begin_session();
        handle.post_samples(session, samples_from(&beat_signal(1000, 160)));
        handle.start();
        handle.end_session();

        assert!(!handle.post_samples(session, samples_from(&[1, 2, 3])));

        let published = timeout(Duration::from_millis(200), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, CoreEvent::HeartRate(_) | CoreEvent::HrvMetrics(_)) {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(!matches!(published, Ok(true)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_task() {
        let (emitter, _rx) = events::channel();
        let (handle, task) = Orchestrator::spawn(
            &fast_config(),
            &SignalConfig::default(),
            emitter,
            CancellationToken::new(),
        );
        drop(handle);
        assert!(timeout(Duration::from_secs(1), task).await.is_ok());
    }
}
