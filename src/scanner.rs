use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ScanConfig;
use crate::error::{ScanError, StoreError};
use crate::governor::{Pacer, RateGovernor};
use crate::ports;
use crate::probe::Probe;
use crate::record::now_timestamp;
use crate::store::{ResultMap, ScanSink};
use crate::types::{ProbeOutcome, ScanRecord, ScanState, ScanSummary, Target};

/// Drives a batched connect scan over `ports × targets`.
///
/// - Ports are split into batches of `batch_size`; each batch's ports are shuffled once.
/// - Each port is swept across every target in a freshly shuffled order, with at most
///   `concurrency` probes in flight and an optional global rate ceiling.
/// - A paced pause separates consecutive port sweeps.
/// - After each batch every sink gets a checkpoint; a sink error halts the scan.
///
/// Only the scheduler loop mutates the [`ResultMap`]: workers hand their outcomes
/// back through the `JoinSet`.
pub struct Scanner<P: Probe> {
    probe: Arc<P>,
    config: ScanConfig,
    governor: Option<Arc<RateGovernor>>,
    state: watch::Sender<ScanState>,
}

/// Result of one worker: the pair it was given and what happened.
struct Attempt {
    target: Target,
    port: u16,
    outcome: Option<ProbeOutcome>,
    attempts: u32,
}

impl<P: Probe> Scanner<P> {
    pub fn new(probe: P, config: ScanConfig) -> Result<Self, ScanError> {
        config.validate()?;
        let governor = config.rate_per_sec.map(|rate| {
            let burst = rate.min(u32::try_from(config.concurrency).unwrap_or(u32::MAX));
            Arc::new(RateGovernor::new(rate, burst))
        });
        let (state, _) = watch::channel(ScanState::Idle);
        Ok(Self {
            probe: Arc::new(probe),
            config,
            governor,
            state,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Observe state transitions of the running scan.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Scan `ports × targets`, extending `map` and feeding `sinks`.
    ///
    /// On `Err` the scan has halted; `map` still holds everything found so far.
    /// Cancellation is not an error: the summary's state says `Cancelled`.
    pub async fn run(
        &self,
        targets: &[Target],
        ports: &[u16],
        map: &mut ResultMap,
        sinks: &mut [&mut dyn ScanSink],
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        let started = Instant::now();
        let cancel = cancel.child_token();
        let deadline = self.config.max_duration().map(|limit| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                time::sleep(limit).await;
                warn!(?limit, "scan deadline reached, cancelling");
                cancel.cancel();
            })
        });

        let res = self
            .run_batches(targets, ports, map, sinks, &cancel, started)
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        if res.is_err() {
            self.set_state(ScanState::Failed);
        }
        res
    }

    async fn run_batches(
        &self,
        targets: &[Target],
        ports: &[u16],
        map: &mut ResultMap,
        sinks: &mut [&mut dyn ScanSink],
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ScanSummary, ScanError> {
        let batches = ports::batches(ports, self.config.batch_size);
        let mut rng = match self.config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pacer = Pacer::new(self.config.port_delay(), self.config.jitter());
        let sem = Arc::new(Semaphore::new(self.config.concurrency));
        let mut summary = ScanSummary {
            batches_total: batches.len(),
            ..ScanSummary::default()
        };
        let mut sweep_order = targets.to_vec();
        let mut swept_any = false;
        let mut interrupted = false;

        self.set_state(ScanState::Idle);
        info!(
            targets = targets.len(),
            ports = ports.len(),
            batches = batches.len(),
            skip = self.config.skip_batches,
            "scan starting"
        );

        for (index, batch) in batches.iter().enumerate().skip(self.config.skip_batches) {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            self.set_state(ScanState::BatchInProgress(index));
            info!(batch = index, ports = batch.len(), "batch started");

            let mut port_order = batch.clone();
            port_order.shuffle(&mut rng);

            let mut finished = true;
            for &port in &port_order {
                if swept_any {
                    let pause = pacer.next_pause(&mut rng);
                    if !Pacer::pause(pause, cancel).await {
                        finished = false;
                        break;
                    }
                }
                swept_any = true;

                sweep_order.shuffle(&mut rng);
                let swept = match self
                    .sweep_port(index, port, &sweep_order, &sem, cancel, map, sinks, &mut summary)
                    .await
                {
                    Ok(swept) => swept,
                    Err(e) => {
                        if matches!(e, ScanError::ResourceExhausted { .. }) {
                            // Keep what this batch found before giving up.
                            if let Err(ce) = checkpoint_all(sinks, map) {
                                error!(batch = index, error = %ce, "emergency checkpoint failed");
                            }
                        }
                        return Err(e);
                    }
                };
                if !swept {
                    finished = false;
                    break;
                }
            }

            checkpoint_all(sinks, map)
                .map_err(|source| ScanError::Persistence { batch: index, source })?;

            if !finished {
                info!(batch = index, "batch interrupted, partial results checkpointed");
                interrupted = true;
                break;
            }
            summary.batches_completed += 1;
            self.set_state(ScanState::BatchComplete(index));
            info!(
                batch = index,
                open_total = map.open_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch complete"
            );
        }

        // A cancel that lands after the last checkpoint does not undo a full run.
        summary.state = if interrupted {
            ScanState::Cancelled
        } else {
            ScanState::AllBatchesComplete
        };
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        self.set_state(summary.state);
        info!(
            state = ?summary.state,
            probes = summary.probes,
            open = summary.open,
            errors = summary.errors,
            "scan finished"
        );
        Ok(summary)
    }

    /// Probe `port` on every target. Returns `false` if cancellation left pairs unprobed.
    #[allow(clippy::too_many_arguments)]
    async fn sweep_port(
        &self,
        batch: usize,
        port: u16,
        targets: &[Target],
        sem: &Arc<Semaphore>,
        cancel: &CancellationToken,
        map: &mut ResultMap,
        sinks: &mut [&mut dyn ScanSink],
        summary: &mut ScanSummary,
    ) -> Result<bool, ScanError> {
        trace!(port, targets = targets.len(), "sweeping port");
        let mut set = JoinSet::new();
        let mut complete = true;

        for target in targets {
            if cancel.is_cancelled() {
                complete = false;
                break;
            }
            let Ok(permit) = sem.clone().acquire_owned().await else {
                complete = false;
                break;
            };
            let probe = self.probe.clone();
            let governor = self.governor.clone();
            let cancel = cancel.clone();
            let target = target.clone();
            let timeout = self.config.timeout();
            let retries = self.config.resource_retries;
            let backoff = self.config.resource_backoff();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                if let Some(gov) = governor {
                    tokio::select! {
                        _ = cancel.cancelled() => return Attempt::skipped(target, port),
                        _ = gov.acquire() => {}
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => Attempt::skipped(target, port),
                    attempt = probe_with_retry(&*probe, target.clone(), port, timeout, retries, backoff) => attempt,
                }
            });

            while let Some(joined) = set.try_join_next() {
                complete &= self.apply(batch, joined, map, sinks, summary)?;
            }
        }

        while let Some(joined) = set.join_next().await {
            complete &= self.apply(batch, joined, map, sinks, summary)?;
        }
        Ok(complete)
    }

    /// Fold one worker result into the map, the counters and the sinks.
    /// Returns `false` if the pair was skipped because of cancellation.
    fn apply(
        &self,
        batch: usize,
        joined: Result<Attempt, JoinError>,
        map: &mut ResultMap,
        sinks: &mut [&mut dyn ScanSink],
        summary: &mut ScanSummary,
    ) -> Result<bool, ScanError> {
        let attempt = match joined {
            Ok(a) => a,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Ok(false),
        };
        let Attempt {
            target,
            port,
            outcome,
            attempts,
        } = attempt;
        let Some(outcome) = outcome else {
            return Ok(false);
        };

        summary.probes += 1;
        match &outcome {
            ProbeOutcome::Open => {
                summary.open += 1;
                if map.record(&target, port) {
                    info!(%target, port, "open");
                }
            }
            ProbeOutcome::Closed => {
                summary.closed += 1;
                trace!(%target, port, "closed");
            }
            ProbeOutcome::Error(e) => {
                summary.errors += 1;
                if e.is_resource() {
                    return Err(ScanError::ResourceExhausted {
                        target: target.to_string(),
                        port,
                        attempts,
                        source: e.clone(),
                    });
                }
                debug!(%target, port, error = %e, "probe error");
            }
        }

        let record = ScanRecord {
            target,
            port,
            timestamp: now_timestamp(),
            response: outcome.flag(),
        };
        for sink in sinks.iter_mut() {
            sink.record(&record)
                .map_err(|source| ScanError::Persistence { batch, source })?;
        }
        Ok(true)
    }

    fn set_state(&self, state: ScanState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = ?prev, to = ?state, "scan state");
        }
    }
}

impl Attempt {
    fn skipped(target: Target, port: u16) -> Self {
        Self {
            target,
            port,
            outcome: None,
            attempts: 0,
        }
    }
}

/// Probe once, retrying with doubling backoff only while the local side is out of
/// sockets. Any other outcome is final.
async fn probe_with_retry<P: Probe + ?Sized>(
    probe: &P,
    target: Target,
    port: u16,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
) -> Attempt {
    let mut attempts = 0;
    let mut delay = backoff;
    loop {
        attempts += 1;
        let outcome = probe.probe(&target, port, timeout).await;
        match &outcome {
            ProbeOutcome::Error(e) if e.is_resource() && attempts <= retries => {
                debug!(%target, port, attempts, ?delay, error = %e, "resource error, backing off");
                time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            _ => {
                return Attempt {
                    target,
                    port,
                    outcome: Some(outcome),
                    attempts,
                }
            }
        }
    }
}

fn checkpoint_all(sinks: &mut [&mut dyn ScanSink], map: &ResultMap) -> Result<(), StoreError> {
    for sink in sinks.iter_mut() {
        sink.checkpoint(map)?;
    }
    Ok(())
}
