//! Evaluation cycles
//!
//! One cycle: pair every inventory entry with each module that accepts it,
//! run the pairs concurrently on leased connection radios, score what comes
//! back and hand the winner to the bridge. Only the provisional winner ever
//! holds on to a radio; everything else is released as soon as it finishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, info, warn};
use vasili_network::{
    ConnectionAttempt, EvaluationModule, LeaseEnd, NetworkError, NetworkInventory, NetworkObservation,
    RadioLease, RadioPool, WirelessBackend,
};

use crate::bridge::{BridgeManager, BridgeSnapshot};
use crate::scoring::{self, NetworkScore, NetworkScorer};
use crate::storage::{MeasurementRecord, MeasurementStore};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on a whole cycle
    pub cycle_deadline: Duration,
    /// Upper bound on a single module attempt
    pub attempt_timeout: Duration,
    /// Automatic cycles only replace a healthy bridge by at least this margin
    pub min_score_improvement: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_deadline: Duration::from_secs(120),
            attempt_timeout: Duration::from_secs(60),
            min_score_improvement: 10.0,
        }
    }
}

/// Why a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Startup,
    Periodic,
    LinkLost,
    /// A specific BSSID was requested through [`Orchestrator::request_manual`]
    Manual,
}

impl fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleTrigger::Startup => write!(f, "startup"),
            CycleTrigger::Periodic => write!(f, "periodic"),
            CycleTrigger::LinkLost => write!(f, "link-lost"),
            CycleTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// What a cycle did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A new bridge is up
    Activated {
        bridge: BridgeSnapshot,
        replaced: Option<String>,
    },
    /// The current bridge stays
    Kept {
        incumbent: String,
        incumbent_score: f64,
        best_score: Option<f64>,
    },
    /// Nothing in range that any module accepts
    NoCandidates,
    NoSuccessfulAttempts { attempted: usize },
    BridgeRejected { reason: String },
    /// No connection radios; scanning only
    ObserveOnly,
}

impl CycleOutcome {
    /// Whether the LAN ends the cycle without a working bridge and the
    /// cycle should be retried
    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            CycleOutcome::NoCandidates
                | CycleOutcome::NoSuccessfulAttempts { .. }
                | CycleOutcome::BridgeRejected { .. }
        )
    }
}

/// Full record of the most recent cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub trigger: CycleTrigger,
    pub outcome: CycleOutcome,
    pub attempts: Vec<ConnectionAttempt>,
    pub scores: Vec<NetworkScore>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Finished {
    attempt: ConnectionAttempt,
    observation: NetworkObservation,
    lease: RadioLease,
    module: Arc<dyn EvaluationModule>,
}

struct Leader {
    attempt: ConnectionAttempt,
    observation: NetworkObservation,
    score: NetworkScore,
    module: Arc<dyn EvaluationModule>,
    /// `None` once the radio was given up to unblock dispatch
    lease: Option<RadioLease>,
}

type Pair = (NetworkObservation, Arc<dyn EvaluationModule>);

pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: RadioPool,
    backend: Arc<dyn WirelessBackend>,
    inventory: NetworkInventory,
    modules: Vec<Arc<dyn EvaluationModule>>,
    scorer: NetworkScorer,
    bridge: Arc<BridgeManager>,
    store: Arc<dyn MeasurementStore>,
    manual: Mutex<Option<String>>,
    last_report: RwLock<Option<CycleReport>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        pool: RadioPool,
        backend: Arc<dyn WirelessBackend>,
        inventory: NetworkInventory,
        modules: Vec<Arc<dyn EvaluationModule>>,
        scorer: NetworkScorer,
        bridge: Arc<BridgeManager>,
        store: Arc<dyn MeasurementStore>,
    ) -> Self {
        Self {
            config,
            pool,
            backend,
            inventory,
            modules,
            scorer,
            bridge,
            store,
            manual: Mutex::new(None),
            last_report: RwLock::new(None),
        }
    }

    /// Restrict the next cycle to `bssid` and activate its best successful
    /// attempt regardless of the current bridge. Applies to one cycle only.
    pub fn request_manual(&self, bssid: &str) {
        let bssid = bssid.to_ascii_lowercase();
        info!("Manual override requested for {}", bssid);
        *self.manual.lock().unwrap_or_else(|e| e.into_inner()) = Some(bssid);
    }

    pub fn pending_manual(&self) -> Option<String> {
        self.manual.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub fn modules(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.kind().to_string()).collect()
    }

    /// Run one evaluation cycle to completion
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleOutcome {
        let started_at = Utc::now();
        let manual = self.manual.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut attempts = Vec::new();

        let outcome = self.evaluate(trigger, manual.as_deref(), &mut attempts).await;

        let scores = self.scorer.rank(&attempts);
        info!(
            "Cycle ({}) finished: {} attempt(s), {} successful -> {:?}",
            trigger,
            attempts.len(),
            scores.len(),
            outcome
        );

        *self.last_report.write().await = Some(CycleReport {
            trigger,
            outcome: outcome.clone(),
            attempts,
            scores,
            started_at,
            finished_at: Utc::now(),
        });

        outcome
    }

    async fn evaluate(
        &self,
        trigger: CycleTrigger,
        manual: Option<&str>,
        attempts: &mut Vec<ConnectionAttempt>,
    ) -> CycleOutcome {
        let deadline = Instant::now() + self.config.cycle_deadline;
        let recovered = self.pool.recheck_errored(self.backend.as_ref()).await;
        if recovered > 0 {
            debug!("{} radio(s) recovered before cycle", recovered);
        }

        if self.pool.connection_radio_count() == 0 {
            debug!("No connection radios, observe-only");
            return CycleOutcome::ObserveOnly;
        }

        let mut incumbent = self.bridge.current().await;
        if trigger == CycleTrigger::LinkLost && incumbent.is_some() && self.pool.idle_connection_count() == 0 {
            // The dead uplink holds the only free radio
            info!("Releasing lost uplink to free its radio for evaluation");
            self.bridge.deactivate().await;
            incumbent = None;
        }

        let candidates = self.candidates(trigger, manual, incumbent.as_ref()).await;
        if candidates.is_empty() {
            match manual {
                Some(bssid) => warn!("Requested network {} is not in range or not supported", bssid),
                None => debug!("No candidate networks"),
            }
            return CycleOutcome::NoCandidates;
        }
        info!("Evaluating {} (network, module) pair(s)", candidates.len());

        let Some(leader) = self.dispatch(candidates, attempts, deadline).await else {
            if let Some(current) = incumbent {
                if attempts.is_empty() {
                    return CycleOutcome::Kept {
                        incumbent: current.ssid,
                        incumbent_score: current.score.total,
                        best_score: None,
                    };
                }
            }
            self.record(attempts).await;
            return CycleOutcome::NoSuccessfulAttempts {
                attempted: attempts.len(),
            };
        };

        let leader = match leader.lease {
            Some(_) => leader,
            None => match self.reestablish(leader, attempts, deadline).await {
                Some(leader) => leader,
                None => {
                    self.record(attempts).await;
                    return CycleOutcome::NoSuccessfulAttempts {
                        attempted: attempts.len(),
                    };
                }
            },
        };
        self.record(attempts).await;

        let Leader {
            attempt,
            observation,
            score,
            lease,
            ..
        } = leader;
        let Some(lease) = lease else {
            return CycleOutcome::NoSuccessfulAttempts {
                attempted: attempts.len(),
            };
        };

        let automatic = manual.is_none() && trigger != CycleTrigger::LinkLost;
        if let Some(current) = incumbent.as_ref().filter(|_| automatic) {
            let required = current.score.total + self.config.min_score_improvement;
            if score.total < required {
                info!(
                    "Keeping {} ({:.1}): best candidate {} scored {:.1}, needs {:.1}",
                    current.ssid, current.score.total, score.ssid, score.total, required
                );
                self.release(lease).await;
                return CycleOutcome::Kept {
                    incumbent: current.ssid.clone(),
                    incumbent_score: current.score.total,
                    best_score: Some(score.total),
                };
            }
        }

        match self
            .bridge
            .activate_by(deadline, &attempt, &observation, &score, lease)
            .await
        {
            Ok(bridge) => CycleOutcome::Activated {
                bridge,
                replaced: incumbent.map(|b| b.ssid),
            },
            Err(e) => {
                warn!("Bridge rejected {}: {}", attempt.ssid, e);
                CycleOutcome::BridgeRejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn candidates(
        &self,
        trigger: CycleTrigger,
        manual: Option<&str>,
        incumbent: Option<&BridgeSnapshot>,
    ) -> VecDeque<Pair> {
        let observations = self.inventory.snapshot().await;
        let mut pairs = VecDeque::new();

        for obs in observations {
            match (manual, incumbent) {
                (Some(bssid), _) if obs.bssid != bssid => continue,
                // The incumbent's radio is busy bridging; re-testing it would
                // need a second association
                (None, Some(current)) if trigger != CycleTrigger::LinkLost && obs.bssid == current.bssid => {
                    continue
                }
                _ => {}
            }
            for module in &self.modules {
                if module.accepts(&obs) {
                    pairs.push_back((obs.clone(), Arc::clone(module)));
                }
            }
        }

        pairs
    }

    /// Run every pair, bounded by idle radios and the cycle deadline.
    /// Returns the best successful attempt seen.
    async fn dispatch(
        &self,
        mut queue: VecDeque<Pair>,
        attempts: &mut Vec<ConnectionAttempt>,
        deadline: Instant,
    ) -> Option<Leader> {
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut leader: Option<Leader> = None;

        loop {
            while !queue.is_empty() {
                let lease = match self.pool.lease(false) {
                    Ok(lease) => lease,
                    Err(NetworkError::NoIdleRadio) => break,
                    Err(e) => {
                        warn!("Cannot lease a connection radio: {}", e);
                        break;
                    }
                };
                if let Some((observation, module)) = queue.pop_front() {
                    self.spawn_attempt(&mut tasks, observation, module, lease);
                }
            }

            if tasks.is_empty() {
                if queue.is_empty() {
                    break;
                }
                // Dispatch is blocked and nothing in flight will free a radio.
                // Give up the leader's radio; it is re-established at the end.
                match leader.as_mut().and_then(|l| l.lease.take()) {
                    Some(lease) => {
                        debug!("Releasing provisional winner's radio {} to continue", lease.interface());
                        self.release(lease).await;
                        continue;
                    }
                    None => {
                        warn!("No connection radio free, skipping {} pair(s)", queue.len());
                        break;
                    }
                }
            }

            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(finished))) => self.absorb(finished, &mut leader, attempts).await,
                Ok(Some(Err(e))) => warn!("Attempt task failed: {}", e),
                Ok(None) => {}
                Err(_) => {
                    warn!(
                        "Cycle deadline reached, aborting {} attempt(s) and {} queued",
                        tasks.len(),
                        queue.len()
                    );
                    tasks.abort_all();
                    while let Some(result) = tasks.join_next().await {
                        if let Ok(finished) = result {
                            self.absorb(finished, &mut leader, attempts).await;
                        }
                    }
                    break;
                }
            }
        }

        leader
    }

    fn spawn_attempt(
        &self,
        tasks: &mut JoinSet<Finished>,
        observation: NetworkObservation,
        module: Arc<dyn EvaluationModule>,
        lease: RadioLease,
    ) {
        let limit = self.config.attempt_timeout;
        debug!(
            "Dispatching {} attempt on {} for {}",
            module.kind(),
            lease.interface(),
            observation.ssid
        );

        tasks.spawn(async move {
            let started_at = Utc::now();
            let attempt = match timeout(limit, module.attempt(&observation, &lease)).await {
                Ok(attempt) => attempt,
                Err(_) => {
                    let err = NetworkError::AttemptTimeout(limit.as_millis() as u64);
                    lease.record_fault(err.to_string());
                    ConnectionAttempt::failed(
                        module.kind(),
                        &observation,
                        lease.interface(),
                        started_at,
                        err.to_string(),
                    )
                }
            };
            Finished {
                attempt,
                observation,
                lease,
                module,
            }
        });
    }

    /// Score a finished attempt; keep its radio only if it leads
    async fn absorb(&self, finished: Finished, leader: &mut Option<Leader>, attempts: &mut Vec<ConnectionAttempt>) {
        let Finished {
            attempt,
            observation,
            lease,
            module,
        } = finished;
        attempts.push(attempt.clone());

        let Some(score) = self.scorer.calculate_score(&attempt) else {
            debug!("{} on {}: {:?}", attempt.module, attempt.ssid, attempt.outcome);
            self.release(lease).await;
            return;
        };

        let leads = leader.as_ref().map_or(true, |l| scoring::beats(&score, &l.score));
        if !leads || lease.fault().is_some() {
            self.release(lease).await;
            return;
        }

        info!("New leader: {} via {} ({:.1})", attempt.ssid, attempt.module, score.total);
        let previous = leader.replace(Leader {
            attempt,
            observation,
            score,
            module,
            lease: Some(lease),
        });
        if let Some(lease) = previous.and_then(|p| p.lease) {
            self.release(lease).await;
        }
    }

    /// Bring the leader back up after its radio was given away. Bounded by
    /// the attempt timeout and whatever is left of the cycle.
    async fn reestablish(
        &self,
        leader: Leader,
        attempts: &mut Vec<ConnectionAttempt>,
        deadline: Instant,
    ) -> Option<Leader> {
        self.pool.recheck_errored(self.backend.as_ref()).await;
        let lease = match self.pool.lease(false) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Cannot re-establish {}: {}", leader.attempt.ssid, e);
                return None;
            }
        };

        info!("Re-establishing {} on {}", leader.observation.ssid, lease.interface());
        let started_at = Utc::now();
        let bound = deadline.min(Instant::now() + self.config.attempt_timeout);
        let attempt = match timeout_at(bound, leader.module.attempt(&leader.observation, &lease)).await {
            Ok(attempt) => attempt,
            Err(_) => {
                let reason = if Instant::now() >= deadline {
                    warn!("Cycle deadline reached while re-establishing {}", leader.observation.ssid);
                    "cycle deadline reached".to_string()
                } else {
                    NetworkError::AttemptTimeout(self.config.attempt_timeout.as_millis() as u64).to_string()
                };
                lease.record_fault(reason.clone());
                ConnectionAttempt::failed(
                    leader.module.kind(),
                    &leader.observation,
                    lease.interface(),
                    started_at,
                    reason,
                )
            }
        };
        attempts.push(attempt.clone());

        match self.scorer.calculate_score(&attempt) {
            Some(score) if lease.fault().is_none() => Some(Leader {
                attempt,
                observation: leader.observation,
                score,
                module: leader.module,
                lease: Some(lease),
            }),
            _ => {
                warn!("Re-establishing {} failed: {:?}", leader.attempt.ssid, attempt.outcome);
                self.release(lease).await;
                None
            }
        }
    }

    /// Disassociate and hand the radio back; faulted radios go to error
    async fn release(&self, lease: RadioLease) {
        let disassociated = self.backend.disassociate(lease.interface()).await;
        match (lease.fault(), disassociated) {
            (Some(fault), _) => lease.release(LeaseEnd::Error(fault)),
            (None, Err(e)) => lease.release(LeaseEnd::Error(format!("disassociate failed: {}", e))),
            (None, Ok(())) => lease.release(LeaseEnd::Idle),
        }
    }

    async fn record(&self, attempts: &[ConnectionAttempt]) {
        if !self.store.is_available() {
            return;
        }
        for attempt in attempts {
            let (Some(score), Some(metrics)) = (self.scorer.calculate_score(attempt), attempt.metrics) else {
                continue;
            };
            let record = MeasurementRecord {
                bssid: attempt.bssid.clone(),
                ssid: attempt.ssid.clone(),
                module: attempt.module.to_string(),
                interface: attempt.interface.clone(),
                signal: attempt.signal,
                download_mbps: metrics.download_mbps,
                upload_mbps: metrics.upload_mbps,
                ping_ms: metrics.ping_ms,
                score: score.total,
                recorded_at: attempt.started_at,
            };
            if let Err(e) = self.store.record_measurement(&record).await {
                warn!("Failed to record measurement for {}: {}", attempt.ssid, e);
            }
        }
    }
}
