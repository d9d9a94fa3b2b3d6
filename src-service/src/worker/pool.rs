//! Worker pool lifecycle: spawn one worker per device, gate dispatch
//! behind a readiness barrier, restart dead workers once per session,
//! drain on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::{BoxFuture, JobContext, UnitWorker, WorkerError, WorkerId};
use crate::partition::WorkUnit;
use subtext_common::types::{UnitResult, WorkerState};

/// Spawns workers. The production implementation launches
/// `subtext-worker` processes; tests inject in-process fakes.
pub trait WorkerFactory: Send + Sync + 'static {
    fn spawn(
        &self,
        id: WorkerId,
        device: u32,
    ) -> BoxFuture<'_, Result<Box<dyn UnitWorker>, WorkerError>>;
}

/// Exclusive handle to one pool slot and its worker.
///
/// The scheduler owns leases for the duration of a run; each lease
/// enforces the one-in-flight-unit rule through `&mut` access and
/// carries the slot's once-per-session respawn budget.
pub struct Lease {
    id: WorkerId,
    device: u32,
    worker: Option<Box<dyn UnitWorker>>,
    state: WorkerState,
    respawn_used: bool,
    factory: Option<Arc<dyn WorkerFactory>>,
    respawns: Arc<AtomicUsize>,
}

impl Lease {
    /// Lease not backed by a pool: the single-mode in-process engine.
    /// It has no factory, so a fatal failure cannot be respawned away.
    pub fn detached(worker: Box<dyn UnitWorker>) -> Self {
        Self {
            id: worker.id(),
            device: 0,
            worker: Some(worker),
            state: WorkerState::Ready,
            respawn_used: false,
            factory: None,
            respawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.worker.is_some()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn transcribe(
        &mut self,
        unit: &WorkUnit,
        ctx: &JobContext,
    ) -> Result<UnitResult, WorkerError> {
        let worker = self.worker.as_mut().ok_or(WorkerError::Dead)?;
        self.state = WorkerState::Busy;
        let result = worker.transcribe(unit, ctx).await;
        self.state = match &result {
            Ok(_) => WorkerState::Ready,
            Err(_) => WorkerState::Dead,
        };
        if self.state == WorkerState::Dead {
            self.worker = None;
        }
        result
    }

    /// Mark the worker dead and respawn it, once per session. Further
    /// deaths leave the lease dead and the error propagates.
    pub async fn respawn(&mut self) -> Result<(), WorkerError> {
        self.worker = None;
        self.state = WorkerState::Dead;

        let factory = Arc::clone(self.factory.as_ref().ok_or(WorkerError::Dead)?);
        if self.respawn_used {
            return Err(WorkerError::Dead);
        }
        self.respawn_used = true;

        self.state = WorkerState::Spawning;
        warn!("Respawning worker {} on device {}", self.id, self.device);
        match factory.spawn(self.id, self.device).await {
            Ok(worker) => {
                self.respawns.fetch_add(1, Ordering::SeqCst);
                self.worker = Some(worker);
                self.state = WorkerState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = WorkerState::Dead;
                Err(e)
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.state = WorkerState::Draining;
        if let Some(worker) = self.worker.as_mut() {
            worker.shutdown().await;
        }
        self.worker = None;
        self.state = WorkerState::Dead;
    }

    /// Take the worker back out of a detached lease.
    pub fn into_worker(self) -> Option<Box<dyn UnitWorker>> {
        self.worker
    }
}

/// Pool of one worker per device.
pub struct WorkerPool {
    devices: Vec<u32>,
    factory: Arc<dyn WorkerFactory>,
    parked: Mutex<Vec<Lease>>,
    respawns: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn one worker per device and wait until every one of them is
    /// ready, so the first dispatch never pays a visible cold-load.
    /// A worker that fails to spawn is retried once; a second failure
    /// fails the pool.
    pub async fn start(
        factory: Arc<dyn WorkerFactory>,
        devices: Vec<u32>,
    ) -> Result<Self, WorkerError> {
        if devices.is_empty() {
            return Err(WorkerError::Spawn("no devices configured".to_string()));
        }

        let respawns = Arc::new(AtomicUsize::new(0));
        let mut join = tokio::task::JoinSet::new();
        for (id, &device) in devices.iter().enumerate() {
            let factory = Arc::clone(&factory);
            join.spawn(async move {
                let worker = match factory.spawn(id, device).await {
                    Ok(worker) => worker,
                    Err(first) => {
                        warn!(
                            "Worker {} failed to spawn ({}); retrying once",
                            id, first
                        );
                        factory.spawn(id, device).await?
                    }
                };
                Ok::<_, WorkerError>((id, device, worker))
            });
        }

        let mut spawned: Vec<Option<(u32, Box<dyn UnitWorker>)>> =
            (0..devices.len()).map(|_| None).collect();
        while let Some(joined) = join.join_next().await {
            let (id, device, worker) = joined
                .map_err(|e| WorkerError::Spawn(format!("spawn task failed: {}", e)))??;
            spawned[id] = Some((device, worker));
        }

        let respawns_ref = Arc::clone(&respawns);
        let leases = spawned
            .into_iter()
            .enumerate()
            .map(|(id, slot)| {
                let (device, worker) = slot.expect("barrier collected every worker");
                Lease {
                    id,
                    device,
                    worker: Some(worker),
                    state: WorkerState::Ready,
                    respawn_used: false,
                    factory: Some(Arc::clone(&factory)),
                    respawns: Arc::clone(&respawns_ref),
                }
            })
            .collect::<Vec<_>>();

        info!("Worker pool ready: {} worker(s)", leases.len());

        Ok(Self {
            devices,
            factory,
            parked: Mutex::new(leases),
            respawns,
        })
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    /// Total respawn events over the pool lifetime.
    pub fn respawn_count(&self) -> usize {
        self.respawns.load(Ordering::SeqCst)
    }

    /// Take every lease for a scheduling run. Workers that died in an
    /// earlier session are revived here (not charged to the new
    /// session's respawn budget), and every budget is reset.
    pub async fn lease_all(&self) -> Result<Vec<Lease>, WorkerError> {
        let mut leases: Vec<Lease> = {
            let mut parked = self.parked.lock().unwrap();
            parked.drain(..).collect()
        };
        if leases.is_empty() {
            return Err(WorkerError::Spawn(
                "pool workers are already leased".to_string(),
            ));
        }

        for lease in &mut leases {
            lease.respawn_used = false;
            if lease.worker.is_none() {
                let worker = self.factory.spawn(lease.id, lease.device).await?;
                lease.worker = Some(worker);
                lease.state = WorkerState::Ready;
            }
        }

        Ok(leases)
    }

    /// Return leases after a run. Dead leases come back too, so the
    /// next session can revive them.
    pub fn restore(&self, mut leases: Vec<Lease>) {
        leases.sort_by_key(|l| l.id);
        let mut parked = self.parked.lock().unwrap();
        parked.extend(leases);
    }

    /// Drain every worker.
    pub async fn shutdown(&self) {
        let mut leases: Vec<Lease> = {
            let mut parked = self.parked.lock().unwrap();
            parked.drain(..).collect()
        };
        for lease in &mut leases {
            lease.shutdown().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn start_spawns_one_worker_per_device() {
        let factory = FakeFactory::new(vec![]);
        let pool = WorkerPool::start(factory.clone(), vec![0, 1, 2, 3])
            .await
            .unwrap();

        assert_eq!(pool.size(), 4);
        assert_eq!(factory.spawn_count.load(Ordering::SeqCst), 4);

        let leases = pool.lease_all().await.unwrap();
        let ids: Vec<WorkerId> = leases.iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(leases.iter().all(|l| l.is_alive()));
        pool.restore(leases);
    }

    #[tokio::test]
    async fn spawn_failure_is_retried_once() {
        let factory = FakeFactory::with_failing_spawns(vec![], 1);
        let pool = WorkerPool::start(factory.clone(), vec![0, 1]).await.unwrap();
        assert_eq!(pool.size(), 2);
        // 2 workers + 1 retry.
        assert_eq!(factory.spawn_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_spawn_failure_fails_the_pool() {
        let factory = FakeFactory::with_failing_spawns(vec![], 8);
        let result = WorkerPool::start(factory, vec![0]).await;
        assert!(matches!(result, Err(WorkerError::Spawn(_))));
    }

    #[tokio::test]
    async fn empty_device_list_is_rejected() {
        let factory = FakeFactory::new(vec![]);
        assert!(matches!(
            WorkerPool::start(factory, vec![]).await,
            Err(WorkerError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn respawn_budget_is_one_per_session() {
        let factory = FakeFactory::new(vec![]);
        let pool = WorkerPool::start(factory.clone(), vec![0]).await.unwrap();

        let mut leases = pool.lease_all().await.unwrap();
        let lease = &mut leases[0];

        lease.respawn().await.unwrap();
        assert!(lease.is_alive());
        assert_eq!(pool.respawn_count(), 1);

        // Second death within the session: budget exhausted.
        assert!(matches!(lease.respawn().await, Err(WorkerError::Dead)));
        assert!(!lease.is_alive());

        // A new session gets a fresh budget and a revived worker.
        pool.restore(leases);
        let mut leases = pool.lease_all().await.unwrap();
        assert!(leases[0].is_alive());
        leases[0].respawn().await.unwrap();
        pool.restore(leases);
    }

    #[tokio::test]
    async fn detached_lease_cannot_respawn() {
        let factory = FakeFactory::new(vec![]);
        let worker = factory.spawn(0, 0).await.unwrap();
        let mut lease = Lease::detached(worker);
        assert!(matches!(lease.respawn().await, Err(WorkerError::Dead)));
    }

    #[tokio::test]
    async fn shutdown_drains_all_workers() {
        let factory = FakeFactory::new(vec![]);
        let pool = WorkerPool::start(factory, vec![0, 1]).await.unwrap();
        pool.shutdown().await;
        assert!(pool.lease_all().await.is_err());
    }
}
