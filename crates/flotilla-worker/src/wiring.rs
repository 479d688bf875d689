use std::sync::Arc;
use std::time::Duration;

use flotilla_controller::{
    ControllerPool, DeviceReconciler, EventEmitter, FleetVersioner, OwnerResolver, PoolOptions,
    RepositoryChecker, ResourceSyncController, RolloutController, WorkQueue,
};
use flotilla_domain::{OrgId, ResourceKind};
use flotilla_repo::RepoFetcher;
use flotilla_store::{Store, StoreError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

type Key = (OrgId, String);

pub struct EngineOptions {
    pub org: String,
    pub workers: usize,
    pub sync_interval: Duration,
    pub sweep_interval: Duration,
}

/// All controller pools plus the routing and tick tasks that feed them.
pub struct Engine {
    pools: Vec<ControllerPool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn start(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn RepoFetcher>,
        options: EngineOptions,
    ) -> Self {
        let org = OrgId::new(&options.org);

        let device_queue: WorkQueue<Key> = WorkQueue::new();
        let owner_queue: WorkQueue<Key> = WorkQueue::new();
        let versioner_queue: WorkQueue<Key> = WorkQueue::new();
        let rollout_queue: WorkQueue<Key> = WorkQueue::new();
        let sync_queue: WorkQueue<Key> = WorkQueue::new();
        let repository_queue: WorkQueue<Key> = WorkQueue::new();

        let pool_options = PoolOptions {
            workers: options.workers,
            ..Default::default()
        };

        let pools = vec![
            ControllerPool::spawn(
                Arc::new(DeviceReconciler::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/device-controller"),
                )),
                device_queue.clone(),
                pool_options.clone(),
            ),
            ControllerPool::spawn(
                Arc::new(OwnerResolver::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/device-controller"),
                )),
                owner_queue.clone(),
                pool_options.clone(),
            ),
            ControllerPool::spawn(
                Arc::new(FleetVersioner::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/fleet-controller"),
                )),
                versioner_queue.clone(),
                pool_options.clone(),
            ),
            ControllerPool::spawn(
                Arc::new(RolloutController::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/fleet-controller"),
                )),
                rollout_queue.clone(),
                pool_options.clone(),
            ),
            ControllerPool::spawn(
                Arc::new(ResourceSyncController::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/resource-sync"),
                    fetcher.clone(),
                )),
                sync_queue.clone(),
                pool_options.clone(),
            ),
            ControllerPool::spawn(
                Arc::new(RepositoryChecker::new(
                    store.clone(),
                    EventEmitter::new(store.clone(), "service/repository-controller"),
                    fetcher,
                )),
                repository_queue.clone(),
                pool_options,
            ),
        ];

        let mut tasks = Vec::new();

        // route store change notifications into the controller queues
        {
            let store = store.clone();
            let org = org.clone();
            let device_queue = device_queue.clone();
            let owner_queue = owner_queue.clone();
            let versioner_queue = versioner_queue.clone();
            let rollout_queue = rollout_queue.clone();
            let sync_queue = sync_queue.clone();
            let repository_queue = repository_queue.clone();

            tasks.push(tokio::spawn(async move {
                let mut changes = store.subscribe();
                loop {
                    let change = match changes.recv().await {
                        Ok(change) => change,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "change stream lagged; sweeps will catch up");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    if change.org != org {
                        continue;
                    }
                    let key = (change.org.clone(), change.name.clone());
                    match change.kind {
                        ResourceKind::Device => {
                            device_queue.add(key.clone()).await;
                            owner_queue.add(key.clone()).await;
                            // the owning fleet's rollout watches device progress
                            if let Ok(Some(device)) = store.get_device(&org, &change.name).await {
                                if let Some(owner) = &device.metadata.owner {
                                    if owner.kind == ResourceKind::Fleet {
                                        rollout_queue.add((org.clone(), owner.name.clone())).await;
                                    }
                                }
                            }
                        }
                        ResourceKind::Fleet => {
                            versioner_queue.add(key.clone()).await;
                            rollout_queue.add(key).await;
                            // selector changes can re-home any device
                            if let Ok(devices) = store.list_devices(&org).await {
                                for device in devices {
                                    owner_queue.add((org.clone(), device.metadata.name)).await;
                                }
                            }
                        }
                        ResourceKind::Repository => {
                            repository_queue.add(key).await;
                            match referencing_fleets(&store, &org, &change.name).await {
                                Ok(fleets) => {
                                    for fleet in fleets {
                                        versioner_queue.add((org.clone(), fleet)).await;
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to list fleets for repository change"),
                            }
                        }
                        ResourceKind::ResourceSync => sync_queue.add(key).await,
                        ResourceKind::TemplateVersion | ResourceKind::EnrollmentRequest => {}
                    }
                }
                info!("change routing stopped");
            }));
        }

        // periodic reconciles for externally-driven state (git, clocks)
        {
            let store = store.clone();
            let org = org.clone();
            let sync_queue = sync_queue.clone();
            let repository_queue = repository_queue.clone();
            let interval = options.sync_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Ok(syncs) = store.list_resource_syncs(&org).await {
                        for sync in syncs {
                            sync_queue.add((org.clone(), sync.metadata.name)).await;
                        }
                    }
                    if let Ok(repositories) = store.list_repositories(&org).await {
                        for repository in repositories {
                            repository_queue.add((org.clone(), repository.metadata.name)).await;
                        }
                    }
                }
            }));
        }
        {
            let org = org.clone();
            let interval = options.sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Ok(fleets) = store.list_fleets(&org).await {
                        for fleet in fleets {
                            let key = (org.clone(), fleet.metadata.name);
                            versioner_queue.add(key.clone()).await;
                            rollout_queue.add(key).await;
                        }
                    }
                    // disconnection detection needs the clock, not a change
                    if let Ok(devices) = store.list_devices(&org).await {
                        for device in devices {
                            device_queue.add((org.clone(), device.metadata.name)).await;
                        }
                    }
                }
            }));
        }

        Self { pools, tasks }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        for pool in self.pools {
            pool.shutdown();
        }
    }
}

async fn referencing_fleets(
    store: &Arc<dyn Store>,
    org: &OrgId,
    repository: &str,
) -> Result<Vec<String>, StoreError> {
    Ok(store
        .list_fleets(org)
        .await?
        .into_iter()
        .filter(|fleet| {
            fleet
                .spec
                .template
                .spec
                .config
                .iter()
                .any(|provider| provider.repository() == Some(repository))
        })
        .map(|fleet| fleet.metadata.name)
        .collect())
}
