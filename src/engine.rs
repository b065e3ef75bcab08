//! Wires the components together and owns the sync workers.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::ChangeBus;
use crate::config::Config;
use crate::facade::CacheFacade;
use crate::location::LocationTrigger;
use crate::remote::{HttpRemote, RemoteSource};
use crate::store::{LocalStore, StoreError};
use crate::sync::{Resync, SyncCoordinator};

pub struct Engine {
  coordinator: Arc<SyncCoordinator>,
  facade: CacheFacade,
  location: LocationTrigger,
  shutdown: watch::Sender<bool>,
  workers: Vec<JoinHandle<()>>,
}

impl Engine {
  /// Open the on-disk store and the HTTP remote described by `config`.
  pub fn open(config: &Config) -> Result<Self> {
    let path = config.database_path()?;
    let store = LocalStore::open(&path, ChangeBus::new(), config.sync.storage_timeout())
      .map_err(|e| eyre!("Failed to open record store {}: {}", path.display(), e))?;
    info!(path = %path.display(), "Record store ready");

    let token = Config::get_api_token();
    if token.is_none() {
      warn!("No API token set, requests will be anonymous");
    }
    let remote = HttpRemote::new(&config.remote, token, config.sync.request_timeout())?;

    Ok(Self::assemble(config, Arc::new(store), Arc::new(remote)))
  }

  /// Build an engine around an existing store and remote source.
  pub fn assemble(config: &Config, store: Arc<LocalStore>, remote: Arc<dyn RemoteSource>) -> Self {
    let coordinator = Arc::new(SyncCoordinator::new(
      Arc::clone(&store),
      remote,
      config.sync.clone(),
    ));
    let facade = CacheFacade::new(
      store,
      Arc::clone(&coordinator),
      config.sync.refresh_on_read,
      config.sync.region_staleness(),
    );
    let location = LocationTrigger::new(Arc::clone(&coordinator), config.location.clone());
    let (shutdown, _) = watch::channel(false);

    Self {
      coordinator,
      facade,
      location,
      shutdown,
      workers: Vec::new(),
    }
  }

  /// Start the workers and requeue whatever the last run left unfinished.
  /// Must be called from within a tokio runtime.
  pub fn start(&mut self) -> Result<Resync, StoreError> {
    if self.workers.is_empty() {
      self.workers = self.coordinator.spawn_workers(self.shutdown.subscribe());
      debug!(workers = self.workers.len(), "Sync workers started");
    }
    self.coordinator.resync(Utc::now())
  }

  pub fn facade(&self) -> &CacheFacade {
    &self.facade
  }

  pub fn location(&self) -> &LocationTrigger {
    &self.location
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
    &self.coordinator
  }

  /// The device is back online: retry everything that is still owed.
  pub fn connectivity_restored(&self) -> Result<Resync, StoreError> {
    info!("Connectivity restored");
    self.coordinator.resync(Utc::now())
  }

  /// Stop the workers. Tasks in flight finish first; pending ones are
  /// dropped and rebuilt by the next start.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    for worker in self.workers {
      if let Err(e) = worker.await {
        warn!(error = %e, "Sync worker ended abnormally");
      }
    }
    info!("Engine stopped");
  }
}
