use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use tuner_core::types::DatasetId;

use crate::backend::UploadBackend;

/// The dataset a session uploads into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDataset {
    pub id: DatasetId,
    pub name: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("dataset creation failed: {0}")]
    Create(String),
    #[error("dataset creation was abandoned before it finished")]
    Abandoned,
}

type FlightResult = Option<Result<BoundDataset, SessionError>>;

enum SessionState {
    Unbound,
    /// One caller is creating the dataset; everyone else waits on this channel.
    Creating(watch::Receiver<FlightResult>),
    Bound(BoundDataset),
}

enum Step {
    Done(BoundDataset),
    Wait(watch::Receiver<FlightResult>),
    Lead(watch::Sender<FlightResult>),
}

/// Lazily creates the dataset an upload session attaches to.
///
/// The first caller of [`DatasetSession::ensure_dataset`] creates it; callers that
/// arrive while that creation is in flight share its result. A failed creation
/// leaves the session unbound so the next call tries again.
pub struct DatasetSession {
    backend: Arc<dyn UploadBackend>,
    name: Option<String>,
    description: Option<String>,
    state: Mutex<SessionState>,
}

impl DatasetSession {
    pub fn new(backend: Arc<dyn UploadBackend>) -> Self {
        Self::with_name(backend, None, None)
    }

    pub fn with_name(
        backend: Arc<dyn UploadBackend>,
        name: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            backend,
            name: name.filter(|n| !n.trim().is_empty()),
            description,
            state: Mutex::new(SessionState::Unbound),
        }
    }

    /// A session already attached to an existing dataset.
    pub fn bound(backend: Arc<dyn UploadBackend>, dataset: BoundDataset) -> Self {
        Self {
            backend,
            name: None,
            description: None,
            state: Mutex::new(SessionState::Bound(dataset)),
        }
    }

    pub fn bound_dataset(&self) -> Option<BoundDataset> {
        match &*lock(&self.state) {
            SessionState::Bound(ds) => Some(ds.clone()),
            _ => None,
        }
    }

    pub async fn ensure_dataset(&self) -> Result<BoundDataset, SessionError> {
        let step = {
            let mut state = lock(&self.state);
            match &*state {
                SessionState::Bound(ds) => Step::Done(ds.clone()),
                SessionState::Creating(rx) => Step::Wait(rx.clone()),
                SessionState::Unbound => {
                    let (tx, rx) = watch::channel(None);
                    *state = SessionState::Creating(rx);
                    Step::Lead(tx)
                }
            }
        };

        match step {
            Step::Done(ds) => Ok(ds),
            Step::Wait(mut rx) => {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(v) => v.clone(),
                    Err(_) => None,
                };
                outcome.unwrap_or(Err(SessionError::Abandoned))
            }
            Step::Lead(tx) => {
                let flight = FlightGuard {
                    state: &self.state,
                    tx: Some(tx),
                };
                let result = self.create().await;
                flight.complete(result)
            }
        }
    }

    async fn create(&self) -> Result<BoundDataset, SessionError> {
        let name = self.name.clone().unwrap_or_else(default_dataset_name);
        match self
            .backend
            .create_dataset(&name, self.description.as_deref())
            .await
        {
            Ok(ds) => {
                info!(
                    target: "tuner_events",
                    event = "dataset_created",
                    dataset_id = %ds.id,
                    name = %ds.name,
                    "created dataset"
                );
                Ok(BoundDataset {
                    id: ds.id,
                    name: ds.name,
                })
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "dataset creation failed");
                Err(SessionError::Create(format!("{err:#}")))
            }
        }
    }
}

/// Publishes the creation result, or resets the session if the creator is dropped.
struct FlightGuard<'a> {
    state: &'a Mutex<SessionState>,
    tx: Option<watch::Sender<FlightResult>>,
}

impl FlightGuard<'_> {
    fn complete(
        mut self,
        result: Result<BoundDataset, SessionError>,
    ) -> Result<BoundDataset, SessionError> {
        *lock(self.state) = match &result {
            Ok(ds) => SessionState::Bound(ds.clone()),
            Err(_) => SessionState::Unbound,
        };
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result.clone()));
        }
        result
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Still holding the sender means `complete` never ran.
        if let Some(tx) = self.tx.take() {
            *lock(self.state) = SessionState::Unbound;
            drop(tx);
        }
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn default_dataset_name() -> String {
    chrono::Utc::now()
        .format("Dataset %Y-%m-%d %H:%M:%S")
        .to_string()
}
