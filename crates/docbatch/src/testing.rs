//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::converter::{ConversionOutcome, ConversionRequest, Converter};
use crate::db::Database;
use crate::error::StorageError;
use crate::model::NewFileConversion;
use crate::orchestrator::{Orchestrator, StartedJob};
use crate::storage::{MemoryObjectClient, ObjectLocator, ObjectStoreBackend, StorageBackend};

/// Copies the input to `converted/<file_id>/<file_name>.pdf`; file names
/// containing "bad" fail.
pub struct CopyConverter {
    pub storage: Arc<dyn StorageBackend>,
}

#[async_trait]
impl Converter for CopyConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutcome, StorageError> {
        if request.file_name.contains("bad") {
            return Ok(ConversionOutcome::failed("unsupported document"));
        }
        let bytes = self.storage.get(&request.input_key).await?;
        let locator = ObjectLocator::new(
            &request.job_id,
            &format!("converted/{}/{}.pdf", request.file_id, request.file_name),
        )?;
        Ok(ConversionOutcome::succeeded(
            self.storage.put(&locator, &bytes).await?,
        ))
    }
}

pub struct Fixture {
    pub client: Arc<MemoryObjectClient>,
    pub storage: Arc<dyn StorageBackend>,
    pub orchestrator: Arc<Orchestrator>,
}

/// In-memory database and bucket wired to a [`CopyConverter`].
pub fn fixture() -> Fixture {
    let client = Arc::new(MemoryObjectClient::new());
    let storage: Arc<dyn StorageBackend> =
        Arc::new(ObjectStoreBackend::new(client.clone(), "https://bucket.example"));
    let converter = Arc::new(CopyConverter {
        storage: storage.clone(),
    });
    let orchestrator = Orchestrator::new(
        Database::open_in_memory().expect("in-memory database"),
        storage.clone(),
        converter,
    );
    Fixture {
        client,
        storage,
        orchestrator: Arc::new(orchestrator),
    }
}

impl Fixture {
    /// Stores one input per name (contents = the name) and starts a job.
    pub async fn start(&self, names: &[&str]) -> StartedJob {
        let job_id = Uuid::new_v4().to_string();
        let mut files = Vec::new();
        for name in names {
            let mut file = NewFileConversion::new(name, "");
            let locator = ObjectLocator::new(&job_id, &format!("{}/{}", file.id, name))
                .expect("valid locator");
            file.input_key = self
                .storage
                .put(&locator, name.as_bytes())
                .await
                .expect("stored input");
            files.push(file);
        }
        self.orchestrator
            .start_with_id(&job_id, files)
            .expect("job started")
    }
}
