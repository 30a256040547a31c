use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::container::ContainerOpener;
use crate::error::DetectionError;
use crate::ingestion::ingest;
use crate::job_request::JobRequest;
use crate::specification::SpecificationStore;

/// Turns a data file into a fully evaluated JobRequest.
///
/// Errors are returned as they are; deciding between requeue and reject is up to
/// the caller.
pub struct Detector {
    opener: Arc<dyn ContainerOpener>,
    store: Arc<dyn SpecificationStore>,
}

impl Detector {
    pub fn new(opener: Arc<dyn ContainerOpener>, store: Arc<dyn SpecificationStore>) -> Self {
        Self { opener, store }
    }

    pub async fn detect(&self, path: &Path) -> Result<JobRequest, DetectionError> {
        // Reading the container is blocking file I/O
        let opener = self.opener.clone();
        let owned_path: PathBuf = path.to_owned();
        let mut job_request =
            tokio::task::spawn_blocking(move || ingest(opener.as_ref(), &owned_path)).await??;

        let specification = self
            .store
            .get_specification(&job_request.instrument)
            .await
            .map_err(|source| DetectionError::Specification {
                instrument: job_request.instrument.clone(),
                run_number: job_request.run_number,
                source,
            })?;

        // Stitch rules open the data files of earlier runs
        let opener = self.opener.clone();
        let (job_request, verified) = tokio::task::spawn_blocking(move || {
            let verified = specification.verify(&mut job_request, opener.as_ref());
            (job_request, verified)
        })
        .await?;
        verified.map_err(|source| DetectionError::Rule {
            instrument: job_request.instrument.clone(),
            run_number: job_request.run_number,
            source,
        })?;

        Ok(job_request)
    }
}

/// The data file path carried by an ingress message: either the bare path or a
/// JSON string holding it.
pub fn parse_payload(payload: Option<&[u8]>) -> Result<PathBuf, DetectionError> {
    let payload = payload.ok_or_else(|| DetectionError::Payload("empty message".to_owned()))?;
    let text = std::str::from_utf8(payload)
        .map_err(|e| DetectionError::Payload(format!("payload is not UTF-8: {e}")))?
        .trim();

    let path = match serde_json::from_str::<String>(text) {
        Ok(path) => path,
        Err(_) => text.to_owned(),
    };
    if path.trim().is_empty() {
        return Err(DetectionError::Payload("payload holds no path".to_owned()));
    }
    Ok(PathBuf::from(path.trim()))
}
