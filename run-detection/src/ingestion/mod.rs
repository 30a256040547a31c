use std::path::Path;

use tracing::{debug, info};

use crate::container::{Container, ContainerOpener};
use crate::error::IngestError;
use crate::job_request::JobRequest;

pub mod extracts;

/// Build the JobRequest for the data file at `path`.
///
/// The container is opened, read and released within this call. Required fields
/// must all be present; instrument enrichment is best effort and never fails.
pub fn ingest(opener: &dyn ContainerOpener, path: &Path) -> Result<JobRequest, IngestError> {
    info!(path = %path.display(), "ingesting data file");
    let container = opener.open(path)?;

    let mut job_request = initial_job_request(container.as_ref(), path)?;

    let extract = extracts::extraction_function(&job_request.instrument);
    extract(&mut job_request, container.as_ref());

    debug!(?job_request, "built job request");
    Ok(job_request)
}

fn initial_job_request(container: &dyn Container, path: &Path) -> Result<JobRequest, IngestError> {
    let read_text = |field: &str| {
        container
            .dataset(field)
            .and_then(|dataset| dataset.first_text())
    };
    // Read first, so every later failure can name the instrument
    let beamline = read_text("beamline");

    let missing = |field: &str| IngestError::MissingMetadata {
        path: path.to_owned(),
        field: field.to_owned(),
        instrument: beamline.clone(),
    };
    let text = |field: &str| read_text(field).ok_or_else(|| missing(field));
    let int = |field: &str| {
        container
            .dataset(field)
            .and_then(|dataset| dataset.first_int())
            .ok_or_else(|| missing(field))
    };

    Ok(JobRequest {
        run_number: int("run_number")?,
        instrument: beamline.clone().ok_or_else(|| missing("beamline"))?,
        experiment_title: text("title")?,
        experiment_number: text("experiment_identifier")?,
        filepath: path.display().to_string(),
        run_start: text("start_time")?,
        run_end: text("end_time")?,
        raw_frames: int("raw_frames")?,
        good_frames: int("good_frames")?,
        users: text("user_1/name")?,
        ..JobRequest::default()
    })
}
