//! Stitch rules. When the runs just before this one are more of the same
//! measurement, an extra request reduces all of them together.
//!
//! Earlier runs are found by walking back one run number at a time through the
//! directory of the current file, for as long as the previous file opens and its
//! title is similar enough.
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::container::ContainerOpener;
use crate::error::RuleError;
use crate::job_request::JobRequest;

fn run_title(opener: &dyn ContainerOpener, path: &Path) -> Option<String> {
    let container = opener.open(path).ok()?;
    container
        .dataset("title")
        .and_then(|dataset| dataset.first_text())
}

/// The current run followed by every directly preceding run that belongs with it,
/// newest first.
fn related_runs(
    opener: &dyn ContainerOpener,
    job_request: &JobRequest,
    file_name: impl Fn(i64) -> String,
    similar: impl Fn(&str, &str) -> bool,
) -> Vec<i64> {
    let directory = Path::new(&job_request.filepath)
        .parent()
        .unwrap_or_else(|| Path::new(""));
    let mut runs = vec![job_request.run_number];

    let mut run_number = job_request.run_number - 1;
    while run_number > 0 {
        match run_title(opener, &directory.join(file_name(run_number))) {
            Some(title) if similar(&job_request.experiment_title, &title) => runs.push(run_number),
            _ => break,
        }
        run_number -= 1;
    }
    runs
}

/// A copy of `job_request` to publish after it, with no extra requests of its own.
fn stitched_copy(job_request: &JobRequest, runs: &[i64]) -> JobRequest {
    info!(
        instrument = %job_request.instrument,
        run_number = job_request.run_number,
        runs = ?runs,
        "stitching runs"
    );
    let mut stitched = job_request.clone();
    stitched.additional_requests.clear();
    stitched
}

/// The first `n` characters of `title`, or all of it when shorter.
fn prefix(title: &str, n: usize) -> &str {
    title
        .char_indices()
        .nth(n)
        .map_or(title, |(index, _)| &title[..index])
}

/// `title` without its last `n` characters, empty when it is not longer than that.
fn without_last(title: &str, n: usize) -> &str {
    prefix(title, title.chars().count().saturating_sub(n))
}

pub(super) fn mari(
    set: bool,
    job_request: &mut JobRequest,
    opener: &dyn ContainerOpener,
) -> Result<(), RuleError> {
    if !set || !job_request.will_reduce {
        return Ok(());
    }

    let runs = related_runs(
        opener,
        job_request,
        |run| format!("MAR{run}.nxs"),
        |current, previous| current == previous,
    );
    if runs.len() > 1 {
        let mut stitched = stitched_copy(job_request, &runs);
        stitched.set_value("runno", runs);
        stitched.set_value("sum_runs", true);
        job_request.additional_requests.push(stitched);
    }
    Ok(())
}

/// TOSCA titles end in a counter that changes from run to run.
fn tosca_titles_similar(current: &str, previous: &str) -> bool {
    let current: String = current.chars().filter(|c| *c != ' ').collect();
    let previous: String = previous.chars().filter(|c| *c != ' ').collect();
    without_last(&current, 4) == without_last(&previous, 4)
}

pub(super) fn tosca(
    set: bool,
    job_request: &mut JobRequest,
    opener: &dyn ContainerOpener,
) -> Result<(), RuleError> {
    if !set {
        return Ok(());
    }
    job_request.set_value("input_runs", vec![job_request.run_number]);
    if !job_request.will_reduce {
        return Ok(());
    }

    let runs = related_runs(
        opener,
        job_request,
        |run| format!("TSC{run}.nxs"),
        tosca_titles_similar,
    );
    if runs.len() > 1 {
        let mut stitched = stitched_copy(job_request, &runs);
        stitched.set_value("input_runs", runs);
        job_request.additional_requests.push(stitched);
    }
    Ok(())
}

fn molecular_spectroscopy_titles_similar(current: &str, previous: &str) -> bool {
    current == previous
        || without_last(current, 5) == without_last(previous, 5)
        || (prefix(current, 7) == prefix(previous, 7)
            && (current.contains("run") || previous.contains("run")))
}

/// Stitching for the molecular spectroscopy instruments. OSIRIS diffraction runs are
/// never summed, so they get no stitched request.
pub(super) fn molecular_spectroscopy(
    set: bool,
    job_request: &mut JobRequest,
    opener: &dyn ContainerOpener,
) -> Result<(), RuleError> {
    if !set {
        return Ok(());
    }

    let instrument = job_request.instrument.to_uppercase();
    let diffraction =
        job_request.additional_values.get("mode") == Some(&Value::from("diffraction"));
    if instrument == "OSIRIS" && diffraction {
        job_request.set_value("sum_runs", false);
        return Ok(());
    }

    job_request.set_value("input_runs", vec![job_request.run_number]);
    if !job_request.will_reduce {
        return Ok(());
    }

    let runs = related_runs(
        opener,
        job_request,
        |run| match instrument.as_str() {
            "TOSCA" => format!("TSC{run}.nxs"),
            _ => format!("{instrument}{run:08}.nxs"),
        },
        molecular_spectroscopy_titles_similar,
    );
    if runs.len() > 1 {
        let mut stitched = stitched_copy(job_request, &runs);
        stitched.set_value("input_runs", runs);
        job_request.additional_requests.push(stitched);
    }
    Ok(())
}
