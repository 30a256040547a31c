use tracing::info;

use crate::error::RuleError;
use crate::job_request::JobRequest;

/// `enabled: true` only confirms the default; it never re-enables a gated run.
pub(super) fn enabled(enabled: bool, job_request: &mut JobRequest) -> Result<(), RuleError> {
    if !enabled {
        job_request.skip();
    }
    Ok(())
}

pub(super) fn skip_titles_including(
    fragments: &[String],
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    let title = job_request.experiment_title.to_lowercase();
    if let Some(fragment) = fragments
        .iter()
        .find(|fragment| title.contains(&fragment.to_lowercase()))
    {
        info!(
            run_number = job_request.run_number,
            "title {:?} contains {:?}", job_request.experiment_title, fragment
        );
        job_request.skip();
    }
    Ok(())
}

pub(super) fn allowed_instruments(
    allowed: &[String],
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    if !allowed
        .iter()
        .any(|instrument| instrument.eq_ignore_ascii_case(&job_request.instrument))
    {
        job_request.skip();
    }
    Ok(())
}

/// SANS reductions start from a scatter run. Transmission and direct runs are
/// picked up later as inputs of the scatter they belong to.
pub(super) fn check_if_scatter_sans(
    check: bool,
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    if !check {
        return Ok(());
    }
    let title = &job_request.experiment_title;
    if !title.contains("_SANS/TRANS") {
        info!(
            run_number = job_request.run_number,
            "not a scatter run, no _SANS/TRANS in the title"
        );
        job_request.skip();
        return Ok(());
    }
    if ["empty", "EMPTY", "direct", "DIRECT"]
        .iter()
        .any(|marker| title.contains(marker))
    {
        info!(
            run_number = job_request.run_number,
            "scatter of an empty can or direct beam"
        );
        job_request.skip();
    }
    Ok(())
}

/// True if `x` lies within 5% of `y`, on either side of zero.
pub fn is_y_within_5_percent_of_x(x: f64, y: f64) -> bool {
    if y >= 0.0 {
        y * 0.95 <= x && x <= y * 1.05
    } else {
        y * 0.95 >= x && x >= y * 1.05
    }
}
