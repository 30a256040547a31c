use crate::error::RuleError;
use crate::job_request::JobRequest;

/// Permalink of the mask file the reduction script downloads.
pub(super) fn mask_file(link: &str, job_request: &mut JobRequest) -> Result<(), RuleError> {
    job_request.set_value("mask_file_link", link);
    Ok(())
}

/// White beam vanadium run of the current cycle, chosen by the instrument scientists.
pub(super) fn wbvan(wbvan: i64, job_request: &mut JobRequest) -> Result<(), RuleError> {
    job_request.set_value("wbvan", wbvan);
    Ok(())
}
