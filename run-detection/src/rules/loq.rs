use crate::error::RuleError;
use crate::job_request::JobRequest;

const USER_FILE_DIR: &str = "/extras/loq";

pub(super) fn user_file(user_file: &str, job_request: &mut JobRequest) -> Result<(), RuleError> {
    // With the M4 monitor the scatter run doubles as its own transmission
    job_request.set_value("included_trans_as_scatter", user_file.contains("_M4"));
    job_request.set_value("user_file", format!("{USER_FILE_DIR}/{user_file}"));
    Ok(())
}
