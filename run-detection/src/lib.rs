//! Decides whether a newly written run data file should be reduced, and
//! schedules a reduction job for it when it should.
//!
//! A file notification arrives on the ingress, the file's metadata is read into
//! a [`job_request::JobRequest`], the instrument's [`rules::Specification`] is
//! applied to it, and runs that survive are published on the egress.
pub mod app_context;
pub mod broker;
pub mod config;
pub mod container;
pub mod detection;
pub mod error;
pub mod ingestion;
pub mod job_request;
pub mod kafka;
pub mod metric_consts;
pub mod retry;
pub mod rules;
pub mod specification;
pub mod test_utils;
pub mod worker;
