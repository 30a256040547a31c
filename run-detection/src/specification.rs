//! Where instrument specifications come from.
//!
//! Stores hold no cache: every call reads the current document, so operators
//! can edit a specification without restarting the service. Two messages in
//! flight while a document changes may see different versions.
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::SpecificationError;
use crate::rules::Specification;

#[async_trait]
pub trait SpecificationStore: Send + Sync {
    /// The current specification of `instrument`, or the allow-all default when the
    /// instrument has none.
    async fn get_specification(&self, instrument: &str) -> Result<Specification, SpecificationError>;
}

/// Parse one specification document. It must be a JSON object; its keys are rules.
pub fn parse_specification(
    instrument: &str,
    document: &str,
) -> Result<Specification, SpecificationError> {
    let parse_error = |reason: String| SpecificationError::Parse {
        instrument: instrument.to_owned(),
        reason,
    };

    match serde_json::from_str::<Value>(document).map_err(|e| parse_error(e.to_string()))? {
        Value::Object(rules) => Ok(Specification::from_document(&rules)?),
        other => Err(parse_error(format!("expected an object, found {other}"))),
    }
}

/// Reads `<directory>/<instrument>_specification.json`, instrument lower-cased.
pub struct DirectorySpecificationStore {
    directory: PathBuf,
}

impl DirectorySpecificationStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn document_path(&self, instrument: &str) -> PathBuf {
        self.directory
            .join(format!("{}_specification.json", instrument.to_lowercase()))
    }
}

#[async_trait]
impl SpecificationStore for DirectorySpecificationStore {
    async fn get_specification(&self, instrument: &str) -> Result<Specification, SpecificationError> {
        let path = self.document_path(instrument);
        debug!(path = %path.display(), "reading specification");

        match tokio::fs::read_to_string(&path).await {
            Ok(document) => parse_specification(instrument, &document),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(instrument, "no specification, using the default");
                Ok(Specification::default())
            }
            Err(e) => Err(SpecificationError::Unavailable {
                instrument: instrument.to_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Fetches `GET <base>/instrument/<instrument>/specification` from the
/// instrument API, authenticating with a bearer token.
pub struct ApiSpecificationStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiSpecificationStore {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("run-detection")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    pub fn document_url(&self, instrument: &str) -> String {
        format!(
            "{}/instrument/{}/specification",
            self.base_url,
            instrument.to_lowercase()
        )
    }
}

#[async_trait]
impl SpecificationStore for ApiSpecificationStore {
    async fn get_specification(&self, instrument: &str) -> Result<Specification, SpecificationError> {
        let unavailable = |reason: String| SpecificationError::Unavailable {
            instrument: instrument.to_owned(),
            reason,
        };

        let mut request = self.client.get(self.document_url(instrument));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| unavailable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                info!(instrument, "no specification, using the default");
                Ok(Specification::default())
            }
            status if status.is_success() => {
                let document = response
                    .text()
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                parse_specification(instrument, &document)
            }
            status => Err(unavailable(format!("specification API returned {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use crate::rules::Rule;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_directory_store_reads_lowercase_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mari_specification.json"),
            r#"{"enabled": true, "skipTitlesIncluding": ["calibration"]}"#,
        )
        .unwrap();
        let store = DirectorySpecificationStore::new(dir.path());

        let specification = store.get_specification("MARI").await.unwrap();

        assert_eq!(
            specification.rules(),
            &[
                Rule::Enabled(true),
                Rule::SkipTitlesIncluding(vec!["calibration".to_owned()])
            ]
        );
    }

    #[tokio::test]
    async fn test_directory_store_rereads_on_every_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySpecificationStore::new(dir.path());
        let path = store.document_path("LOQ");

        std::fs::write(&path, r#"{"enabled": true}"#).unwrap();
        let before = store.get_specification("LOQ").await.unwrap();
        std::fs::write(&path, r#"{"enabled": false}"#).unwrap();
        let after = store.get_specification("LOQ").await.unwrap();

        assert_eq!(before.rules(), &[Rule::Enabled(true)]);
        assert_eq!(after.rules(), &[Rule::Enabled(false)]);
    }

    #[tokio::test]
    async fn test_directory_store_defaults_missing_instruments() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySpecificationStore::new(dir.path());

        let specification = store.get_specification("WISH").await.unwrap();

        assert_eq!(specification, Specification::default());
    }

    #[tokio::test]
    async fn test_directory_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySpecificationStore::new(dir.path());

        std::fs::write(store.document_path("loq"), r#"{"enabled": tr"#).unwrap();
        let malformed = store.get_specification("LOQ").await.unwrap_err();
        assert!(matches!(malformed, SpecificationError::Parse { .. }));
        assert!(!malformed.is_retryable());

        std::fs::write(store.document_path("loq"), r#"["enabled"]"#).unwrap();
        let not_an_object = store.get_specification("LOQ").await.unwrap_err();
        assert!(matches!(not_an_object, SpecificationError::Parse { .. }));

        std::fs::write(store.document_path("loq"), r#"{"fooBarRule": true}"#).unwrap();
        let unknown = store.get_specification("LOQ").await.unwrap_err();
        assert!(matches!(
            unknown,
            SpecificationError::Rule(RuleError::UnknownRule(_))
        ));
    }

    #[tokio::test]
    async fn test_api_store() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/instrument/osiris/specification")
                .header("Authorization", "Bearer shh");
            then.status(200)
                .header("Content-Type", "application/json")
                .body(r#"{"enabled": true, "osirisDefaultSpectroscopy": true}"#);
        });
        let store =
            ApiSpecificationStore::new(&server.url("/"), Some("shh".to_owned()), Duration::from_secs(5))
                .unwrap();

        let specification = store.get_specification("OSIRIS").await.unwrap();

        mock.assert();
        assert_eq!(
            specification.rules(),
            &[Rule::Enabled(true), Rule::OsirisDefaultSpectroscopy(true)]
        );
    }

    #[tokio::test]
    async fn test_api_store_not_found_and_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/instrument/wish/specification");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/instrument/loq/specification");
            then.status(503);
        });
        let store = ApiSpecificationStore::new(&server.base_url(), None, Duration::from_secs(5))
            .unwrap();

        let default = store.get_specification("WISH").await.unwrap();
        assert_eq!(default, Specification::default());

        let error = store.get_specification("LOQ").await.unwrap_err();
        assert!(matches!(error, SpecificationError::Unavailable { .. }));
        assert!(error.is_retryable());
    }
}
