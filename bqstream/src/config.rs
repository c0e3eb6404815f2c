//! Configuration for the change capture pipeline.
//!
//! Configuration is an explicit value passed to the constructors of the
//! extractor, dispatcher, and archiver rather than process-global state, so
//! several differently-configured pipelines can coexist in one process and
//! tests can build throwaway configurations freely.

use crate::errors::{ConfigError, ConfigResult};
use crate::types::{BatchSize, Timestamp};
use chrono_tz::Tz;

/// The default name of the warehouse output table.
pub const DEFAULT_OUTPUT_TABLE: &str = "bq_datastream";

/// The deploy revision used when none is configured.
pub const DEFAULT_DEPLOY_REVISION: &str = "none";

/// Credentials for the warehouse client.
///
/// These are opaque to the library; they are carried to whatever
/// [`WarehouseClient`](crate::warehouse::WarehouseClient) implementation the
/// host wires in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseCredentials {
    /// OAuth client id
    pub client_id: String,
    /// Service account email
    pub service_email: String,
    /// Private key material (PEM or key-file path, client-defined)
    pub key: String,
    /// Cloud project id
    pub project_id: String,
}

impl WarehouseCredentials {
    /// Creates a new credential set.
    pub fn new(
        client_id: impl Into<String>,
        service_email: impl Into<String>,
        key: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            service_email: service_email.into(),
            key: key.into(),
            project_id: project_id.into(),
        }
    }
}

/// Validated configuration for one change capture pipeline.
///
/// Build with [`StreamConfig::builder`]; the builder rejects malformed
/// values at construction time so the running pipeline never revalidates.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Warehouse credentials
    pub credentials: WarehouseCredentials,
    /// Warehouse dataset receiving the change stream
    pub dataset: String,
    /// Output table inside the dataset
    pub output_table_name: String,
    /// Earliest point backfill will reach. `None` disables backfill.
    pub backfill_cutoff: Option<Timestamp>,
    /// Rows drained per dispatch tick
    pub batch_size: BatchSize,
    /// Timezone that temporal attribute values are rendered in
    pub timezone: Tz,
    /// The current deploy revision, compared against the cursor store's
    /// revision sentinel to gate cursor reconciliation
    pub deploy_revision: String,
}

impl StreamConfig {
    /// Starts building a configuration for the given credentials and dataset.
    pub fn builder(
        credentials: WarehouseCredentials,
        dataset: impl Into<String>,
    ) -> StreamConfigBuilder {
        StreamConfigBuilder {
            credentials,
            dataset: dataset.into(),
            output_table_name: DEFAULT_OUTPUT_TABLE.to_string(),
            backfill_cutoff: None,
            batch_size: BatchSize::default_size(),
            timezone: Tz::UTC,
            deploy_revision: DEFAULT_DEPLOY_REVISION.to_string(),
        }
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct StreamConfigBuilder {
    credentials: WarehouseCredentials,
    dataset: String,
    output_table_name: String,
    backfill_cutoff: Option<Timestamp>,
    batch_size: BatchSize,
    timezone: Tz,
    deploy_revision: String,
}

impl StreamConfigBuilder {
    /// Overrides the output table name (default `"bq_datastream"`).
    #[must_use]
    pub fn output_table_name(mut self, name: impl Into<String>) -> Self {
        self.output_table_name = name.into();
        self
    }

    /// Enables backfill down to the given cutoff.
    #[must_use]
    pub fn backfill_cutoff(mut self, cutoff: Timestamp) -> Self {
        self.backfill_cutoff = Some(cutoff);
        self
    }

    /// Sets the dispatch batch size (default 1000, ceiling 10,000).
    pub fn batch_size(mut self, size: usize) -> ConfigResult<Self> {
        self.batch_size =
            BatchSize::try_new(size).map_err(|_| ConfigError::InvalidBatchSize(size))?;
        Ok(self)
    }

    /// Sets the timezone temporal values are rendered in (default UTC).
    ///
    /// Accepts IANA names such as `"America/New_York"`.
    pub fn timezone(mut self, name: &str) -> ConfigResult<Self> {
        self.timezone = name
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))?;
        Ok(self)
    }

    /// Sets the deploy revision used to gate cursor reconciliation.
    #[must_use]
    pub fn deploy_revision(mut self, revision: impl Into<String>) -> Self {
        self.deploy_revision = revision.into();
        self
    }

    /// Validates and produces the configuration.
    pub fn build(self) -> ConfigResult<StreamConfig> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Missing("dataset"));
        }
        if self.output_table_name.trim().is_empty() {
            return Err(ConfigError::Missing("output_table_name"));
        }

        Ok(StreamConfig {
            credentials: self.credentials,
            dataset: self.dataset,
            output_table_name: self.output_table_name,
            backfill_cutoff: self.backfill_cutoff,
            batch_size: self.batch_size,
            timezone: self.timezone,
            deploy_revision: self.deploy_revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> WarehouseCredentials {
        WarehouseCredentials::new("client", "svc@example.com", "key", "project")
    }

    #[test]
    fn builder_applies_defaults() {
        let config = StreamConfig::builder(credentials(), "analytics")
            .build()
            .unwrap();

        assert_eq!(config.dataset, "analytics");
        assert_eq!(config.output_table_name, DEFAULT_OUTPUT_TABLE);
        assert_eq!(config.backfill_cutoff, None);
        assert_eq!(config.batch_size, BatchSize::default_size());
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.deploy_revision, DEFAULT_DEPLOY_REVISION);
    }

    #[test]
    fn builder_accepts_overrides() {
        let cutoff = Timestamp::now();
        let config = StreamConfig::builder(credentials(), "analytics")
            .output_table_name("events_stream")
            .backfill_cutoff(cutoff)
            .batch_size(250)
            .unwrap()
            .timezone("America/New_York")
            .unwrap()
            .deploy_revision("abc123")
            .build()
            .unwrap();

        assert_eq!(config.output_table_name, "events_stream");
        assert_eq!(config.backfill_cutoff, Some(cutoff));
        let size: usize = config.batch_size.into();
        assert_eq!(size, 250);
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.deploy_revision, "abc123");
    }

    #[test]
    fn builder_rejects_unknown_timezone() {
        let err = StreamConfig::builder(credentials(), "analytics")
            .timezone("Mars/Olympus")
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownTimezone("Mars/Olympus".to_string()));
    }

    #[test]
    fn builder_rejects_batch_size_outside_range() {
        let err = StreamConfig::builder(credentials(), "analytics")
            .batch_size(0)
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidBatchSize(0));

        let err = StreamConfig::builder(credentials(), "analytics")
            .batch_size(20_000)
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidBatchSize(20_000));
    }

    #[test]
    fn builder_rejects_empty_dataset() {
        let err = StreamConfig::builder(credentials(), "  ").build().unwrap_err();
        assert_eq!(err, ConfigError::Missing("dataset"));
    }
}
