use std::convert::TryFrom;
use std::time::Duration;

use serde_json::Value;

use crate::error::ProvisioningError;
use crate::token::DEFAULT_TOKEN_LIFESPAN_SECS;

/// Global device provisioning service endpoint
pub const DPS_HOST: &str = "global.azure-devices-provisioning.net";
/// REST api version spoken to the provisioning service
pub const DPS_API_VERSION: &str = "2018-11-01";
/// Longest SAS token lifespan a configuration accepts
pub const MAX_SAS_TOKEN_LIFESPAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const DEFAULT_RENEWAL_BUFFER_PERCENT: u8 = 15;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_millis(1_000_000);
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WORKER_THREADS: usize = 2;

/// Tunables for a provisioning client
///
/// # Example
/// ```
/// use std::time::Duration;
/// use azure_iot_provisioning::ProvisioningConfig;
///
/// let config = ProvisioningConfig::new("0ne000EEBBD")
///     .with_poll_interval(Duration::from_secs(3))
///     .with_sas_token_lifespan(Duration::from_secs(24 * 60 * 60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Host name of the provisioning service
    pub global_endpoint: String,
    /// Id scope of the provisioning service instance
    pub scope_id: String,
    ///
    pub api_version: String,
    /// Lifespan of SAS tokens used for registration and polling
    pub sas_token_lifespan: Duration,
    /// Share of the token lifespan left at which it is renewed
    pub renewal_buffer_percent: u8,
    /// Delay before each status poll
    pub poll_interval: Duration,
    /// Bound on the whole attestation handshake
    pub registration_timeout: Duration,
    /// Bound on a single status poll, counted after the poll interval
    pub status_timeout: Duration,
    /// Size of the worker pool running network round trips
    pub worker_threads: usize,
    /// JSON sent with the registration for custom allocation policies
    pub custom_payload: Option<Value>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        ProvisioningConfig {
            global_endpoint: DPS_HOST.to_owned(),
            scope_id: String::new(),
            api_version: DPS_API_VERSION.to_owned(),
            sas_token_lifespan: Duration::from_secs(DEFAULT_TOKEN_LIFESPAN_SECS as u64),
            renewal_buffer_percent: DEFAULT_RENEWAL_BUFFER_PERCENT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
            custom_payload: None,
        }
    }
}

impl ProvisioningConfig {
    /// Defaults for the given id scope
    pub fn new<T>(scope_id: T) -> ProvisioningConfig
    where
        T: Into<String>,
    {
        ProvisioningConfig {
            scope_id: scope_id.into(),
            ..Default::default()
        }
    }

    ///
    pub fn with_global_endpoint<T>(mut self, global_endpoint: T) -> Self
    where
        T: Into<String>,
    {
        self.global_endpoint = global_endpoint.into();
        self
    }

    ///
    pub fn with_sas_token_lifespan(mut self, lifespan: Duration) -> Self {
        self.sas_token_lifespan = lifespan;
        self
    }

    ///
    pub fn with_renewal_buffer_percent(mut self, percent: u8) -> Self {
        self.renewal_buffer_percent = percent;
        self
    }

    ///
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    ///
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    ///
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    ///
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    ///
    pub fn with_custom_payload(mut self, payload: Value) -> Self {
        self.custom_payload = Some(payload);
        self
    }

    /// Lifespan in whole seconds as used for token expiry, saturating at `i64::MAX`
    pub fn sas_token_lifespan_secs(&self) -> i64 {
        i64::try_from(self.sas_token_lifespan.as_secs()).unwrap_or(i64::MAX)
    }

    /// Resource uri a registration SAS token is scoped to
    pub fn registration_resource_uri(&self, registration_id: &str) -> String {
        format!("{}/registrations/{}", self.scope_id, registration_id)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> crate::Result<()> {
        if self.scope_id.is_empty() {
            return Err(ProvisioningError::Client(
                "scope id cannot be empty".to_owned(),
            ));
        }
        if self.global_endpoint.is_empty() {
            return Err(ProvisioningError::Client(
                "global endpoint cannot be empty".to_owned(),
            ));
        }
        if self.sas_token_lifespan.as_secs() == 0 {
            return Err(ProvisioningError::Client(
                "sas token lifespan must be at least one second".to_owned(),
            ));
        }
        if self.sas_token_lifespan > MAX_SAS_TOKEN_LIFESPAN {
            return Err(ProvisioningError::Client(format!(
                "sas token lifespan of {}s exceeds the maximum of {}s",
                self.sas_token_lifespan.as_secs(),
                MAX_SAS_TOKEN_LIFESPAN.as_secs()
            )));
        }
        if self.renewal_buffer_percent >= 100 {
            return Err(ProvisioningError::Client(format!(
                "renewal buffer of {}% leaves no usable token lifetime",
                self.renewal_buffer_percent
            )));
        }
        if self.worker_threads == 0 {
            return Err(ProvisioningError::Client(
                "worker pool needs at least one thread".to_owned(),
            ));
        }
        Ok(())
    }
}
