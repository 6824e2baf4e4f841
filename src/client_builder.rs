use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::{
    DeviceIdentity, ProvisioningConfig, ProvisioningDeviceClient, ProvisioningState,
    ProvisioningTransport, StatusCallback,
};

impl ProvisioningDeviceClient {
    /// Get a builder for the provisioning client
    pub fn builder() -> ProvisioningDeviceClientBuilder<UninitializedDevice> {
        ProvisioningDeviceClientBuilder::default()
    }
}

/// Error related to building the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisioningDeviceClientBuilderError {
    /// Uninitialized field
    #[error("{0} must be initialized")]
    UninitializedField(&'static str),
    /// Custom validation error
    #[error("{0} failed to validate")]
    ValidationError(&'static str),
    /// Error initializing the provisioning client
    #[error("An error occurred intializing the provisioning client {0}")]
    ClientError(String),
}

/// The client builder has no initialized fields and requires the scope and device identity
#[derive(Debug)]
pub struct UninitializedDevice;
/// The client builder has device details and requires a transport
#[derive(Debug)]
pub struct InitializedDevice;
/// The client builder has all fields required to be built
#[derive(Debug)]
pub struct InitializedTransport;

/// Builder object for the provisioning client
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use azure_iot_provisioning::{
///     AttestationMaterial, DeviceIdentity, HttpTransport, ProvisioningConfig,
///     ProvisioningDeviceClient, SymmetricKeyMaterial,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let identity = DeviceIdentity::new(
///     "FirstDevice",
///     AttestationMaterial::SymmetricKey(SymmetricKeyMaterial::new("TheDeviceKey", None)),
/// );
/// let transport = Arc::new(HttpTransport::new(&ProvisioningConfig::new("0ne000EEBBD"))?);
///
/// let client = ProvisioningDeviceClient::builder()
///     .device("0ne000EEBBD", identity)
///     .transport(transport)
///     .status_callback(|state, _| println!("{}", state))
///     .build()?;
/// client.run();
/// # Ok(())
/// # }
/// ```
pub struct ProvisioningDeviceClientBuilder<T> {
    config: Option<ProvisioningConfig>,
    identity: Option<DeviceIdentity>,
    transport: Option<Arc<dyn ProvisioningTransport>>,
    status_callback: Option<StatusCallback>,
    _phantom: PhantomData<T>,
}

impl<T> std::fmt::Debug for ProvisioningDeviceClientBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningDeviceClientBuilder")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("has_transport", &self.transport.is_some())
            .field("has_status_callback", &self.status_callback.is_some())
            .finish()
    }
}

impl Default for ProvisioningDeviceClientBuilder<UninitializedDevice> {
    fn default() -> ProvisioningDeviceClientBuilder<UninitializedDevice> {
        Self {
            config: None,
            identity: None,
            transport: None,
            status_callback: None,
            _phantom: Default::default(),
        }
    }
}

impl<T> ProvisioningDeviceClientBuilder<T> {
    fn into_state<U>(self) -> ProvisioningDeviceClientBuilder<U> {
        ProvisioningDeviceClientBuilder {
            config: self.config,
            identity: self.identity,
            transport: self.transport,
            status_callback: self.status_callback,
            _phantom: Default::default(),
        }
    }

    /// Set the callback invoked on every state transition
    pub fn status_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProvisioningState, Option<String>) + Send + Sync + 'static,
    {
        self.status_callback = Some(Box::new(callback));
        self
    }
}

impl ProvisioningDeviceClientBuilder<UninitializedDevice> {
    /// Set the id scope of the provisioning service and the device to register
    pub fn device<S>(
        self,
        scope_id: S,
        identity: DeviceIdentity,
    ) -> ProvisioningDeviceClientBuilder<InitializedDevice>
    where
        S: Into<String>,
    {
        let mut builder = self.into_state::<InitializedDevice>();
        builder.config = Some(ProvisioningConfig::new(scope_id));
        builder.identity = Some(identity);
        builder
    }
}

impl ProvisioningDeviceClientBuilder<InitializedDevice> {
    /// Replace the default configuration, keeping the id scope already set when
    /// `config` leaves it empty
    pub fn config(mut self, mut config: ProvisioningConfig) -> Self {
        if config.scope_id.is_empty() {
            if let Some(current) = self.config.take() {
                config.scope_id = current.scope_id;
            }
        }
        self.config = Some(config);
        self
    }

    /// Set the transport used to reach the provisioning service
    pub fn transport(
        self,
        transport: Arc<dyn ProvisioningTransport>,
    ) -> ProvisioningDeviceClientBuilder<InitializedTransport> {
        let mut builder = self.into_state::<InitializedTransport>();
        builder.transport = Some(transport);
        builder
    }
}

impl ProvisioningDeviceClientBuilder<InitializedTransport> {
    /// Build the provisioning client
    pub fn build(self) -> Result<ProvisioningDeviceClient, ProvisioningDeviceClientBuilderError> {
        let Some(config) = self.config else {
            return Err(ProvisioningDeviceClientBuilderError::UninitializedField(
                "scope_id",
            ));
        };

        let Some(identity) = self.identity else {
            return Err(ProvisioningDeviceClientBuilderError::UninitializedField(
                "identity",
            ));
        };

        let Some(transport) = self.transport else {
            return Err(ProvisioningDeviceClientBuilderError::UninitializedField(
                "transport",
            ));
        };

        let Some(status_callback) = self.status_callback else {
            return Err(ProvisioningDeviceClientBuilderError::ValidationError(
                "status_callback",
            ));
        };

        let client = ProvisioningDeviceClient::new(config, identity, transport, status_callback)
            .map_err(|e| ProvisioningDeviceClientBuilderError::ClientError(format!("{e}")))?;

        Ok(client)
    }
}
