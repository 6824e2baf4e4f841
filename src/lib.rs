//! Azure IoT device provisioning client for registering devices with the Device
//! Provisioning Service
//!
//! The client attests a device with one of three schemes, waits for the service to
//! assign it to an IoT hub and reports the hub and device id it should connect to.
//!
//! - X.509 certificates, presented during the TLS handshake
//! - TPM, answering the service's nonce challenge through a [`SecureKeyStore`]
//! - Symmetric keys, signing [`SasToken`]s with the device or a derived group key
//!
//! ## Feature flags
//!
//! SDK client uses [feature
//! flags](https://doc.rust-lang.org/cargo/reference/features.html#the-features-section) to
//! configure capabilities of the client sdk. By default all features are enabled.
//!
//! - `http-transport`: Enables [`HttpTransport`], provisioning over HTTPS
//!
//! ### Bringing your own transport
//! Any type implementing [`ProvisioningTransport`] can carry the requests.
//!
//! ```toml
//! azure_iot_provisioning = { version = "0.1.0", default-features = false }
//! ```
//!
//! # Examples
//!
//! Register a device in a group enrollment
//! ```no_run
//! use std::sync::Arc;
//! use azure_iot_provisioning::{
//!     AttestationMaterial, DeviceIdentity, HttpTransport, ProvisioningConfig,
//!     ProvisioningDeviceClient, ProvisioningState, SymmetricKeyMaterial,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = SymmetricKeyMaterial::from_group_key("TheGroupKey", "MyDeviceId")?;
//!     let identity = DeviceIdentity::new("MyDeviceId", AttestationMaterial::SymmetricKey(key));
//!     let transport = Arc::new(HttpTransport::new(&ProvisioningConfig::new("0ne000EEBBD"))?);
//!
//!     let client = ProvisioningDeviceClient::builder()
//!         .device("0ne000EEBBD", identity)
//!         .transport(transport)
//!         .status_callback(|state, reason| println!("{} {:?}", state, reason))
//!         .build()?;
//!     client.set_registration_callback(|info| {
//!         println!("Connect to {} as {}", info.assigned_hub, info.device_id)
//!     });
//!
//!     if client.run() == ProvisioningState::Assigned {
//!         println!("Provisioned");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// IoT SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// The provisioning client
pub mod client;
mod client_builder;
/// Client configuration
pub mod config;
/// Errors
pub mod error;
#[cfg(feature = "http-transport")]
mod http_transport;
/// Registration request and response bodies
pub mod parser;
/// Attestation handshake
pub mod register;
/// Attestation material and key stores
pub mod security;
/// Registration status polling
pub mod status;
/// SAS token minting and caching
pub mod token;
/// Transport types
pub mod transport;

pub use crate::client::{
    ProvisioningDeviceClient, ProvisioningState, RegistrationCallback, RegistrationInfo,
    StatusCallback,
};
pub use crate::client_builder::{
    InitializedDevice, InitializedTransport, ProvisioningDeviceClientBuilder,
    ProvisioningDeviceClientBuilderError, UninitializedDevice,
};
pub use crate::config::{ProvisioningConfig, MAX_SAS_TOKEN_LIFESPAN};
pub use crate::error::{ProvisioningError, TokenError};
#[cfg(feature = "http-transport")]
pub use crate::http_transport::HttpTransport;
pub use crate::parser::{RegistrationResponse, RegistrationStatus};
pub use crate::register::{Authenticator, Authorization, OperationId, Registration};
pub use crate::security::{
    AttestationMaterial, CertificateMaterial, DeviceIdentity, SecureKeyStore, SoftwareKeyStore,
    SymmetricKeyMaterial, TpmMaterial,
};
pub use crate::status::StatusPoller;
pub use crate::token::{DeviceKeySigner, SasToken, TokenCache, TokenSigner};
pub use crate::transport::{ProvisioningTransport, RequestData, ResponseSender, SecurityContext};

/// Result of provisioning operations
pub type Result<T> = std::result::Result<T, ProvisioningError>;
