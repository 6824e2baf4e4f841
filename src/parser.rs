use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisioningError;

/// Registration status reported by the provisioning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    ///
    Unassigned,
    ///
    Assigning,
    ///
    Assigned,
    ///
    Failed,
    ///
    Blacklisted,
    ///
    Disabled,
}

impl RegistrationStatus {
    /// The service will never assign the device
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            RegistrationStatus::Failed
                | RegistrationStatus::Blacklisted
                | RegistrationStatus::Disabled
        )
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            RegistrationStatus::Unassigned => "unassigned",
            RegistrationStatus::Assigning => "assigning",
            RegistrationStatus::Assigned => "assigned",
            RegistrationStatus::Failed => "failed",
            RegistrationStatus::Blacklisted => "blacklisted",
            RegistrationStatus::Disabled => "disabled",
        };
        f.write_str(status)
    }
}

/// A parsed registration or operation status reply
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResponse {
    /// Handle for polling an in progress registration
    pub operation_id: Option<String>,
    ///
    pub status: RegistrationStatus,
    /// Host name of the hub the device was assigned to
    pub assigned_hub: Option<String>,
    /// Device id on the assigned hub
    pub device_id: Option<String>,
    /// Error message from the service when the registration failed
    pub error_message: Option<String>,
    /// Custom payload returned by the allocation policy
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperationStatus {
    operation_id: Option<String>,
    status: RegistrationStatus,
    registration_state: Option<DeviceRegistrationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRegistrationResult {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    error_code: Option<Value>,
    error_message: Option<String>,
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceError {
    error_code: Option<Value>,
    message: Option<String>,
    tracking_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TpmRegistrationResult {
    authentication_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRegistration<'a> {
    registration_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tpm: Option<TpmAttestation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TpmAttestation {
    endorsement_key: String,
    storage_root_key: String,
}

/// Body of a registration request
///
/// TPM registrations carry the base64 endorsement and storage root keys.
pub fn registration_payload(
    registration_id: &str,
    tpm_keys: Option<(&[u8], &[u8])>,
    custom_payload: Option<&Value>,
) -> crate::Result<Vec<u8>> {
    let body = DeviceRegistration {
        registration_id,
        tpm: tpm_keys.map(|(ek, srk)| TpmAttestation {
            endorsement_key: base64::encode(ek),
            storage_root_key: base64::encode(srk),
        }),
        payload: custom_payload,
    };

    serde_json::to_vec(&body).map_err(|e| ProvisioningError::Client(e.to_string()))
}

/// Parse a registration or operation status reply
///
/// Bodies that are not a status are read as a service error and become
/// [`ProvisioningError::HubRejected`].
pub fn parse_registration_response(raw: &[u8]) -> crate::Result<RegistrationResponse> {
    if raw.is_empty() {
        return Err(ProvisioningError::Client(
            "registration response body is empty".to_owned(),
        ));
    }

    match serde_json::from_slice::<RegistrationOperationStatus>(raw) {
        Ok(reply) => {
            let state = reply.registration_state;
            let (assigned_hub, device_id, error_message, payload) = match state {
                Some(state) => {
                    let error_message = match (state.error_message, state.error_code) {
                        (Some(msg), Some(code)) => Some(format!("{} (error code {})", msg, code)),
                        (msg, _) => msg,
                    };
                    (state.assigned_hub, state.device_id, error_message, state.payload)
                }
                None => (None, None, None, None),
            };

            Ok(RegistrationResponse {
                operation_id: reply.operation_id,
                status: reply.status,
                assigned_hub,
                device_id,
                error_message,
                payload,
            })
        }
        Err(parse_err) => Err(parse_service_error(raw).unwrap_or_else(|| {
            ProvisioningError::Client(format!(
                "could not parse registration response: {}",
                parse_err
            ))
        })),
    }
}

fn parse_service_error(raw: &[u8]) -> Option<ProvisioningError> {
    let error = serde_json::from_slice::<ServiceError>(raw).ok()?;
    let message = error.message?;

    let mut description = message;
    if let Some(code) = error.error_code {
        description = format!("{} (error code {})", description, code);
    }
    if let Some(tracking_id) = error.tracking_id {
        description = format!("{}, tracking id {}", description, tracking_id);
    }

    Some(ProvisioningError::HubRejected(description))
}

/// Extract the base64 authentication key from a TPM nonce reply
pub fn parse_tpm_nonce_response(raw: &[u8]) -> crate::Result<String> {
    let missing =
        || ProvisioningError::HubRejected("service did not send an authentication key".to_owned());

    let reply = serde_json::from_slice::<TpmRegistrationResult>(raw).map_err(|_| missing())?;
    match reply.authentication_key {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(missing()),
    }
}
