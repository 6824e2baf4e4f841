use std::fmt;
use std::sync::Arc;

use crate::error::ProvisioningError;
use crate::parser::{parse_registration_response, RegistrationResponse};
use crate::register::{Authorization, OperationId};
use crate::transport::{response_channel, ProvisioningTransport, RequestData};

/// Performs a single status round trip for an accepted registration
///
/// Cadence and retries are the caller's business, `poll` never loops.
pub struct StatusPoller {
    registration_id: String,
    transport: Arc<dyn ProvisioningTransport>,
    authorization: Authorization,
}

impl fmt::Debug for StatusPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPoller")
            .field("registration_id", &self.registration_id)
            .field("authorization", &self.authorization)
            .finish()
    }
}

impl StatusPoller {
    ///
    pub fn new<T>(
        registration_id: T,
        transport: Arc<dyn ProvisioningTransport>,
        authorization: Authorization,
    ) -> StatusPoller
    where
        T: Into<String>,
    {
        StatusPoller {
            registration_id: registration_id.into(),
            transport,
            authorization,
        }
    }

    /// Ask the service for the current state of `operation_id`
    pub async fn poll(&self, operation_id: &OperationId) -> crate::Result<RegistrationResponse> {
        let request = RequestData {
            registration_id: self.registration_id.clone(),
            payload: Vec::new(),
            operation_id: Some(operation_id.as_str().to_owned()),
            authorization: self.authorization.header()?,
            security_context: self.authorization.security_context(),
        };

        debug!("Polling registration status of operation {}", operation_id);

        let (reply, response) = response_channel();
        self.transport.poll_status(request, reply).await?;

        let body = response.await.map_err(|_| {
            ProvisioningError::Client(format!(
                "status response for operation {} could not be retrieved",
                operation_id
            ))
        })?;
        trace!("Status response {}", String::from_utf8_lossy(&body));

        parse_registration_response(&body)
    }
}
