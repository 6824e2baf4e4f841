use std::fmt;
use std::sync::Arc;

use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::parser::{
    parse_registration_response, parse_tpm_nonce_response, registration_payload,
    RegistrationResponse,
};
use crate::security::{
    AttestationMaterial, CertificateMaterial, DeviceIdentity, KeyStoreSigner, TpmMaterial,
};
use crate::token::{DeviceKeySigner, TokenCache, TokenSigner};
use crate::transport::{response_channel, ProvisioningTransport, RequestData, SecurityContext};

/// Credentials established by a handshake and reused for status polls
#[derive(Debug, Clone)]
pub enum Authorization {
    /// Requests go over the device certificate channel without a header
    Certificate(Arc<CertificateMaterial>),
    /// Requests carry a SAS token renewed by the cache
    SasToken(Arc<TokenCache>),
}

impl Authorization {
    pub(crate) fn security_context(&self) -> SecurityContext {
        match self {
            Authorization::Certificate(certificate) => {
                SecurityContext::ClientCertificate(Arc::clone(certificate))
            }
            Authorization::SasToken(_) => SecurityContext::ServerAuthentication,
        }
    }

    /// The Authorization header value, renewing the token if needed
    pub(crate) fn header(&self) -> crate::Result<Option<String>> {
        match self {
            Authorization::Certificate(_) => Ok(None),
            Authorization::SasToken(tokens) => Ok(Some(tokens.get_token()?.to_string())),
        }
    }
}

/// Handle of an in progress registration
///
/// Only a completed handshake hands these out, so a status poll always refers to
/// an operation the service accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationId(String);

impl OperationId {
    pub(crate) fn new<T>(id: T) -> OperationId
    where
        T: Into<String>,
    {
        OperationId(id.into())
    }

    ///
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a completed attestation handshake
#[derive(Debug, Clone)]
pub struct Registration {
    /// The service's reply to the authenticated registration request
    pub response: RegistrationResponse,
    /// Credentials for following up on this registration
    pub authorization: Authorization,
}

impl Registration {
    /// The operation to poll, if the service returned one
    pub fn operation_id(&self) -> Option<OperationId> {
        self.response
            .operation_id
            .as_ref()
            .filter(|id| !id.is_empty())
            .map(OperationId::new)
    }
}

/// Runs the scheme specific attestation handshake with the provisioning service
///
/// Waiting on a reply has no timeout of its own; the caller bounds the whole
/// handshake.
pub struct Authenticator {
    config: Arc<ProvisioningConfig>,
    identity: Arc<DeviceIdentity>,
    transport: Arc<dyn ProvisioningTransport>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("scope_id", &self.config.scope_id)
            .field("identity", &self.identity)
            .finish()
    }
}

impl Authenticator {
    ///
    pub fn new(
        config: Arc<ProvisioningConfig>,
        identity: Arc<DeviceIdentity>,
        transport: Arc<dyn ProvisioningTransport>,
    ) -> Authenticator {
        Authenticator {
            config,
            identity,
            transport,
        }
    }

    /// Attest the device and return the service's registration reply
    pub async fn authenticate(&self) -> crate::Result<Registration> {
        let registration_id = self.identity.registration_id();
        if registration_id.is_empty() {
            return Err(ProvisioningError::Client(
                "registration id cannot be empty".to_owned(),
            ));
        }

        debug!(
            "Authenticating {} with {} attestation",
            registration_id,
            self.identity.attestation().scheme()
        );

        match self.identity.attestation() {
            AttestationMaterial::Certificate(certificate) => {
                self.authenticate_with_x509(Arc::new(certificate.clone()))
                    .await
            }
            AttestationMaterial::Tpm(tpm) => self.authenticate_with_tpm(tpm).await,
            AttestationMaterial::SymmetricKey(keys) => {
                let signer = DeviceKeySigner::new(keys.primary_key())?;
                let payload = self.payload(None)?;
                self.transport
                    .open(registration_id, &SecurityContext::ServerAuthentication)
                    .await?;
                self.authenticate_with_sas(self.token_cache(Arc::new(signer)), payload)
                    .await
            }
        }
    }

    async fn authenticate_with_x509(
        &self,
        certificate: Arc<CertificateMaterial>,
    ) -> crate::Result<Registration> {
        let security_context = SecurityContext::ClientCertificate(Arc::clone(&certificate));
        self.transport
            .open(self.identity.registration_id(), &security_context)
            .await?;

        let request = self.request(self.payload(None)?, None, security_context);
        let (reply, response) = response_channel();
        self.transport.send_registration(request, reply).await?;

        let body = response.await.map_err(|_| {
            ProvisioningError::Authentication("did not receive a registration response".to_owned())
        })?;
        trace!("Registration response {}", String::from_utf8_lossy(&body));

        Ok(Registration {
            response: parse_authentication_reply(&body)?,
            authorization: Authorization::Certificate(certificate),
        })
    }

    async fn authenticate_with_tpm(&self, tpm: &TpmMaterial) -> crate::Result<Registration> {
        let key_store = tpm.key_store();
        let endorsement_key = key_store.endorsement_key()?;
        let storage_root_key = key_store.storage_root_key()?;
        if endorsement_key.is_empty() || storage_root_key.is_empty() {
            return Err(ProvisioningError::Security(
                "endorsement key and storage root key cannot be empty".to_owned(),
            ));
        }

        let tpm_keys = (endorsement_key.as_slice(), storage_root_key.as_slice());
        let payload = self.payload(Some(tpm_keys))?;
        self.transport
            .open(
                self.identity.registration_id(),
                &SecurityContext::ServerAuthentication,
            )
            .await?;

        let request = self.request(payload.clone(), None, SecurityContext::ServerAuthentication);
        let (reply, response) = response_channel();
        self.transport.request_nonce(request, reply).await?;

        let body = response.await.map_err(|_| {
            ProvisioningError::HubRejected("service did not send an authentication key".to_owned())
        })?;
        let authentication_key = base64::decode(parse_tpm_nonce_response(&body)?).map_err(|e| {
            ProvisioningError::HubRejected(format!("authentication key is not base64: {}", e))
        })?;

        debug!("Importing authentication key into the key store");
        key_store.import_authentication_key(&authentication_key)?;

        let signer = KeyStoreSigner(Arc::clone(key_store));
        self.authenticate_with_sas(self.token_cache(Arc::new(signer)), payload)
            .await
    }

    async fn authenticate_with_sas(
        &self,
        tokens: Arc<TokenCache>,
        payload: Vec<u8>,
    ) -> crate::Result<Registration> {
        let token = tokens.get_token()?;
        let request = self.request(
            payload,
            Some(token.to_string()),
            SecurityContext::ServerAuthentication,
        );

        let (reply, response) = response_channel();
        self.transport.send_registration(request, reply).await?;

        let body = response.await.map_err(|_| {
            ProvisioningError::HubRejected("service did not authorize the SAS token".to_owned())
        })?;
        trace!("Registration response {}", String::from_utf8_lossy(&body));

        Ok(Registration {
            response: parse_authentication_reply(&body)?,
            authorization: Authorization::SasToken(tokens),
        })
    }

    fn token_cache(&self, signer: Arc<dyn TokenSigner>) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(
            self.config
                .registration_resource_uri(self.identity.registration_id()),
            String::new(),
            signer,
            self.config.sas_token_lifespan_secs(),
            self.config.renewal_buffer_percent,
        ))
    }

    fn payload(&self, tpm_keys: Option<(&[u8], &[u8])>) -> crate::Result<Vec<u8>> {
        registration_payload(
            self.identity.registration_id(),
            tpm_keys,
            self.config.custom_payload.as_ref(),
        )
    }

    fn request(
        &self,
        payload: Vec<u8>,
        authorization: Option<String>,
        security_context: SecurityContext,
    ) -> RequestData {
        RequestData {
            registration_id: self.identity.registration_id().to_owned(),
            payload,
            operation_id: None,
            authorization,
            security_context,
        }
    }
}

fn parse_authentication_reply(body: &[u8]) -> crate::Result<RegistrationResponse> {
    parse_registration_response(body).map_err(|e| match e {
        ProvisioningError::Client(msg) => ProvisioningError::Authentication(msg),
        other => other,
    })
}
