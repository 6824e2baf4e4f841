use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::security::CertificateMaterial;

/// Credentials for the secure channel to the provisioning service
#[derive(Debug, Clone)]
pub enum SecurityContext {
    /// Mutual TLS with the device certificate
    ClientCertificate(Arc<CertificateMaterial>),
    /// Server authenticated TLS, the request carries a SAS Authorization header
    ServerAuthentication,
}

/// Everything a transport needs to issue one request
#[derive(Debug, Clone)]
pub struct RequestData {
    /// The device registration id
    pub registration_id: String,
    /// JSON body of a registration request, empty for status polls
    pub payload: Vec<u8>,
    /// Operation being polled
    pub operation_id: Option<String>,
    /// Value for the Authorization header
    pub authorization: Option<String>,
    ///
    pub security_context: SecurityContext,
}

/// One-shot delivery of a raw response body
///
/// Consuming `deliver` guarantees a reply is delivered at most once. Dropping the
/// sender without delivering tells the waiting side that no reply will arrive.
#[derive(Debug)]
pub struct ResponseSender(oneshot::Sender<Vec<u8>>);

impl ResponseSender {
    /// Hand the raw response bytes to whoever is waiting on this request
    pub fn deliver(self, body: Vec<u8>) {
        if self.0.send(body).is_err() {
            debug!("Response arrived after the waiting task went away");
        }
    }
}

pub(crate) type ResponseReceiver = oneshot::Receiver<Vec<u8>>;

pub(crate) fn response_channel() -> (ResponseSender, ResponseReceiver) {
    let (tx, rx) = oneshot::channel();
    (ResponseSender(tx), rx)
}

/// Wire protocol used to reach the provisioning service
///
/// Each request method hands its reply to `reply` once the service answers. A
/// method may return before the reply arrives; callers wait on the signal, not on
/// the method's return.
#[async_trait]
pub trait ProvisioningTransport: Send + Sync {
    /// Prepare the channel for a registration, called before every handshake
    async fn open(
        &self,
        _registration_id: &str,
        _security_context: &SecurityContext,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Send a registration request
    async fn send_registration(&self, request: RequestData, reply: ResponseSender)
        -> crate::Result<()>;

    /// Send a TPM registration expecting a nonce challenge carrying the authentication key
    async fn request_nonce(&self, request: RequestData, reply: ResponseSender)
        -> crate::Result<()>;

    /// Query the status of a registration operation
    async fn poll_status(&self, request: RequestData, reply: ResponseSender) -> crate::Result<()>;
}
