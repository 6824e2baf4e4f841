use std::sync::Mutex;

use async_trait::async_trait;
use hyper::{client::HttpConnector, header, Body, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use native_tls::{Identity, TlsConnector};

use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::token::url_encode;
use crate::transport::{ProvisioningTransport, RequestData, ResponseSender, SecurityContext};

type HttpsClient = Client<HttpsConnector<HttpConnector>>;

/// Provisioning over the service's HTTPS REST interface
///
/// Registrations are `PUT` to `/{scope}/registrations/{id}/register` and status is
/// read from `/{scope}/registrations/{id}/operations/{operation}`. Certificate
/// attestation presents the device certificate during the TLS handshake, every
/// other scheme sends a SAS token in the Authorization header.
pub struct HttpTransport {
    endpoint: String,
    scope_id: String,
    api_query: String,
    client: HttpsClient,
    certificate_client: Mutex<Option<HttpsClient>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("scope_id", &self.scope_id)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport for the endpoint and id scope in `config`
    pub fn new(config: &ProvisioningConfig) -> crate::Result<HttpTransport> {
        let api_query = serde_urlencoded::to_string(&[("api-version", &config.api_version)])
            .map_err(|e| ProvisioningError::Client(e.to_string()))?;

        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, hyper::Body>(https);

        Ok(HttpTransport {
            endpoint: config.global_endpoint.clone(),
            scope_id: config.scope_id.clone(),
            api_query,
            client,
            certificate_client: Mutex::new(None),
        })
    }

    fn register_uri(&self, registration_id: &str) -> String {
        format!(
            "https://{}/{}/registrations/{}/register?{}",
            self.endpoint,
            url_encode(&self.scope_id),
            url_encode(registration_id),
            self.api_query
        )
    }

    fn operation_uri(&self, registration_id: &str, operation_id: &str) -> String {
        format!(
            "https://{}/{}/registrations/{}/operations/{}?{}",
            self.endpoint,
            url_encode(&self.scope_id),
            url_encode(registration_id),
            url_encode(operation_id),
            self.api_query
        )
    }

    fn client_for(&self, security_context: &SecurityContext) -> crate::Result<HttpsClient> {
        match security_context {
            SecurityContext::ServerAuthentication => Ok(self.client.clone()),
            SecurityContext::ClientCertificate(_) => self
                .certificate_client
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
                .ok_or_else(|| {
                    ProvisioningError::Security(
                        "certificate channel used before it was opened".to_owned(),
                    )
                }),
        }
    }

    async fn exchange(
        &self,
        method: Method,
        uri: String,
        request: RequestData,
    ) -> crate::Result<(StatusCode, Vec<u8>)> {
        let client = self.client_for(&request.security_context)?;

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(
                header::USER_AGENT,
                format!("azure-iot-provisioning-rs/{}", crate::SDK_VERSION),
            );
        if let Some(authorization) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        let req = builder
            .body(Body::from(request.payload))
            .map_err(|e| ProvisioningError::Client(e.to_string()))?;

        debug!("Sending request to {}", uri);
        let res = client
            .request(req)
            .await
            .map_err(|e| ProvisioningError::Transport(e.to_string()))?;

        let status = res.status();
        debug!("Response: {}", status);

        let body = hyper::body::to_bytes(res.into_body())
            .await
            .map_err(|e| ProvisioningError::Transport(e.to_string()))?;

        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl ProvisioningTransport for HttpTransport {
    async fn open(
        &self,
        registration_id: &str,
        security_context: &SecurityContext,
    ) -> crate::Result<()> {
        if let SecurityContext::ClientCertificate(certificate) = security_context {
            debug!("Opening certificate channel for {}", registration_id);

            let identity =
                Identity::from_pkcs8(certificate.certificate_pem(), certificate.private_key_pem())
                    .map_err(|e| ProvisioningError::Security(e.to_string()))?;
            let tls = TlsConnector::builder()
                .identity(identity)
                .build()
                .map_err(|e| ProvisioningError::Security(e.to_string()))?;

            let mut http = HttpConnector::new();
            http.enforce_http(false);
            let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

            *self
                .certificate_client
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some(Client::builder().build::<_, hyper::Body>(https));
        }
        Ok(())
    }

    async fn send_registration(
        &self,
        request: RequestData,
        reply: ResponseSender,
    ) -> crate::Result<()> {
        let uri = self.register_uri(&request.registration_id);
        let (_, body) = self.exchange(Method::PUT, uri, request).await?;
        reply.deliver(body);
        Ok(())
    }

    async fn request_nonce(
        &self,
        request: RequestData,
        reply: ResponseSender,
    ) -> crate::Result<()> {
        let uri = self.register_uri(&request.registration_id);
        let (status, body) = self.exchange(Method::PUT, uri, request).await?;
        if status != StatusCode::UNAUTHORIZED {
            warn!("Expected a nonce challenge but the service answered {}", status);
        }
        reply.deliver(body);
        Ok(())
    }

    async fn poll_status(
        &self,
        request: RequestData,
        reply: ResponseSender,
    ) -> crate::Result<()> {
        let operation_id = request.operation_id.clone().ok_or_else(|| {
            ProvisioningError::Client("status poll needs an operation id".to_owned())
        })?;
        let uri = self.operation_uri(&request.registration_id, &operation_id);
        let (_, body) = self.exchange(Method::GET, uri, request).await?;
        reply.deliver(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::CertificateMaterial;
    use crate::transport::response_channel;
    use std::sync::Arc;

    fn transport() -> HttpTransport {
        HttpTransport::new(&ProvisioningConfig::new("0ne000EEBBD")).unwrap()
    }

    #[test]
    fn register_uri_targets_scope_and_registration() {
        assert_eq!(
            "https://global.azure-devices-provisioning.net/0ne000EEBBD/registrations/FirstDevice/register?api-version=2018-11-01",
            transport().register_uri("FirstDevice")
        );
    }

    #[test]
    fn operation_uri_includes_operation_id() {
        assert_eq!(
            "https://global.azure-devices-provisioning.net/0ne000EEBBD/registrations/FirstDevice/operations/4.abc?api-version=2018-11-01",
            transport().operation_uri("FirstDevice", "4.abc")
        );
    }

    #[tokio::test]
    async fn certificate_request_before_open_is_a_security_error() {
        let request = RequestData {
            registration_id: "FirstDevice".to_owned(),
            payload: Vec::new(),
            operation_id: None,
            authorization: None,
            security_context: SecurityContext::ClientCertificate(Arc::new(
                CertificateMaterial::new(b"cert".to_vec(), b"key".to_vec()),
            )),
        };
        let (reply, _) = response_channel();

        let err = transport()
            .send_registration(request, reply)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::Security(_)));
    }

    #[tokio::test]
    async fn poll_without_operation_is_a_client_error() {
        let request = RequestData {
            registration_id: "FirstDevice".to_owned(),
            payload: Vec::new(),
            operation_id: None,
            authorization: Some("SharedAccessSignature sr=x".to_owned()),
            security_context: SecurityContext::ServerAuthentication,
        };
        let (reply, _) = response_channel();

        let err = transport().poll_status(request, reply).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Client(_)));
    }
}
