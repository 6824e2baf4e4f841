use thiserror::Error;

/// Errors raised while minting a shared access signature
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The key is not valid base64 or could not initialise the HMAC
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// The lifespan puts the expiry beyond what an epoch timestamp can hold
    #[error("token lifespan of {0} seconds is out of range")]
    InvalidLifespan(i64),
    /// The signer (for example a TPM) failed to produce a signature
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Errors that can be raised during provisioning or registration
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Malformed input, missing collaborator or misuse of the client
    #[error("client error: {0}")]
    Client(String),
    /// The attestation handshake did not complete
    #[error("authentication failure: {0}")]
    Authentication(String),
    /// The provisioning service explicitly refused the device
    #[error("provisioning service rejected the request: {0}")]
    HubRejected(String),
    /// Key store or signing failure
    #[error("security provider error: {0}")]
    Security(String),
    /// A symmetric key could not be used to sign
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// A dispatched task timed out or was cancelled
    #[error("{0}")]
    Execution(String),
    /// The transport could not reach the provisioning service
    #[error("transport error: {0}")]
    Transport(String),
    ///
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TokenError> for ProvisioningError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidKey(msg) => ProvisioningError::InvalidKey(msg),
            TokenError::Signing(msg) => ProvisioningError::Security(msg),
            TokenError::InvalidLifespan(secs) => ProvisioningError::Client(format!(
                "token lifespan of {} seconds is out of range",
                secs
            )),
        }
    }
}
