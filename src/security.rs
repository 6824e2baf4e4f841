use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ProvisioningError, TokenError};
use crate::token::{hmac_sha256, TokenSigner};

/// Hardware (or emulated) key store holding the TPM identity of a device
///
/// Private key material never leaves the store, callers only ask it to sign.
pub trait SecureKeyStore: Send + Sync + fmt::Debug {
    /// The endorsement key of the TPM
    fn endorsement_key(&self) -> crate::Result<Vec<u8>>;
    /// The storage root key of the TPM
    fn storage_root_key(&self) -> crate::Result<Vec<u8>>;
    /// Import the authentication key issued by the provisioning service
    fn import_authentication_key(&self, key: &[u8]) -> crate::Result<()>;
    /// Sign `data` with the imported authentication key
    fn sign(&self, data: &[u8]) -> crate::Result<Vec<u8>>;
}

/// Adapts a [`SecureKeyStore`] so tokens can be signed inside the store
#[derive(Debug, Clone)]
pub(crate) struct KeyStoreSigner(pub(crate) Arc<dyn SecureKeyStore>);

impl TokenSigner for KeyStoreSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.0
            .sign(message)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

/// In memory key store emulating a TPM
///
/// Signs with HMAC-SHA256 over the imported authentication key.
#[derive(Debug)]
pub struct SoftwareKeyStore {
    endorsement_key: Vec<u8>,
    storage_root_key: Vec<u8>,
    authentication_key: Mutex<Option<Vec<u8>>>,
}

impl SoftwareKeyStore {
    ///
    pub fn new(endorsement_key: Vec<u8>, storage_root_key: Vec<u8>) -> SoftwareKeyStore {
        SoftwareKeyStore {
            endorsement_key,
            storage_root_key,
            authentication_key: Mutex::new(None),
        }
    }
}

impl SecureKeyStore for SoftwareKeyStore {
    fn endorsement_key(&self) -> crate::Result<Vec<u8>> {
        Ok(self.endorsement_key.clone())
    }

    fn storage_root_key(&self) -> crate::Result<Vec<u8>> {
        Ok(self.storage_root_key.clone())
    }

    fn import_authentication_key(&self, key: &[u8]) -> crate::Result<()> {
        if key.is_empty() {
            return Err(ProvisioningError::Security(
                "authentication key cannot be empty".to_owned(),
            ));
        }
        *self
            .authentication_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(key.to_vec());
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        let key = self
            .authentication_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = key.as_ref().ok_or_else(|| {
            ProvisioningError::Security("no authentication key has been imported".to_owned())
        })?;
        Ok(hmac_sha256(key, data)?)
    }
}

/// Device certificate and private key presented during the TLS handshake
#[derive(Clone)]
pub struct CertificateMaterial {
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate_pem", &String::from_utf8_lossy(&self.certificate_pem))
            .finish()
    }
}

impl CertificateMaterial {
    /// PEM encoded certificate chain and PKCS #8 PEM private key
    pub fn new(certificate_pem: Vec<u8>, private_key_pem: Vec<u8>) -> CertificateMaterial {
        CertificateMaterial {
            certificate_pem,
            private_key_pem,
        }
    }

    ///
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    ///
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }
}

/// TPM backed attestation, the service challenges the endorsement key
#[derive(Debug, Clone)]
pub struct TpmMaterial {
    key_store: Arc<dyn SecureKeyStore>,
}

impl TpmMaterial {
    ///
    pub fn new(key_store: Arc<dyn SecureKeyStore>) -> TpmMaterial {
        TpmMaterial { key_store }
    }

    ///
    pub fn key_store(&self) -> &Arc<dyn SecureKeyStore> {
        &self.key_store
    }
}

/// Symmetric key attestation with a primary and secondary key
///
/// Registration tokens are always signed with the primary key. The secondary key
/// is only carried for the caller, for example to build a second identity with
/// the keys swapped while the primary key is being rotated.
#[derive(Clone)]
pub struct SymmetricKeyMaterial {
    primary_key: String,
    secondary_key: Option<String>,
}

impl fmt::Debug for SymmetricKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeyMaterial")
            .field("has_secondary_key", &self.secondary_key.is_some())
            .finish()
    }
}

impl SymmetricKeyMaterial {
    /// Base64 encoded keys as shown on the enrollment
    pub fn new<T>(primary_key: T, secondary_key: Option<T>) -> SymmetricKeyMaterial
    where
        T: Into<String>,
    {
        SymmetricKeyMaterial {
            primary_key: primary_key.into(),
            secondary_key: secondary_key.map(Into::into),
        }
    }

    /// Key material for a device in a group enrollment, derived from the group key
    ///
    /// # Example
    /// ```
    /// use azure_iot_provisioning::SymmetricKeyMaterial;
    ///
    /// let material = SymmetricKeyMaterial::from_group_key(
    ///     "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
    ///     "FirstDevice",
    /// ).unwrap();
    /// ```
    pub fn from_group_key(
        group_key: &str,
        registration_id: &str,
    ) -> Result<SymmetricKeyMaterial, TokenError> {
        let derived = Self::derive_device_key(group_key, registration_id)?;
        Ok(SymmetricKeyMaterial::new(derived, None))
    }

    /// base64(HMAC-SHA256(group key, registration id))
    pub fn derive_device_key(group_key: &str, registration_id: &str) -> Result<String, TokenError> {
        let group_key =
            base64::decode(group_key).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let derived = hmac_sha256(&group_key, registration_id.as_bytes())?;
        Ok(base64::encode(&derived))
    }

    ///
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// The secondary key, never used for signing by this crate
    pub fn secondary_key(&self) -> Option<&str> {
        self.secondary_key.as_deref()
    }
}

/// How the device proves its identity, fixed for the lifetime of a client
#[derive(Debug, Clone)]
pub enum AttestationMaterial {
    /// X.509 certificate presented on the TLS channel
    Certificate(CertificateMaterial),
    /// TPM nonce challenge followed by a SAS signed inside the key store
    Tpm(TpmMaterial),
    /// SAS signed with the enrollment's symmetric key
    SymmetricKey(SymmetricKeyMaterial),
}

impl AttestationMaterial {
    /// Short name used in logs
    pub fn scheme(&self) -> &'static str {
        match self {
            AttestationMaterial::Certificate(_) => "x509",
            AttestationMaterial::Tpm(_) => "tpm",
            AttestationMaterial::SymmetricKey(_) => "symmetric-key",
        }
    }
}

/// Registration id together with its attestation material
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    registration_id: String,
    attestation: AttestationMaterial,
}

impl DeviceIdentity {
    ///
    pub fn new<T>(registration_id: T, attestation: AttestationMaterial) -> DeviceIdentity
    where
        T: Into<String>,
    {
        DeviceIdentity {
            registration_id: registration_id.into(),
            attestation,
        }
    }

    ///
    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    ///
    pub fn attestation(&self) -> &AttestationMaterial {
        &self.attestation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_key_matches_known_value() {
        let key = SymmetricKeyMaterial::derive_device_key(
            "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
            "FirstDevice",
        )
        .unwrap();

        assert_eq!("rvz3zYFCdkk6G1SKkR/9S8bYL+qtngnjD98wlTr12MY=", key);
    }

    #[test]
    fn derive_rejects_bad_group_key() {
        let err = SymmetricKeyMaterial::derive_device_key("%%%", "FirstDevice").unwrap_err();
        assert!(matches!(err, TokenError::InvalidKey(_)));
    }

    #[test]
    fn software_key_store_signs_after_import() {
        let store = SoftwareKeyStore::new(b"ek".to_vec(), b"srk".to_vec());
        assert!(matches!(
            store.sign(b"data"),
            Err(ProvisioningError::Security(_))
        ));

        store.import_authentication_key(b"secret").unwrap();

        assert_eq!(
            hmac_sha256(b"secret", b"data").unwrap(),
            store.sign(b"data").unwrap()
        );
    }

    #[test]
    fn key_store_signer_reports_signing_errors() {
        let signer = KeyStoreSigner(Arc::new(SoftwareKeyStore::new(vec![1], vec![2])));
        assert!(matches!(signer.sign(b"x"), Err(TokenError::Signing(_))));
    }

    #[test]
    fn debug_output_hides_keys() {
        let material = SymmetricKeyMaterial::new("cHJpbWFyeQ==", Some("c2Vjb25kYXJ5"));
        let printed = format!("{:?}", material);
        assert!(!printed.contains("cHJpbWFyeQ=="));
        assert_eq!(Some("c2Vjb25kYXJ5"), material.secondary_key());
    }
}
