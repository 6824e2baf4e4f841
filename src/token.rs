use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;

use crate::error::TokenError;

/// Lifespan used when a token is requested with a zero or negative lifespan
pub const DEFAULT_TOKEN_LIFESPAN_SECS: i64 = 3600;

/// Produces the raw signature over a shared access signature string-to-sign
pub trait TokenSigner: Send + Sync + fmt::Debug {
    ///
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TokenError>;
}

/// Signs tokens with a base64 encoded symmetric device key
#[derive(Clone)]
pub struct DeviceKeySigner {
    key: Vec<u8>,
}

impl fmt::Debug for DeviceKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeySigner").finish()
    }
}

impl DeviceKeySigner {
    /// Decode the device key, failing with [`TokenError::InvalidKey`] if it is not base64
    pub fn new(key: &str) -> Result<DeviceKeySigner, TokenError> {
        let key = base64::decode(key).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        Hmac::<Sha256>::new_varkey(&key)
            .map_err(|_| TokenError::InvalidKey("HMAC-SHA256 rejected the key".to_owned()))?;
        Ok(DeviceKeySigner { key })
    }
}

impl TokenSigner for DeviceKeySigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TokenError> {
        hmac_sha256(&self.key, message)
    }
}

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = Hmac::<Sha256>::new_varkey(key)
        .map_err(|_| TokenError::InvalidKey("HMAC-SHA256 rejected the key".to_owned()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// A minted shared access signature
///
/// Tokens are immutable; renewal replaces the token rather than changing it.
/// The `Display` implementation renders the exact header value:
/// `SharedAccessSignature sr=<uri>&sig=<signature>&se=<expiry>&skn=<key name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    resource_uri: String,
    signature: String,
    expiry: i64,
    key_name: String,
}

impl SasToken {
    /// Mint a token for `resource_uri` signed with the base64 `key_value`
    ///
    /// # Arguments
    ///
    /// * `resource_uri` - The resource the token grants access to
    /// * `key_value` - Base64 encoded symmetric key
    /// * `key_name` - Shared access policy name, empty for registration scoped tokens
    /// * `lifespan_secs` - Seconds until expiry, [`DEFAULT_TOKEN_LIFESPAN_SECS`] if not positive
    ///
    /// # Example
    /// ```
    /// use azure_iot_provisioning::SasToken;
    ///
    /// let token = SasToken::mint(
    ///     "0ne000EEBBD/registrations/FirstDevice",
    ///     "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
    ///     "",
    ///     3600,
    /// ).unwrap();
    /// assert!(token.to_string().starts_with("SharedAccessSignature sr=0ne000eebbd%2Fregistrations%2Ffirstdevice&sig="));
    /// ```
    pub fn mint(
        resource_uri: &str,
        key_value: &str,
        key_name: &str,
        lifespan_secs: i64,
    ) -> Result<SasToken, TokenError> {
        let signer = DeviceKeySigner::new(key_value)?;
        Self::mint_with(resource_uri, &signer, key_name, lifespan_secs)
    }

    /// Mint a token whose signature is produced by `signer`
    pub fn mint_with(
        resource_uri: &str,
        signer: &dyn TokenSigner,
        key_name: &str,
        lifespan_secs: i64,
    ) -> Result<SasToken, TokenError> {
        Self::mint_at(
            resource_uri,
            signer,
            key_name,
            lifespan_secs,
            Utc::now().timestamp(),
        )
    }

    pub(crate) fn mint_at(
        resource_uri: &str,
        signer: &dyn TokenSigner,
        key_name: &str,
        lifespan_secs: i64,
        now: i64,
    ) -> Result<SasToken, TokenError> {
        let lifespan_secs = if lifespan_secs <= 0 {
            DEFAULT_TOKEN_LIFESPAN_SECS
        } else {
            lifespan_secs
        };
        let expiry = now
            .checked_add(lifespan_secs)
            .ok_or(TokenError::InvalidLifespan(lifespan_secs))?;

        let resource_uri = url_encode(&resource_uri.to_lowercase());
        let to_sign = format!("{}\n{}", resource_uri, expiry);

        let signature = signer.sign(to_sign.as_bytes())?;
        if signature.is_empty() {
            return Err(TokenError::Signing(
                "signer returned an empty signature".to_owned(),
            ));
        }
        let signature = url_encode(&base64::encode(&signature));

        let token = SasToken {
            resource_uri,
            signature,
            expiry,
            key_name: key_name.to_owned(),
        };

        trace!("Minted token: {}", token);

        Ok(token)
    }

    /// The url encoded, lower cased resource uri
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// The url encoded base64 signature
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Expiry in seconds since the unix epoch
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    ///
    pub fn key_name(&self) -> &str {
        &self.key_name
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            self.resource_uri, self.signature, self.expiry, self.key_name
        )
    }
}

/// Caches the current token and renews it once its remaining lifetime drops
/// to the renewal buffer
///
/// Renewal is lazy: it happens inside [`TokenCache::get_token`], never on a timer.
/// All callers are serialised so only one token is ever current.
#[derive(Debug)]
pub struct TokenCache {
    resource_uri: String,
    key_name: String,
    signer: Arc<dyn TokenSigner>,
    lifespan_secs: i64,
    renewal_buffer_secs: i64,
    current: Mutex<Option<Arc<SasToken>>>,
}

impl TokenCache {
    /// Create an empty cache, the first call to [`TokenCache::get_token`] mints
    ///
    /// `renewal_buffer_percent` is the share of the lifespan left at which the
    /// token is renewed, capped at 99.
    pub fn new<T>(
        resource_uri: T,
        key_name: T,
        signer: Arc<dyn TokenSigner>,
        lifespan_secs: i64,
        renewal_buffer_percent: u8,
    ) -> TokenCache
    where
        T: Into<String>,
    {
        let lifespan_secs = if lifespan_secs <= 0 {
            DEFAULT_TOKEN_LIFESPAN_SECS
        } else {
            lifespan_secs
        };
        let percent = i64::from(renewal_buffer_percent.min(99));
        // lifespan * percent / 100 without overflowing on huge lifespans
        let renewal_buffer_secs =
            lifespan_secs / 100 * percent + lifespan_secs % 100 * percent / 100;

        TokenCache {
            resource_uri: resource_uri.into(),
            key_name: key_name.into(),
            signer,
            lifespan_secs,
            renewal_buffer_secs,
            current: Mutex::new(None),
        }
    }

    /// The current token, minting a new one first if there is none or it is
    /// about to expire
    pub fn get_token(&self) -> Result<Arc<SasToken>, TokenError> {
        self.get_token_at(Utc::now().timestamp())
    }

    pub(crate) fn get_token_at(&self, now: i64) -> Result<Arc<SasToken>, TokenError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = current.as_ref() {
            if token.expiry() - now > self.renewal_buffer_secs {
                return Ok(Arc::clone(token));
            }
            debug!(
                "Renewing token for {} which expires at {}",
                self.resource_uri,
                token.expiry()
            );
        }

        let token = Arc::new(SasToken::mint_at(
            &self.resource_uri,
            self.signer.as_ref(),
            &self.key_name,
            self.lifespan_secs,
            now,
        )?);
        *current = Some(Arc::clone(&token));

        Ok(token)
    }

    /// Seconds before expiry at which the cached token is replaced
    pub fn renewal_buffer_secs(&self) -> i64 {
        self.renewal_buffer_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const KEY: &str = "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=";

    fn device_key() -> DeviceKeySigner {
        DeviceKeySigner::new(KEY).unwrap()
    }

    #[derive(Debug, Default)]
    struct CountingSigner {
        calls: AtomicUsize,
    }

    impl TokenSigner for CountingSigner {
        fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            hmac_sha256(b"counting", message)
        }
    }

    #[test]
    fn device_token_matches_known_signature() {
        let token = SasToken::mint_at(
            "myHub.azure-devices.net/devices/FirstDevice",
            &device_key(),
            "",
            3600,
            1_587_119_709,
        )
        .unwrap();

        assert_eq!("SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Ffirstdevice&sig=D9kQ%2BGd4WXNJmT0BT1A%2F1nuyP5pcmZTcznKOcjH5ld4%3D&se=1587123309&skn=", token.to_string());
    }

    #[test]
    fn registration_token_matches_known_signature() {
        let token = SasToken::mint_at(
            "0ne000EEBBD/registrations/FirstDevice",
            &device_key(),
            "",
            3600,
            1_591_917_706,
        )
        .unwrap();

        assert_eq!("SharedAccessSignature sr=0ne000eebbd%2Fregistrations%2Ffirstdevice&sig=QA0bkBJVRNEvA66MNJyLsNd%2F60ZGzGKdvPrKA8iIkiI%3D&se=1591921306&skn=", token.to_string());
    }

    #[test]
    fn policy_name_is_appended() {
        let token = SasToken::mint_at(
            "myhub.azure-devices.net",
            &device_key(),
            "iothubowner",
            3600,
            1_591_917_706,
        )
        .unwrap();

        assert_eq!("iothubowner", token.key_name());
        assert_eq!(
            "X3Myk0TseNKBdjkXDQNE87UfScXCTQPuyP7c6PtOQTE%3D",
            token.signature()
        );
        assert!(token.to_string().ends_with("&se=1591921306&skn=iothubowner"));
    }

    #[test]
    fn non_positive_lifespan_uses_default() {
        let zero = SasToken::mint_at("hub/devices/d", &device_key(), "", 0, 1_000).unwrap();
        let negative = SasToken::mint_at("hub/devices/d", &device_key(), "", -5, 1_000).unwrap();

        assert_eq!(1_000 + DEFAULT_TOKEN_LIFESPAN_SECS, zero.expiry());
        assert_eq!(zero, negative);
    }

    #[test]
    fn expiry_is_now_plus_lifespan() {
        let before = Utc::now().timestamp();
        let token = SasToken::mint("hub/devices/d", KEY, "", 120).unwrap();
        let after = Utc::now().timestamp();

        assert!(token.expiry() >= before + 120);
        assert!(token.expiry() <= after + 120);
    }

    #[test]
    fn signature_verifies_against_key() {
        let token = SasToken::mint("Scope/registrations/Dev-1", KEY, "", 3600).unwrap();

        let to_sign = format!("scope%2Fregistrations%2Fdev-1\n{}", token.expiry());
        let expected = hmac_sha256(&base64::decode(KEY).unwrap(), to_sign.as_bytes()).unwrap();

        assert_eq!(url_encode(&base64::encode(&expected)), token.signature());
        assert_eq!("scope%2Fregistrations%2Fdev-1", token.resource_uri());
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        let err = SasToken::mint("hub/devices/d", "not base64!", "", 3600).unwrap_err();
        assert!(matches!(err, TokenError::InvalidKey(_)));
    }

    #[test]
    fn cached_token_is_reused() {
        let cache = TokenCache::new("hub/devices/d", "", Arc::new(device_key()), 3600, 15);

        let first = cache.get_token().unwrap();
        let second = cache.get_token().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn token_is_renewed_inside_buffer() {
        let cache = TokenCache::new("hub/devices/d", "", Arc::new(device_key()), 3600, 15);
        assert_eq!(540, cache.renewal_buffer_secs());

        let first = cache.get_token_at(10_000).unwrap();
        let still_valid = cache.get_token_at(10_000 + 3600 - 541).unwrap();
        let renewed = cache.get_token_at(10_000 + 3600 - 540).unwrap();

        assert!(Arc::ptr_eq(&first, &still_valid));
        assert!(!Arc::ptr_eq(&first, &renewed));
        assert_eq!(10_000 + 3600 - 540 + 3600, renewed.expiry());
    }

    #[test]
    fn concurrent_callers_share_one_mint() {
        let signer = Arc::new(CountingSigner::default());
        let cache = Arc::new(TokenCache::new(
            "hub/devices/d",
            "",
            signer.clone(),
            3600,
            15,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_token().unwrap())
            })
            .collect();
        let tokens: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(1, signer.calls.load(Ordering::SeqCst));
        assert!(tokens.iter().all(|t| Arc::ptr_eq(t, &tokens[0])));
    }

    #[test]
    fn expiry_past_i64_is_rejected() {
        let err = SasToken::mint("hub/devices/d", KEY, "", i64::MAX).unwrap_err();
        assert_eq!(TokenError::InvalidLifespan(i64::MAX), err);

        let err = SasToken::mint_at("hub/devices/d", &device_key(), "", 3600, i64::MAX - 10)
            .unwrap_err();
        assert_eq!(TokenError::InvalidLifespan(3600), err);
    }

    #[test]
    fn huge_lifespan_cache_does_not_overflow() {
        let lifespan = i64::MAX / 2;
        let half = TokenCache::new("hub/devices/d", "", Arc::new(device_key()), lifespan, 15);
        assert_eq!(
            lifespan / 100 * 15 + lifespan % 100 * 15 / 100,
            half.renewal_buffer_secs()
        );
        assert_eq!(10_000 + lifespan, half.get_token_at(10_000).unwrap().expiry());

        let max = TokenCache::new("hub/devices/d", "", Arc::new(device_key()), i64::MAX, 99);
        assert!(matches!(
            max.get_token_at(10_000),
            Err(TokenError::InvalidLifespan(i64::MAX))
        ));
    }
}
