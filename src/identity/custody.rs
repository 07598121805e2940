//! Device key custody and the session lifecycle.
//!
//! ```text
//!  Anonymous ──register──▶ Registering ──ok──▶ Active ──lock──▶ Locked
//!      ▲  │                     │ err            │               │  │
//!      │  └───────login─────────┼────────────────┘◀────unlock────┘  │
//!      │                        ▼                                   │
//!      └────────────────── logout / failure ◀───────────────────────┘
//! ```
//!
//! A [`Session`] is a plain value owned by the caller and handed to every
//! operation; [`KeyCustody`] itself holds no per-user state. Long-lived key
//! material lives in [`DeviceStorage`] and outlasts any session.

use std::fmt;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::cipher::{EncryptedEnvelope, KdfParams, SymmetricCipher};
use crate::crypto::identity::{
    Challenge, ExportedKey, IdentityKeyPair, IdentityPrivateKey, IdentityPublicKey, Signature,
    SigningKeyPair, SigningPrivateKey, SigningPublicKey, MIN_RSA_BITS,
};
use crate::errors::{GistError, Result};
use crate::identity::directory::{Directory, UserIdentity};
use crate::identity::handle::IdentityHandle;
use crate::identity::verifier::PassphraseVerifier;
use crate::security::secure_keystore::DeviceStorage;

pub const USER_ID_KEY: &str = "gist_user_id";
pub const PRIVATE_KEY_KEY: &str = "gist_private_key";
pub const SIGNING_KEY_KEY: &str = "gist_signing_key";
pub const VERIFIER_KEY: &str = "gist_passphrase_verifier";

const DEVICE_KEYS: [&str; 4] = [USER_ID_KEY, PRIVATE_KEY_KEY, SIGNING_KEY_KEY, VERIFIER_KEY];

/// Unlocked identity held in memory for the length of a session.
pub struct ActiveSession {
    profile: UserIdentity,
    identity_key: IdentityPrivateKey,
    signing_key: Option<SigningPrivateKey>,
    passphrase: SecretString,
}

impl ActiveSession {
    pub fn handle(&self) -> &IdentityHandle {
        &self.profile.user_id
    }

    pub fn profile(&self) -> &UserIdentity {
        &self.profile
    }

    pub fn identity_key(&self) -> &IdentityPrivateKey {
        &self.identity_key
    }

    pub fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    pub(crate) fn passphrase_str(&self) -> &str {
        self.passphrase.expose_secret()
    }

    /// Prove possession of the signing key for `challenge`.
    pub fn answer_challenge(&self, challenge: &Challenge) -> Result<Signature> {
        let key = self.signing_key.as_ref().ok_or_else(|| {
            GistError::Validation(format!("identity {} has no signing key", self.handle()))
        })?;
        challenge.respond(self.handle().as_str(), key)
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("handle", self.handle())
            .finish_non_exhaustive()
    }
}

/// Per-device session state.
#[derive(Debug, Default)]
pub enum Session {
    #[default]
    Anonymous,
    Registering {
        handle: IdentityHandle,
    },
    Active(Box<ActiveSession>),
    /// Identity known, key material on device, passphrase not yet accepted.
    Locked {
        handle: IdentityHandle,
    },
}

impl Session {
    pub fn new() -> Self {
        Session::Anonymous
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Session::Anonymous => "anonymous",
            Session::Registering { .. } => "registering",
            Session::Active(_) => "active",
            Session::Locked { .. } => "locked",
        }
    }

    pub fn handle(&self) -> Option<&IdentityHandle> {
        match self {
            Session::Anonymous => None,
            Session::Registering { handle } | Session::Locked { handle } => Some(handle),
            Session::Active(active) => Some(active.handle()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Session::Active(_))
    }

    pub fn active(&self) -> Result<&ActiveSession> {
        match self {
            Session::Active(active) => Ok(active),
            other => Err(GistError::InvalidState(other.state_name())),
        }
    }
}

/// User-initiated backup of device key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBackup {
    pub user_id: IdentityHandle,
    pub private_key: ExportedKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<ExportedKey>,
}

#[derive(Clone, Copy, Debug)]
pub struct CustodyOptions {
    pub kdf: KdfParams,
    pub rsa_key_bits: usize,
}

impl Default for CustodyOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            rsa_key_bits: MIN_RSA_BITS,
        }
    }
}

/// A registration in flight.
///
/// Holds the session in `Registering` until [`complete`](Self::complete).
/// Dropped early (an error, or the caller abandoning the future) it puts the
/// session back to `Anonymous` and erases any device keys it staged.
struct PendingRegistration<'a, S: DeviceStorage> {
    session: &'a mut Session,
    storage: &'a S,
    keys_staged: bool,
}

impl<'a, S: DeviceStorage> PendingRegistration<'a, S> {
    fn begin(session: &'a mut Session, storage: &'a S, handle: IdentityHandle) -> Self {
        *session = Session::Registering { handle };
        Self {
            session,
            storage,
            keys_staged: false,
        }
    }

    fn complete(mut self, active: ActiveSession) {
        *self.session = Session::Active(Box::new(active));
    }

    fn rollback(&mut self) -> Result<()> {
        *self.session = Session::Anonymous;
        if std::mem::take(&mut self.keys_staged) {
            self.storage.remove_many(&DEVICE_KEYS)?;
        }
        Ok(())
    }
}

impl<S: DeviceStorage> Drop for PendingRegistration<'_, S> {
    fn drop(&mut self) {
        if matches!(self.session, Session::Registering { .. }) {
            warn!("registration abandoned before completion");
            if let Err(err) = self.rollback() {
                warn!(error = %err, "failed to erase staged device keys");
            }
        }
    }
}

/// Key custody service over a directory and the device store.
pub struct KeyCustody<D, S> {
    directory: D,
    storage: S,
    cipher: SymmetricCipher,
    options: CustodyOptions,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GistError::KeyGeneration(format!("worker task failed: {e}")))?
}

fn publish_error(err: GistError) -> GistError {
    match err {
        GistError::IdentityTaken(_) | GistError::Publish(_) => err,
        other => GistError::Publish(other.to_string()),
    }
}

impl<D: Directory, S: DeviceStorage> KeyCustody<D, S> {
    pub fn new(directory: D, storage: S, options: CustodyOptions) -> Self {
        Self {
            directory,
            storage,
            cipher: SymmetricCipher::new(options.kdf),
            options,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn cipher(&self) -> &SymmetricCipher {
        &self.cipher
    }

    /// Handle of the identity whose keys live on this device, if any.
    pub fn device_handle(&self) -> Result<Option<IdentityHandle>> {
        match self.storage.get(USER_ID_KEY)? {
            Some(raw) => IdentityHandle::parse(&raw)
                .map(Some)
                .map_err(|_| GistError::Storage(format!("corrupt stored handle {raw:?}"))),
            None => Ok(None),
        }
    }

    /// Create a new identity, publish its public half and keep its private
    /// half on this device.
    ///
    /// Either the directory record and the device keys both exist afterwards,
    /// or neither does.
    pub async fn register(&self, session: &mut Session, handle: &str, passphrase: &str) -> Result<()> {
        if !matches!(session, Session::Anonymous) {
            return Err(GistError::InvalidState(session.state_name()));
        }
        let handle = IdentityHandle::parse(handle)?;
        if passphrase.is_empty() {
            return Err(GistError::Validation("passphrase required".into()));
        }

        let mut pending = PendingRegistration::begin(session, &self.storage, handle.clone());
        match self.register_identity(&handle, passphrase, &mut pending.keys_staged).await {
            Ok(active) => {
                info!(handle = %handle, "identity registered");
                pending.complete(active);
                Ok(())
            }
            Err(err) => {
                warn!(handle = %handle, error = %err, "registration failed");
                pending.rollback()?;
                Err(err)
            }
        }
    }

    async fn register_identity(
        &self,
        handle: &IdentityHandle,
        passphrase: &str,
        keys_staged: &mut bool,
    ) -> Result<ActiveSession> {
        if let Some(existing) = self.device_handle()? {
            if &existing != handle {
                return Err(GistError::DeviceInUse(existing.to_string()));
            }
        }
        if self.directory.get_profile(handle).await?.is_some() {
            return Err(GistError::IdentityTaken(handle.to_string()));
        }

        let bits = self.options.rsa_key_bits;
        let (identity, signing) = blocking(move || {
            Ok((IdentityKeyPair::generate(bits)?, SigningKeyPair::generate(bits)?))
        })
        .await?;

        let profile = UserIdentity {
            user_id: handle.clone(),
            public_key: identity.public.export()?,
            signing_key: Some(signing.public.export()?),
            created_at: Utc::now(),
        };

        *keys_staged = true;
        self.persist_device_keys(handle, &identity.private, Some(&signing.private), passphrase)
            .await?;

        self.directory
            .put_profile(profile.clone())
            .await
            .map_err(publish_error)?;

        Ok(ActiveSession {
            profile,
            identity_key: identity.private,
            signing_key: Some(signing.private),
            passphrase: SecretString::new(passphrase.to_owned()),
        })
    }

    /// Seal the private keys under `passphrase` and write them, the handle
    /// and the verifier in one storage transaction.
    async fn persist_device_keys(
        &self,
        handle: &IdentityHandle,
        identity_key: &IdentityPrivateKey,
        signing_key: Option<&SigningPrivateKey>,
        passphrase: &str,
    ) -> Result<()> {
        let sealed_identity = self
            .cipher
            .encrypt(identity_key.to_pkcs8()?.as_str(), passphrase)
            .await?
            .to_json()?;
        let sealed_signing = match signing_key {
            Some(key) => Some(self.cipher.encrypt(key.to_pkcs8()?.as_str(), passphrase).await?.to_json()?),
            None => None,
        };

        let kdf = self.options.kdf;
        let owned = passphrase.to_owned();
        let verifier = blocking(move || PassphraseVerifier::create(&owned, &kdf)).await?.to_json()?;

        let mut entries = vec![
            (USER_ID_KEY, handle.as_str()),
            (PRIVATE_KEY_KEY, sealed_identity.as_str()),
            (VERIFIER_KEY, verifier.as_str()),
        ];
        if let Some(sealed) = &sealed_signing {
            entries.push((SIGNING_KEY_KEY, sealed.as_str()));
        } else {
            self.storage.remove_many(&[SIGNING_KEY_KEY])?;
        }
        self.storage.put_many(&entries)?;
        Ok(())
    }

    /// Unlock an existing identity on this device.
    ///
    /// A wrong passphrase leaves the session `Locked` on that handle.
    pub async fn login(&self, session: &mut Session, handle: &str, passphrase: &str) -> Result<()> {
        if !matches!(session, Session::Anonymous | Session::Locked { .. }) {
            return Err(GistError::InvalidState(session.state_name()));
        }
        let handle = IdentityHandle::parse(handle)?;
        self.enter(session, handle, passphrase).await
    }

    /// Retry the passphrase for a `Locked` session.
    pub async fn unlock(&self, session: &mut Session, passphrase: &str) -> Result<()> {
        let handle = match session {
            Session::Locked { handle } => handle.clone(),
            other => return Err(GistError::InvalidState(other.state_name())),
        };
        self.enter(session, handle, passphrase).await
    }

    async fn enter(&self, session: &mut Session, handle: IdentityHandle, passphrase: &str) -> Result<()> {
        match self.open_device_keys(&handle, passphrase).await {
            Ok(active) => {
                info!(handle = %handle, "session unlocked");
                *session = Session::Active(Box::new(active));
                Ok(())
            }
            Err(GistError::InvalidPassphrase) => {
                warn!(handle = %handle, "invalid passphrase");
                *session = Session::Locked { handle };
                Err(GistError::InvalidPassphrase)
            }
            Err(err) => {
                warn!(handle = %handle, error = %err, "login failed");
                Err(err)
            }
        }
    }

    async fn open_device_keys(&self, handle: &IdentityHandle, passphrase: &str) -> Result<ActiveSession> {
        let profile = self
            .directory
            .get_profile(handle)
            .await?
            .ok_or_else(|| GistError::IdentityNotFound(handle.to_string()))?;

        let not_on_device = || GistError::KeyNotOnDevice(handle.to_string());
        if self.device_handle()?.as_ref() != Some(handle) {
            return Err(not_on_device());
        }
        let sealed_identity = self.storage.get(PRIVATE_KEY_KEY)?.ok_or_else(not_on_device)?;
        let verifier = self.storage.get(VERIFIER_KEY)?.ok_or_else(not_on_device)?;
        let verifier = PassphraseVerifier::from_json(&verifier)?;

        let owned = passphrase.to_owned();
        if !blocking(move || verifier.matches(&owned)).await? {
            return Err(GistError::InvalidPassphrase);
        }

        let identity_key = IdentityPrivateKey::import(&self.unseal(&sealed_identity, passphrase).await?)?;
        if identity_key.public_key() != IdentityPublicKey::import(&profile.public_key)? {
            // Keys left over from an identity whose directory entry was replaced.
            return Err(not_on_device());
        }

        let signing_key = match self.storage.get(SIGNING_KEY_KEY)? {
            Some(sealed) => {
                let key = SigningPrivateKey::import(&self.unseal(&sealed, passphrase).await?)?;
                if let Some(published) = &profile.signing_key {
                    if key.public_key() != SigningPublicKey::import(published)? {
                        return Err(not_on_device());
                    }
                }
                Some(key)
            }
            None => None,
        };

        Ok(ActiveSession {
            profile,
            identity_key,
            signing_key,
            passphrase: SecretString::new(passphrase.to_owned()),
        })
    }

    async fn unseal(&self, sealed: &str, passphrase: &str) -> Result<ExportedKey> {
        let envelope = EncryptedEnvelope::from_json(sealed)
            .map_err(|e| GistError::Storage(format!("corrupt sealed key: {e}")))?;
        let pkcs8 = self.cipher.decrypt(&envelope, passphrase).await.map_err(|_| {
            GistError::Storage("sealed key does not open under the verified passphrase".into())
        })?;
        Ok(ExportedKey::new(pkcs8))
    }

    /// Drop decrypted keys and the passphrase from memory, keeping the
    /// identity selected.
    pub fn lock(&self, session: &mut Session) -> Result<()> {
        match std::mem::take(session) {
            Session::Active(active) => {
                info!(handle = %active.handle(), "session locked");
                *session = Session::Locked {
                    handle: active.handle().clone(),
                };
                Ok(())
            }
            other => {
                let state = other.state_name();
                *session = other;
                Err(GistError::InvalidState(state))
            }
        }
    }

    /// End the session. Device key material stays in storage so the same
    /// identity can log in again without re-importing.
    pub fn logout(&self, session: &mut Session) -> Result<()> {
        if let Some(handle) = session.handle() {
            info!(handle = %handle, state = session.state_name(), "logged out");
        }
        *session = Session::Anonymous;
        Ok(())
    }

    /// Serialize the active identity's private keys for a backup download.
    pub fn export_identity(&self, session: &Session) -> Result<IdentityBackup> {
        let active = session.active()?;
        Ok(IdentityBackup {
            user_id: active.handle().clone(),
            private_key: active.identity_key.export()?,
            signing_key: active.signing_key.as_ref().map(|k| k.export()).transpose()?,
        })
    }

    /// Install a backup on this device, sealed under `passphrase`.
    ///
    /// The backup must match the published directory record. The session is
    /// left `Anonymous`; log in afterwards.
    pub async fn import_identity(&self, session: &Session, backup: &IdentityBackup, passphrase: &str) -> Result<()> {
        if !matches!(session, Session::Anonymous) {
            return Err(GistError::InvalidState(session.state_name()));
        }
        if passphrase.is_empty() {
            return Err(GistError::Validation("passphrase required".into()));
        }
        let handle = &backup.user_id;
        if let Some(existing) = self.device_handle()? {
            if &existing != handle {
                return Err(GistError::DeviceInUse(existing.to_string()));
            }
        }

        let profile = self
            .directory
            .get_profile(handle)
            .await?
            .ok_or_else(|| GistError::IdentityNotFound(handle.to_string()))?;

        let identity_key = IdentityPrivateKey::import(&backup.private_key)?;
        if identity_key.public_key() != IdentityPublicKey::import(&profile.public_key)? {
            return Err(GistError::KeyImport(format!(
                "backup does not match the published key for {handle}"
            )));
        }
        let signing_key = backup
            .signing_key
            .as_ref()
            .map(SigningPrivateKey::import)
            .transpose()?;
        if let (Some(key), Some(published)) = (&signing_key, &profile.signing_key) {
            if key.public_key() != SigningPublicKey::import(published)? {
                return Err(GistError::KeyImport(format!(
                    "backup signing key does not match the published key for {handle}"
                )));
            }
        }

        self.persist_device_keys(handle, &identity_key, signing_key.as_ref(), passphrase)
            .await?;
        info!(handle = %handle, "identity imported onto device");
        Ok(())
    }

    /// Erase every piece of device key material.
    pub fn forget_device_identity(&self, session: &Session) -> Result<()> {
        if matches!(session, Session::Active(_) | Session::Registering { .. }) {
            return Err(GistError::InvalidState(session.state_name()));
        }
        self.storage.remove_many(&DEVICE_KEYS)?;
        warn!("device key material erased");
        Ok(())
    }

    /// Check a challenge response against the signing key published for
    /// `handle`.
    pub async fn verify_challenge(&self, handle: &IdentityHandle, challenge: &Challenge, response: &Signature) -> Result<bool> {
        let profile = self
            .directory
            .get_profile(handle)
            .await?
            .ok_or_else(|| GistError::IdentityNotFound(handle.to_string()))?;
        let Some(published) = &profile.signing_key else {
            return Ok(false);
        };
        let key = SigningPublicKey::import(published)?;
        Ok(challenge.verify_response(handle.as_str(), response, &key))
    }
}
