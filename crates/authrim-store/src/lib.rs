//! Sharded authorization state stores: challenges, sessions, refresh-token
//! families, revocation, device secrets, replay windows and their durable
//! mirrors.

pub mod anon_device;
pub mod cache;
pub mod challenge;
pub mod consent;
pub mod device_secret;
pub mod linked_identity;
pub mod refresh_family;
pub mod replay;
pub mod revocation;
pub mod session;
pub mod session_client;
pub mod shard;
pub mod sql;

pub use anon_device::{
    AnonDeviceError, AnonymousDevice, AnonymousDeviceStore, DeviceStability,
    InMemoryAnonymousDeviceStore,
};
pub use cache::{Cache, MultiLevelCache};
pub use challenge::{
    AuthCodeData, Challenge, ChallengeError, ChallengeKind, ChallengeStore, ShardedChallengeStore,
};
pub use consent::{ClientConsent, ConsentError, ConsentStore, InMemoryConsentStore};
pub use device_secret::{
    CapPolicy, DeviceSecret, DeviceSecretError, DeviceSecretStore, InMemoryDeviceSecretStore,
    IssuedDeviceSecret,
};
pub use linked_identity::{
    InMemoryLinkedIdentityStore, LinkedIdentity, LinkedIdentityError, LinkedIdentityStore,
};
pub use refresh_family::{
    decode_refresh_jti, encode_refresh_jti, revocation_reasons, FamilyHead, FamilyMirror,
    FamilyRecord, NoopFamilyMirror, RefreshFamilyError, RefreshFamilyManager, RefreshJti,
};
pub use replay::{JtiReplayIndex, ShardedDpopReplayStore};
pub use revocation::{
    new_access_jti, RevocationEntry, RevocationError, ShardedRevocationIndex, TokenRevocationIndex,
};
pub use session::{
    new_session_id, parse_session_shard, Session, SessionError, SessionStore, ShardedSessionStore,
    SESSION_ID_PREFIX,
};
pub use session_client::{
    decrypt_webhook_secret, encrypt_webhook_secret, InMemorySessionClientIndex, SessionClient,
    SessionClientError, SessionClientIndex,
};
pub use sql::{ConsentRepository, LinkedIdentityRepository, TokenFamilyRepository};
