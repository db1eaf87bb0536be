//! Connect and forward, the two operations the hub offers.
//!
//! Both are straight pipelines: each step either yields the input for the
//! next one or ends the request with the error for that step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    allocator::AddressAllocator,
    channel::ChannelService,
    codec::TokenCodec,
    error::RelayError,
    identity::Identity,
    metrics::HubMetrics,
};

/// Returned to a client on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Subscription token for the client's push channel.
    pub channel: String,
    /// Encrypted [`Identity`]; the only credential accepted by forward.
    pub identity: String,
    /// Allocated address, in the clear for display. Carries no authority.
    pub address: String,
}

/// Body of `POST /forward`. Missing fields read as empty strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardRequest {
    pub identity: String,
    pub to: String,
    pub data: String,
}

/// What the recipient receives on its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOutput {
    pub from: String,
    pub to: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub ok: bool,
}

pub struct Relay {
    allocator: Arc<dyn AddressAllocator>,
    codec: Arc<dyn TokenCodec>,
    channels: Arc<dyn ChannelService>,
    metrics: Arc<HubMetrics>,
}

impl Relay {
    pub fn new(
        allocator: Arc<dyn AddressAllocator>,
        codec: Arc<dyn TokenCodec>,
        channels: Arc<dyn ChannelService>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            allocator,
            codec,
            channels,
            metrics,
        }
    }

    /// Allocates an address for the caller at `remote_addr`, opens its
    /// channel, and mints the identity token binding the two.
    pub async fn connect(&self, remote_addr: &str) -> Result<ConnectResponse, RelayError> {
        let address = self
            .allocator
            .next()
            .await
            .map_err(RelayError::AddressAllocation)?;

        let channel = self
            .channels
            .create_channel(&address)
            .await
            .map_err(RelayError::ChannelInitialize)?;

        let identity = Identity::new(remote_addr, address.as_str())
            .to_json()
            .map_err(RelayError::IdentitySerialize)?;

        let identity = self
            .codec
            .encrypt(&identity)
            .await
            .map_err(RelayError::Encryption)?;

        info!("Connected {} as {}", remote_addr, address);
        self.metrics.connects.inc();

        Ok(ConnectResponse {
            channel,
            identity,
            address,
        })
    }

    /// Authenticates the sender of `body` and relays its payload. Delivery
    /// is best-effort: a failed push is logged, not reported.
    pub async fn forward(&self, body: &[u8], remote_addr: &str) -> Result<ForwardResponse, RelayError> {
        let request: ForwardRequest =
            serde_json::from_slice(body).map_err(RelayError::Deserialize)?;

        let plaintext = self
            .codec
            .decrypt(&request.identity)
            .await
            .map_err(RelayError::Decryption)?;

        let identity = Identity::from_json(&plaintext).map_err(RelayError::DeserializeIdentity)?;

        if !identity.is_bound_to(remote_addr) {
            return Err(RelayError::IdentityVerification {
                issued_to: identity.remote_addr,
                presented_from: remote_addr.to_string(),
            });
        }

        let output = serde_json::to_string(&ForwardOutput {
            from: identity.address,
            to: request.to.clone(),
            data: request.data,
        })
        .map_err(RelayError::Serialize)?;

        match self.channels.push(&request.to, output).await {
            Ok(()) => debug!("Forwarded message to {}", request.to),
            Err(e) => {
                warn!("Push to {} failed: {}", request.to, e);
                self.metrics.push_failures.inc();
            }
        }
        self.metrics.forwards.inc();

        Ok(ForwardResponse { ok: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::{AllocatorError, VirtualAddressAllocator},
        channel::ChannelError,
        codec::{AesCfbCodec, CodecError},
        error::ErrorCode,
        keys::{KeyProvider, SecretKey},
        store::{MemoryStore, StoreError},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannels {
        created: Mutex<Vec<String>>,
        pushed: Mutex<Vec<(String, String)>>,
        fail_create: bool,
        fail_push: bool,
    }

    #[async_trait]
    impl ChannelService for RecordingChannels {
        async fn create_channel(&self, address: &str) -> Result<String, ChannelError> {
            if self.fail_create {
                return Err(ChannelError::Entropy("unavailable".into()));
            }
            self.created.lock().unwrap().push(address.to_string());
            Ok(format!("channel-{}", address))
        }

        async fn push(&self, address: &str, payload: String) -> Result<(), ChannelError> {
            if self.fail_push {
                return Err(ChannelError::UnknownAddress(address.to_string()));
            }
            self.pushed.lock().unwrap().push((address.to_string(), payload));
            Ok(())
        }
    }

    struct BrokenAllocator;

    #[async_trait]
    impl AddressAllocator for BrokenAllocator {
        async fn next(&self) -> Result<String, AllocatorError> {
            Err(AllocatorError::Store(StoreError::OperationFailed("down".into())))
        }
    }

    struct BrokenCodec;

    #[async_trait]
    impl TokenCodec for BrokenCodec {
        async fn encrypt(&self, _plaintext: &[u8]) -> Result<String, CodecError> {
            Err(CodecError::Cipher)
        }

        async fn decrypt(&self, _token: &str) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Cipher)
        }
    }

    struct Fixture {
        relay: Relay,
        channels: Arc<RecordingChannels>,
        codec: Arc<AesCfbCodec>,
    }

    fn fixture_with(store: MemoryStore, channels: RecordingChannels) -> Fixture {
        let store = Arc::new(store);
        let keys = Arc::new(KeyProvider::with_key(
            store.clone(),
            SecretKey::from_bytes([42u8; 32]),
        ));
        let codec = Arc::new(AesCfbCodec::new(keys));
        let channels = Arc::new(channels);
        let relay = Relay::new(
            Arc::new(VirtualAddressAllocator::new(store)),
            codec.clone(),
            channels.clone(),
            Arc::new(HubMetrics::new().unwrap()),
        );
        Fixture {
            relay,
            channels,
            codec,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryStore::new(), RecordingChannels::default())
    }

    fn forward_body(identity: &str, to: &str, data: &str) -> Vec<u8> {
        serde_json::to_vec(&ForwardRequest {
            identity: identity.into(),
            to: to.into(),
            data: data.into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_echoes_allocated_address() {
        let fx = fixture_with(MemoryStore::with_ordinal(5), RecordingChannels::default());
        let response = fx.relay.connect("1.2.3.4:9").await.unwrap();

        assert_eq!(response.address, "5.0.0.0.0.0");
        assert_eq!(response.channel, "channel-5.0.0.0.0.0");
        assert!(!response.identity.is_empty());
        assert_ne!(response.identity, response.address);
        assert_eq!(*fx.channels.created.lock().unwrap(), vec!["5.0.0.0.0.0".to_string()]);
    }

    #[tokio::test]
    async fn test_identity_token_decrypts_to_caller() {
        let fx = fixture();
        let response = fx.relay.connect("1.2.3.4:9").await.unwrap();

        let plaintext = fx.codec.decrypt(&response.identity).await.unwrap();
        let identity = Identity::from_json(&plaintext).unwrap();
        assert_eq!(identity, Identity::new("1.2.3.4:9", "0.0.0.0.0.0"));
    }

    #[tokio::test]
    async fn test_forward_from_bound_address_is_relayed() {
        let fx = fixture();
        let sender = fx.relay.connect("1.2.3.4:9").await.unwrap();

        let body = forward_body(&sender.identity, "7.0.0.0.0.0", "offer");
        let response = fx.relay.forward(&body, "1.2.3.4:9").await.unwrap();
        assert!(response.ok);

        let pushed = fx.channels.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "7.0.0.0.0.0");
        let output: ForwardOutput = serde_json::from_str(&pushed[0].1).unwrap();
        assert_eq!(
            output,
            ForwardOutput {
                from: sender.address.clone(),
                to: "7.0.0.0.0.0".into(),
                data: "offer".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_forward_from_other_address_is_rejected_without_push() {
        let fx = fixture();
        let sender = fx.relay.connect("1.2.3.4:9").await.unwrap();

        let body = forward_body(&sender.identity, "7.0.0.0.0.0", "offer");
        let err = fx.relay.forward(&body, "5.6.7.8:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ForwardIdentityVerificationError);
        assert!(fx.channels.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_failure_codes_follow_pipeline_order() {
        let fx = fixture();

        let err = fx.relay.forward(b"{not json", "1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ForwardDeserializeError);

        let body = forward_body("", "7.0.0.0.0.0", "x");
        let err = fx.relay.forward(&body, "1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ForwardDecryptionError);

        let not_identity = fx.codec.encrypt(b"[1, 2, 3]").await.unwrap();
        let body = forward_body(&not_identity, "7.0.0.0.0.0", "x");
        let err = fx.relay.forward(&body, "1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ForwardDeserializeIdentityError);

        assert!(fx.channels.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_failure_still_reports_ok() {
        let fx = fixture_with(
            MemoryStore::new(),
            RecordingChannels {
                fail_push: true,
                ..Default::default()
            },
        );
        let sender = fx.relay.connect("1.2.3.4:9").await.unwrap();
        let body = forward_body(&sender.identity, "9.0.0.0.0.0", "x");
        assert!(fx.relay.forward(&body, "1.2.3.4:9").await.unwrap().ok);
    }

    #[tokio::test]
    async fn test_connect_failure_codes() {
        let channels: Arc<dyn ChannelService> = Arc::new(RecordingChannels::default());
        let metrics = Arc::new(HubMetrics::new().unwrap());
        let codec: Arc<dyn TokenCodec> = Arc::new(AesCfbCodec::new(Arc::new(KeyProvider::with_key(
            Arc::new(MemoryStore::new()),
            SecretKey::from_bytes([1u8; 32]),
        ))));

        let relay = Relay::new(Arc::new(BrokenAllocator), codec, channels.clone(), metrics.clone());
        let err = relay.connect("1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectAddressAllocationError);

        let fx = fixture_with(
            MemoryStore::new(),
            RecordingChannels {
                fail_create: true,
                ..Default::default()
            },
        );
        let err = fx.relay.connect("1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectChannelInitializeError);

        let relay = Relay::new(
            Arc::new(VirtualAddressAllocator::new(Arc::new(MemoryStore::new()))),
            Arc::new(BrokenCodec),
            channels,
            metrics,
        );
        let err = relay.connect("1.2.3.4:9").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectEncryptionError);
    }
}
