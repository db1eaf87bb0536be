use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{mpsc, watch};
use tokio_stream::{wrappers::WatchStream, Stream};
use tracing::debug;

/// Push channel to a virtual address.
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Opens a channel for `address` and returns the token a client uses to
    /// subscribe to it.
    async fn create_channel(&self, address: &str) -> Result<String, ChannelError>;

    /// Delivers `payload` to whoever holds the channel for `address`.
    async fn push(&self, address: &str, payload: String) -> Result<(), ChannelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to gather entropy: {0}")]
    Entropy(String),
    #[error("no channel for address {0}")]
    UnknownAddress(String),
    #[error("unknown channel token")]
    UnknownToken,
    #[error("channel already open")]
    AlreadyOpen,
    #[error("channel for {0} is full")]
    Full(String),
}

#[derive(Debug)]
struct Channel {
    token: String,
    sender: mpsc::Sender<String>,
    // Taken while a subscriber is attached.
    receiver: Option<mpsc::Receiver<String>>,
    last_activity: Instant,
}

impl Channel {
    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.receiver.is_some() && Instant::now().duration_since(self.last_activity) >= idle_timeout
    }
}

type ChannelMap = Arc<DashMap<String, Channel>>;

/// In-process channel service. Messages queue per address until a
/// subscriber drains them; a full queue drops new messages.
#[derive(Clone)]
pub struct LocalChannels {
    channels: ChannelMap,
    tokens: Arc<DashMap<String, String>>,
    buffer: usize,
}

impl LocalChannels {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            buffer,
        }
    }

    /// Attaches a subscriber to the channel behind `token`. The stream
    /// ends when `shutdown` turns true. Dropping the subscription releases
    /// the channel so it can be opened again.
    pub fn subscribe(
        &self,
        token: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Subscription, ChannelError> {
        let address = self
            .tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(ChannelError::UnknownToken)?;

        let mut channel = self
            .channels
            .get_mut(&address)
            .ok_or(ChannelError::UnknownToken)?;
        let receiver = channel.receiver.take().ok_or(ChannelError::AlreadyOpen)?;
        channel.last_activity = Instant::now();
        drop(channel);

        debug!("Channel for {} opened", address);
        Ok(Subscription {
            address,
            token: token.to_string(),
            receiver: Some(receiver),
            shutdown: WatchStream::new(shutdown),
            channels: Arc::clone(&self.channels),
        })
    }

    /// Removes channels that have had no subscriber for longer than
    /// `idle_timeout`. Returns how many were removed.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<(String, String)> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_idle(idle_timeout))
            .map(|entry| (entry.key().clone(), entry.value().token.clone()))
            .collect();

        for (address, token) in &idle {
            self.channels.remove(address);
            self.tokens.remove(token);
        }
        idle.len()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl ChannelService for LocalChannels {
    async fn create_channel(&self, address: &str) -> Result<String, ChannelError> {
        let mut raw = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|e| ChannelError::Entropy(e.to_string()))?;
        let token = hex::encode(raw);

        let (sender, receiver) = mpsc::channel(self.buffer);
        let channel = Channel {
            token: token.clone(),
            sender,
            receiver: Some(receiver),
            last_activity: Instant::now(),
        };

        if let Some(previous) = self.channels.insert(address.to_string(), channel) {
            self.tokens.remove(&previous.token);
        }
        self.tokens.insert(token.clone(), address.to_string());
        Ok(token)
    }

    async fn push(&self, address: &str, payload: String) -> Result<(), ChannelError> {
        let sender = self
            .channels
            .get(address)
            .map(|channel| channel.sender.clone())
            .ok_or_else(|| ChannelError::UnknownAddress(address.to_string()))?;

        // The receiver lives in the map while no one is subscribed, so the
        // sender cannot observe a closed channel here.
        sender
            .try_send(payload)
            .map_err(|_| ChannelError::Full(address.to_string()))
    }
}

/// Stream of messages pushed to one channel.
pub struct Subscription {
    address: String,
    token: String,
    receiver: Option<mpsc::Receiver<String>>,
    shutdown: WatchStream<bool>,
    channels: ChannelMap,
}

impl Subscription {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        while let Poll::Ready(state) = Pin::new(&mut self.shutdown).poll_next(cx) {
            match state {
                Some(false) => continue,
                _ => return Poll::Ready(None),
            }
        }

        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            if let Some(mut channel) = self.channels.get_mut(&self.address) {
                // The address may have been re-issued a new channel meanwhile.
                if channel.token == self.token {
                    channel.receiver = Some(receiver);
                    channel.last_activity = Instant::now();
                }
            }
        }
        debug!("Channel for {} closed", self.address);
    }
}
