//! Per-channel subscription handle and state.

use std::sync::{Arc, Mutex};

use crate::client::{ClientShared, lock, reinstall};
use crate::protocol;
use crate::types::{ClientState, Error, PublishEvent, SubscriptionState};

pub(crate) type PublishCallback = Box<dyn FnMut(PublishEvent) + Send>;

/// State shared between subscription handles and the dispatch task.
pub(crate) struct SubscriptionShared {
    channel: String,
    state: Mutex<SubscriptionState>,
    on_publish: Mutex<Option<PublishCallback>>,
}

impl SubscriptionShared {
    pub(crate) fn new(channel: String) -> Self {
        Self {
            channel,
            state: Mutex::new(SubscriptionState::Unsubscribed),
            on_publish: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: SubscriptionState) {
        *lock(&self.state) = next;
    }

    fn begin_subscribing(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if *state != SubscriptionState::Unsubscribed {
            return Err(Error::AlreadySubscribed);
        }
        *state = SubscriptionState::Subscribing;
        Ok(())
    }

    /// Flip `Subscribing` to `Subscribed`; a concurrent reset wins.
    fn confirm_subscribed(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SubscriptionState::Subscribing {
            *state = SubscriptionState::Subscribed;
            true
        } else {
            false
        }
    }

    /// Reset to `Unsubscribed`, returning the state this left.
    fn take_active(&self) -> SubscriptionState {
        let mut state = lock(&self.state);
        std::mem::replace(&mut *state, SubscriptionState::Unsubscribed)
    }

    pub(crate) fn deliver(&self, event: PublishEvent) {
        // The slot stays unlocked while the callback runs; a handler that
        // re-registers from inside its own invocation wins.
        let callback = lock(&self.on_publish).take();
        match callback {
            Some(mut callback) => {
                callback(event);
                reinstall(&self.on_publish, callback);
            }
            None => {
                tracing::trace!(channel = %self.channel, "publication with no handler registered");
            }
        }
    }
}

/// Handle to one channel on one client. Cheap to clone; clones share the
/// channel state and publish callback.
#[derive(Clone)]
pub struct Subscription {
    client: Arc<ClientShared>,
    sub: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn new(client: Arc<ClientShared>, sub: Arc<SubscriptionShared>) -> Self {
        Self { client, sub }
    }

    pub fn channel(&self) -> &str {
        &self.sub.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.sub.state()
    }

    /// Called for each publication received while the channel is active.
    pub fn on_publish(&self, callback: impl FnMut(PublishEvent) + Send + 'static) {
        *lock(&self.sub.on_publish) = Some(Box::new(callback));
    }

    /// Ask the server to add this channel. On success publications start
    /// flowing to the callback; on refusal the subscription falls back to
    /// [`SubscriptionState::Unsubscribed`] and can be retried. An unsubscribe
    /// landing while the reply is in flight cancels the attempt with
    /// [`Error::Unsubscribed`].
    pub async fn subscribe(&self) -> Result<(), Error> {
        self.sub.begin_subscribing()?;
        let command = protocol::build_subscribe(&self.sub.channel);
        match self.client.request(command).await {
            Ok(reply) => {
                if let Some(err) = reply.error {
                    self.sub.set_state(SubscriptionState::Unsubscribed);
                    return Err(err.into());
                }
                if self.sub.confirm_subscribed() {
                    tracing::info!(channel = %self.sub.channel, "subscribed");
                    Ok(())
                } else if self.client.state() == ClientState::Connected {
                    // An unsubscribe, local call or server push, reset the
                    // state while the reply was in flight.
                    Err(Error::Unsubscribed)
                } else {
                    // The connection died between the reply and now.
                    Err(Error::NotConnected)
                }
            }
            Err(e) => {
                self.sub.set_state(SubscriptionState::Unsubscribed);
                Err(e)
            }
        }
    }

    /// Publish into the channel. Works regardless of subscription state; the
    /// server enforces its own permissions.
    pub async fn publish(&self, data: serde_json::Value) -> Result<(), Error> {
        let command = protocol::build_publish(&self.sub.channel, data);
        let reply = self.client.request(command).await?;
        if let Some(err) = reply.error {
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove this channel. Idempotent: already unsubscribed is a no-op, and
    /// a dead connection counts as unsubscribed.
    pub async fn unsubscribe(&self) -> Result<(), Error> {
        if self.sub.take_active() == SubscriptionState::Unsubscribed {
            return Ok(());
        }
        tracing::info!(channel = %self.sub.channel, "unsubscribing");
        let command = protocol::build_unsubscribe(&self.sub.channel);
        match self.client.request(command).await {
            Ok(reply) => {
                if let Some(err) = reply.error {
                    tracing::warn!(
                        channel = %self.sub.channel,
                        code = err.code,
                        message = %err.message,
                        "unsubscribe refused by server"
                    );
                }
                Ok(())
            }
            Err(Error::NotConnected | Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
