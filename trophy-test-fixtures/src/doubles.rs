//! In-memory collaborators: a scriptable minter and recording transports.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use trophy_issuance::{MintError, MintRequest, Minter};
use trophy_relay::{ChainId, Transport};

/// Minter that records every request and can be scripted to fail.
#[derive(Default)]
pub struct RecordingMinter {
    minted: Mutex<Vec<MintRequest>>,
    calls: Mutex<usize>,
    scripted: Mutex<VecDeque<MintError>>,
    always: Mutex<Option<MintError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingMinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `error`, then behave normally.
    pub fn fail_next(&self, error: MintError) {
        self.scripted.lock().unwrap().push_back(error);
    }

    /// Fail every call until [`RecordingMinter::recover`].
    pub fn fail_always(&self, error: MintError) {
        *self.always.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.always.lock().unwrap() = None;
        self.scripted.lock().unwrap().clear();
    }

    /// Sleep before answering, to exercise mint timeouts.
    pub fn stall_for(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Successful mints, in order.
    pub fn minted(&self) -> Vec<MintRequest> {
        self.minted.lock().unwrap().clone()
    }

    /// All mint calls, including failed ones.
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Minter for RecordingMinter {
    async fn mint(&self, request: &MintRequest) -> Result<String, MintError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.always.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(error) = self.scripted.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.minted.lock().unwrap().push(request.clone());
        Ok(format!(
            "0x{}-{}-{}-{call:04}",
            request.chain_id, request.user_id, request.milestone_id
        ))
    }
}

/// Transport that keeps every delivered message for later pumping.
///
/// Can be taken down to fail deliveries, as an unreachable relay would.
#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<(ChainId, Vec<u8>)>>,
    down: Mutex<bool>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all queued messages, oldest first.
    pub fn drain(&self) -> Vec<(ChainId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every delivery while `down` is set.
    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }
}

#[async_trait]
impl Transport for Outbox {
    async fn deliver(&self, destination: &ChainId, bytes: Vec<u8>) -> anyhow::Result<()> {
        if *self.down.lock().unwrap() {
            anyhow::bail!("relay to {destination} is down");
        }
        self.sent.lock().unwrap().push((destination.clone(), bytes));
        Ok(())
    }
}

/// Transport whose every delivery fails.
pub struct DownTransport;

#[async_trait]
impl Transport for DownTransport {
    async fn deliver(&self, destination: &ChainId, _bytes: Vec<u8>) -> anyhow::Result<()> {
        anyhow::bail!("relay to {destination} unavailable")
    }
}
