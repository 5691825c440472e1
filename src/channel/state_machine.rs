use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelState};

/// The endpoint specific steps of the lifecycle. They are called with the transition lock held,
///  so no two of them ever run concurrently for the same endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelHooks: Send + Sync + 'static {
    /// establish connectivity
    async fn on_opening(&self) -> anyhow::Result<()>;

    async fn on_registering(&self) -> anyhow::Result<()>;

    async fn on_unregistering(&self) -> anyhow::Result<()>;

    /// local teardown; runs on every path that ends in [ChannelState::Closed]
    async fn on_closing(&self);
}

/// The lifecycle shared by clients and servers:
///
/// ```ascii
/// Closed -> Opening -> Registering -> Open
/// Open -> Unregistering -> Closing -> Closed
/// Open -> Restarting -> (close) -> (open, retried)
/// ```
///
/// A failure while opening or registering goes through `Unregistering` straight to `Closed`.
pub struct ChannelStateMachine<H: ChannelHooks> {
    name: String,
    hooks: H,
    state: watch::Sender<ChannelState>,
    transition: Mutex<()>,
}

impl <H: ChannelHooks> ChannelStateMachine<H> {
    pub fn new(name: &str, hooks: H) -> ChannelStateMachine<H> {
        let (state, _) = watch::channel(ChannelState::Closed);
        ChannelStateMachine {
            name: name.to_string(),
            hooks,
            state,
            transition: Mutex::new(()),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&self, new_state: ChannelState) {
        let old_state = self.state.send_replace(new_state);
        debug!("{}: {:?} -> {:?}", self.name, old_state, new_state);
    }

    /// Runs `f` while holding the transition lock, so the channel stays closed until `f` is
    ///  done. Fails without running `f` if the channel is not closed.
    pub async fn while_closed<T>(&self, f: impl Future<Output = T>) -> Result<T, ChannelError> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if state != ChannelState::Closed {
            return Err(ChannelError::AlreadyOpen(state));
        }
        Ok(f.await)
    }

    /// Opening a channel that is not closed is rejected, it is not queued.
    pub async fn open(&self) -> Result<(), ChannelError> {
        let state = self.state();
        if state != ChannelState::Closed {
            return Err(ChannelError::AlreadyOpen(state));
        }

        let _guard = self.transition.lock().await;
        // another transition may have completed while we waited for the lock
        let state = self.state();
        if state != ChannelState::Closed {
            return Err(ChannelError::AlreadyOpen(state));
        }
        self.do_open().await
    }

    async fn do_open(&self) -> Result<(), ChannelError> {
        self.set_state(ChannelState::Opening);
        if let Err(e) = self.hooks.on_opening().await {
            warn!("{}: error opening: {:#}", self.name, e);
            self.abort_open().await;
            return Err(ChannelError::Connection(e));
        }

        self.set_state(ChannelState::Registering);
        if let Err(e) = self.hooks.on_registering().await {
            warn!("{}: error registering: {:#}", self.name, e);
            self.abort_open().await;
            return Err(ChannelError::Registration(e));
        }

        self.set_state(ChannelState::Open);
        info!("{}: open", self.name);
        Ok(())
    }

    async fn abort_open(&self) {
        self.set_state(ChannelState::Unregistering);
        self.hooks.on_closing().await;
        self.set_state(ChannelState::Closed);
    }

    /// Always ends in [ChannelState::Closed]. Unregistration failures are logged and do not
    ///  prevent local teardown. Closing a closed channel does nothing.
    pub async fn close(&self) {
        let _guard = self.transition.lock().await;
        self.do_close().await;
    }

    async fn do_close(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }

        self.set_state(ChannelState::Unregistering);
        if let Err(e) = self.hooks.on_unregistering().await {
            warn!("{}: error unregistering, closing anyway: {:#}", self.name, e);
        }

        self.set_state(ChannelState::Closing);
        self.hooks.on_closing().await;
        self.set_state(ChannelState::Closed);
        info!("{}: closed", self.name);
    }

    /// Closes the channel (if necessary) and tries to open it again, up to `retry_count` times
    ///  but at least once, waiting `retry_duration` between attempts. Returns the last error if
    ///  no attempt succeeds.
    pub async fn restart(&self, retry_count: u32, retry_duration: Duration) -> Result<(), ChannelError> {
        let _guard = self.transition.lock().await;

        let previous = self.state();
        self.set_state(ChannelState::Restarting);
        if previous != ChannelState::Closed {
            self.do_close().await;
        }
        else {
            self.set_state(ChannelState::Closed);
        }

        let attempts = retry_count.max(1);
        let mut attempt = 1;
        loop {
            match self.do_open().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    warn!("{}: giving up restarting after {} attempt(s)", self.name, attempts);
                    return Err(e);
                }
                Err(e) => {
                    debug!("{}: restart attempt {} of {} failed: {}", self.name, attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(retry_duration).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use anyhow::anyhow;
    use mockall::Sequence;
    use super::*;

    fn expect_open(hooks: &mut MockChannelHooks, seq: &mut Sequence) {
        hooks.expect_on_opening().times(1).in_sequence(seq).returning(|| Ok(()));
        hooks.expect_on_registering().times(1).in_sequence(seq).returning(|| Ok(()));
    }

    fn expect_close(hooks: &mut MockChannelHooks, seq: &mut Sequence) {
        hooks.expect_on_unregistering().times(1).in_sequence(seq).returning(|| Ok(()));
        hooks.expect_on_closing().times(1).in_sequence(seq).returning(|| ());
    }

    #[tokio::test]
    async fn test_open_close() {
        let mut seq = Sequence::new();
        let mut hooks = MockChannelHooks::new();
        expect_open(&mut hooks, &mut seq);
        expect_close(&mut hooks, &mut seq);

        let channel = ChannelStateMachine::new("test", hooks);
        let mut states = channel.subscribe_state();
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.open().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ChannelState::Open);

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_while_closed() {
        let mut seq = Sequence::new();
        let mut hooks = MockChannelHooks::new();
        expect_open(&mut hooks, &mut seq);
        expect_close(&mut hooks, &mut seq);

        let channel = ChannelStateMachine::new("test", hooks);
        assert_eq!(channel.while_closed(async { 7 }).await.unwrap(), 7);

        channel.open().await.unwrap();
        match channel.while_closed(async { 8 }).await {
            Err(ChannelError::AlreadyOpen(ChannelState::Open)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        channel.close().await;
        assert_eq!(channel.while_closed(async { 9 }).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let mut seq = Sequence::new();
        let mut hooks = MockChannelHooks::new();
        expect_open(&mut hooks, &mut seq);

        let channel = ChannelStateMachine::new("test", hooks);
        channel.open().await.unwrap();
        match channel.open().await {
            Err(ChannelError::AlreadyOpen(ChannelState::Open)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opening_failure() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_opening().times(1).returning(|| Err(anyhow!("no server")));
        hooks.expect_on_registering().never();
        hooks.expect_on_unregistering().never();
        hooks.expect_on_closing().times(1).returning(|| ());

        let channel = ChannelStateMachine::new("test", hooks);
        assert!(matches!(channel.open().await, Err(ChannelError::Connection(_))));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_registering_failure() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_opening().times(1).returning(|| Ok(()));
        hooks.expect_on_registering().times(1).returning(|| Err(anyhow!("rejected")));
        hooks.expect_on_unregistering().never();
        hooks.expect_on_closing().times(1).returning(|| ());

        let channel = ChannelStateMachine::new("test", hooks);
        assert!(matches!(channel.open().await, Err(ChannelError::Registration(_))));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_close_when_unregister_fails() {
        let mut seq = Sequence::new();
        let mut hooks = MockChannelHooks::new();
        expect_open(&mut hooks, &mut seq);
        hooks.expect_on_unregistering().times(1).in_sequence(&mut seq).returning(|| Err(anyhow!("server gone")));
        hooks.expect_on_closing().times(1).in_sequence(&mut seq).returning(|| ());

        let channel = ChannelStateMachine::new("test", hooks);
        channel.open().await.unwrap();
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_close_when_closed_is_noop() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_unregistering().never();
        hooks.expect_on_closing().never();

        let channel = ChannelStateMachine::new("test", hooks);
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_retries_until_success() {
        let mut seq = Sequence::new();
        let mut hooks = MockChannelHooks::new();
        expect_open(&mut hooks, &mut seq);
        expect_close(&mut hooks, &mut seq);
        for _ in 0..2 {
            hooks.expect_on_opening().times(1).in_sequence(&mut seq).returning(|| Err(anyhow!("down")));
            hooks.expect_on_closing().times(1).in_sequence(&mut seq).returning(|| ());
        }
        expect_open(&mut hooks, &mut seq);

        let channel = ChannelStateMachine::new("test", hooks);
        channel.open().await.unwrap();

        let start = tokio::time::Instant::now();
        channel.restart(5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_gives_up() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_opening().times(3).returning(|| Err(anyhow!("down")));
        hooks.expect_on_closing().times(3).returning(|| ());

        let channel = ChannelStateMachine::new("test", hooks);
        assert!(matches!(channel.restart(3, Duration::from_millis(100)).await, Err(ChannelError::Connection(_))));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_restart_zero_retries_tries_once() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_opening().times(1).returning(|| Err(anyhow!("down")));
        hooks.expect_on_closing().times(1).returning(|| ());

        let channel = ChannelStateMachine::new("test", hooks);
        assert!(channel.restart(0, Duration::from_secs(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_open_rejected() {
        let mut hooks = MockChannelHooks::new();
        hooks.expect_on_opening().times(1).returning(|| Ok(()));
        hooks.expect_on_registering().times(1).returning(|| Ok(()));

        let channel = Arc::new(ChannelStateMachine::new("test", hooks));
        let a = tokio::spawn({
            let channel = channel.clone();
            async move { channel.open().await }
        });
        let b = tokio::spawn({
            let channel = channel.clone();
            async move { channel.open().await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(channel.state(), ChannelState::Open);
    }
}
