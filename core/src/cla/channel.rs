// Channel lifecycle shared by transport implementations
//
// Opening -> Active -> Closed, where Closed is terminal. Transports embed a
// ChannelCore and delegate state, close and closed() to it.

use super::ChannelState;
use crate::eid::Eid;
use tokio::sync::watch;

#[derive(Debug)]
pub struct ChannelCore {
    eid: Eid,
    state: watch::Sender<ChannelState>,
}

impl ChannelCore {
    /// New channel in the `Opening` state
    pub fn new(eid: Eid) -> Self {
        let (state, _rx) = watch::channel(ChannelState::Opening);
        Self { eid, state }
    }

    pub fn eid(&self) -> &Eid {
        &self.eid
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Move from `Opening` to `Active`; false if the channel was not opening
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Opening {
                *state = ChannelState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Close the channel; true only for the call that actually closed it
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        })
    }

    /// Resolves once the state is `Closed`
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as self, so this cannot fail while borrowed
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn core() -> ChannelCore {
        ChannelCore::new(Eid::create("cla:stcp:peer:4556").unwrap())
    }

    #[test]
    fn test_lifecycle() {
        let core = core();
        assert_eq!(core.state(), ChannelState::Opening);
        assert!(core.activate());
        assert_eq!(core.state(), ChannelState::Active);
        assert!(!core.activate());
        assert!(core.close());
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let core = core();
        assert!(core.close());
        assert!(!core.close());
        assert!(!core.activate(), "closed channel cannot reopen");
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_closed_resolves() {
        let core = std::sync::Arc::new(core());
        core.activate();
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        core.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("timeout")
            .expect("join");
    }

    #[tokio::test]
    async fn test_closed_resolves_immediately_when_already_closed() {
        let core = core();
        core.close();
        tokio::time::timeout(Duration::from_millis(100), core.closed())
            .await
            .expect("already closed");
    }
}
