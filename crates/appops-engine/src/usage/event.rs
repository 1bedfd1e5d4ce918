//! In-flight usage events and their recycling pool

use appops_core::{
    AttributionFlags, ChainId, ClientToken, Identity, OpFlags, Timestamp, UidState,
};

/// Parameters of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParams {
    /// Client token of the usage
    pub token: ClientToken,
    /// Proxy performing the start
    pub proxy: Option<Identity>,
    /// Uid state at start time
    pub uid_state: UidState,
    /// Proxy flags of the start
    pub flags: OpFlags,
    /// Chain role of the usage
    pub attribution_flags: AttributionFlags,
    /// Chain the usage belongs to
    pub chain_id: Option<ChainId>,
}

/// One started-but-unfinished usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgressEvent {
    /// Client token
    pub token: ClientToken,
    /// Wall-clock start time
    pub start_ms: u64,
    /// Monotonic start time; orders events within a chain
    pub start_elapsed_ms: u64,
    /// Monotonic time the current running stretch began
    pub resumed_elapsed_ms: u64,
    /// Running time accumulated before the current stretch
    pub accumulated_ms: u64,
    /// Whether the event has ever been running
    pub ever_ran: bool,
    /// Unmatched starts
    pub nesting: u32,
    /// Uid state at start
    pub uid_state: UidState,
    /// Proxy flags at start
    pub flags: OpFlags,
    /// Proxy performing the usage
    pub proxy: Option<Identity>,
    /// Chain role
    pub attribution_flags: AttributionFlags,
    /// Chain id
    pub chain_id: Option<ChainId>,
}

impl InProgressEvent {
    /// Running time up to `now_elapsed_ms`, excluding paused stretches
    pub fn running_duration(&self, now_elapsed_ms: u64) -> u64 {
        self.accumulated_ms + now_elapsed_ms.saturating_sub(self.resumed_elapsed_ms)
    }
}

/// Bounded free list of event objects
///
/// Finished events are parked here and reinitialised on the next start.
#[derive(Debug)]
pub struct EventPool {
    free: Vec<InProgressEvent>,
    capacity: usize,
}

impl EventPool {
    /// Pool retaining at most `capacity` idle events
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Produce a fresh event, reusing a parked one when available
    pub fn acquire(&mut self, params: StartParams, now: Timestamp, running: bool) -> InProgressEvent {
        let Some(mut event) = self.free.pop() else {
            return InProgressEvent {
                token: params.token,
                start_ms: now.wall_ms,
                start_elapsed_ms: now.elapsed_ms,
                resumed_elapsed_ms: now.elapsed_ms,
                accumulated_ms: 0,
                ever_ran: running,
                nesting: 1,
                uid_state: params.uid_state,
                flags: params.flags,
                proxy: params.proxy,
                attribution_flags: params.attribution_flags,
                chain_id: params.chain_id,
            };
        };
        event.token = params.token;
        event.start_ms = now.wall_ms;
        event.start_elapsed_ms = now.elapsed_ms;
        event.resumed_elapsed_ms = now.elapsed_ms;
        event.accumulated_ms = 0;
        event.ever_ran = running;
        event.nesting = 1;
        event.uid_state = params.uid_state;
        event.flags = params.flags;
        event.proxy = params.proxy;
        event.attribution_flags = params.attribution_flags;
        event.chain_id = params.chain_id;
        event
    }

    /// Park a finished event
    pub fn release(&mut self, event: InProgressEvent) {
        if self.free.len() < self.capacity {
            self.free.push(event);
        }
    }

    /// Parked events
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: u64) -> StartParams {
        StartParams {
            token: ClientToken(token),
            proxy: None,
            uid_state: UidState::Top,
            flags: OpFlags::SELF,
            attribution_flags: AttributionFlags::empty(),
            chain_id: None,
        }
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut pool = EventPool::new(1);
        let now = Timestamp::default();
        let a = pool.acquire(params(1), now, true);
        let b = pool.acquire(params(2), now, true);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_reused_event_is_reinitialised() {
        let mut pool = EventPool::new(2);
        let mut old = pool.acquire(params(1), Timestamp::default(), true);
        old.nesting = 7;
        old.accumulated_ms = 99;
        old.chain_id = Some(ChainId(4));
        pool.release(old);

        let now = Timestamp {
            wall_ms: 500,
            elapsed_ms: 50,
        };
        let event = pool.acquire(params(2), now, false);
        assert_eq!(event.token, ClientToken(2));
        assert_eq!(event.nesting, 1);
        assert_eq!(event.accumulated_ms, 0);
        assert_eq!(event.start_ms, 500);
        assert_eq!(event.resumed_elapsed_ms, 50);
        assert_eq!(event.chain_id, None);
        assert!(!event.ever_ran);
        assert_eq!(pool.idle(), 0, "the parked event was taken");
    }
}
