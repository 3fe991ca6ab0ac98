use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use clippa_core::ids::{MemberId, PartyId};
use clippa_core::protocol::{self, Frame, Payload};

use crate::error::PartyError;
use crate::hub::Hub;

/// One member's view of its hub: inbound dispatch and the outbound queue.
///
/// Call [`MemberHandle::leave`] when the connection ends. A handle dropped
/// without `leave` schedules the removal on the current runtime.
pub struct MemberHandle {
    hub: Arc<Hub>,
    member_id: MemberId,
    rx: mpsc::Receiver<Frame>,
    own_queue: mpsc::WeakSender<Frame>,
    evicted: CancellationToken,
    generation: u64,
    left: bool,
}

impl MemberHandle {
    pub(crate) fn new(
        hub: Arc<Hub>,
        member_id: MemberId,
        rx: mpsc::Receiver<Frame>,
        own_queue: mpsc::WeakSender<Frame>,
        evicted: CancellationToken,
        generation: u64,
    ) -> Self {
        Self {
            hub,
            member_id,
            rx,
            own_queue,
            evicted,
            generation,
            left: false,
        }
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn party_id(&self) -> &PartyId {
        self.hub.party_id()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Whether the hub has cut this member off.
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Validate an inbound frame, apply leader side effects, then relay the
    /// raw frame to the rest of the party.
    pub async fn handle_message(&self, raw: &str) -> Result<(), PartyError> {
        let kind = protocol::message_type(raw)?;
        let message = protocol::validate(kind, raw)?;

        let leader_result = match &message.payload {
            Payload::SetLeader(data) => Some(self.hub.set_leader(&data.address).await),
            Payload::Conclave(_) => Some(self.hub.reset_leader().await),
            _ => None,
        };
        if let Some(Err(e)) = leader_result {
            let err = PartyError::LeaderNotSet(e);
            warn!(
                party_id = %self.hub.party_id(),
                member_id = %self.member_id,
                message_type = %kind,
                error = %err,
                "leader change failed"
            );
            self.push_own(protocol::error_frame(err.code()));
        }

        self.hub.broadcast(&self.member_id, Frame::from(raw)).await;
        Ok(())
    }

    /// Queue a frame for this member only. Never waits: the caller is this
    /// queue's consumer.
    fn push_own(&self, frame: Frame) {
        let Some(tx) = self.own_queue.upgrade() else {
            return;
        };
        if tx.try_send(frame).is_err() {
            warn!(
                party_id = %self.hub.party_id(),
                member_id = %self.member_id,
                "outbound queue full, dropping diagnostic"
            );
        }
    }

    /// Next outbound frame. `None` once evicted or the queue is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            _ = self.evicted.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    #[cfg(test)]
    pub(crate) fn try_recv_for_test(&mut self) -> Option<Frame> {
        if self.evicted.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Remove this member from the hub, unless a newer join of the same id
    /// has taken over the entry.
    pub async fn leave(mut self) {
        self.left = true;
        self.hub.leave_slot(&self.member_id, self.generation).await;
    }
}

impl Drop for MemberHandle {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hub = Arc::clone(&self.hub);
        let member_id = self.member_id.clone();
        let generation = self.generation;
        debug!(member_id = %member_id, "handle dropped without leave");
        runtime.spawn(async move {
            hub.leave_slot(&member_id, generation).await;
        });
    }
}
