//! Notifications for the UI layer

use swarmcast_core::ConnectionId;
use swarmcast_transport::PeerInfo;

use crate::{CloseReason, RelayPhase};

/// Something the presentation layer may want to react to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    PhaseChanged(RelayPhase),
    /// A connection joined; render output for it will carry `id`
    ConnectionCreated { id: ConnectionId, info: PeerInfo },
    /// A connection left; its render target can be torn down
    ConnectionRemoved {
        id: ConnectionId,
        reason: CloseReason,
    },
    PeerCountChanged(usize),
}
