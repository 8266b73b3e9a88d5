// Client-side core of the auction marketplace: wire protocol, auction state
// reconciliation, room membership, bid submission, the countdown clock and
// the transports that talk to the auction server.

pub mod countdown;
pub mod membership;
pub mod protocol;
pub mod reconciler;
pub mod submission;
pub mod transport;
