// Wire protocol: auction payloads and the JSON frames exchanged with the
// auction server over the real-time channel.
//
// Every frame is a text message of the form `{"event": <name>, "data": ...}`.
// Incoming frames are validated here, at the boundary, into a closed set of
// typed events; anything that does not fit becomes a `ProtocolAnomaly` and
// never reaches the reconciler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifiers and auction payloads
// ---------------------------------------------------------------------------

/// Opaque auction identifier assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionId(String);

impl AuctionId {
    pub fn new(id: impl Into<String>) -> Self {
        AuctionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuctionId {
    fn from(s: &str) -> Self {
        AuctionId(s.to_string())
    }
}

impl From<String> for AuctionId {
    fn from(s: String) -> Self {
        AuctionId(s)
    }
}

/// One entry in an auction's recent-bid history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidEntry {
    pub bidder_name: String,
    pub bid_amount: u64,
    pub bid_time: DateTime<Utc>,
}

/// The client's view of one auction room.
///
/// This is also the shape of the `auctionSnapshot` payload and of the REST
/// `auction-state` response, so a snapshot deserializes straight into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionView {
    pub auction_id: AuctionId,
    pub product_name: String,
    #[serde(default)]
    pub description: String,
    pub starting_price: u64,
    pub current_highest_bid: u64,
    #[serde(default)]
    pub current_highest_bidder_name: Option<String>,
    #[serde(default)]
    pub total_bids: u64,
    /// Newest first, in arrival order.
    #[serde(default)]
    pub recent_bids: Vec<BidEntry>,
    pub bid_start_date: DateTime<Utc>,
    pub bid_end_date: DateTime<Utc>,
    pub is_active: bool,
}

/// Lifecycle status carried by an `auctionDelta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Active,
    Ended,
}

/// A new highest bid announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBid {
    pub current_highest_bid: u64,
    pub bidder_name: String,
    pub bid_time: DateTime<Utc>,
    /// Server-side bid counter, when the server includes it.
    pub total_bids: Option<u64>,
}

/// A validated incremental update for one auction.
///
/// At least one of `bid` and `status` is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionDelta {
    pub auction_id: AuctionId,
    pub bid: Option<NewBid>,
    pub status: Option<AuctionStatus>,
}

/// Raw `auctionDelta` payload before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaPayload {
    auction_id: AuctionId,
    #[serde(default)]
    current_highest_bid: Option<u64>,
    #[serde(default)]
    bidder_name: Option<String>,
    #[serde(default)]
    bid_time: Option<DateTime<Utc>>,
    #[serde(default)]
    total_bids: Option<u64>,
    #[serde(default)]
    status: Option<AuctionStatus>,
}

/// The bid echoed back in a `bidAccepted` event or a REST `place-bid` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedBid {
    pub auction_id: AuctionId,
    pub amount: u64,
    #[serde(default)]
    pub bidder_name: Option<String>,
    #[serde(default)]
    pub bid_time: Option<DateTime<Utc>>,
}

/// Confirmation that the server committed a bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidAcceptance {
    pub bid: AcceptedBid,
    pub current_highest_bid: u64,
}

/// Response of the REST `validate-bid` pre-flight call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidValidation {
    pub valid: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Signals the client sends over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientSignal {
    JoinAuction { auction_id: AuctionId },
    LeaveAuction { auction_id: AuctionId },
    PlaceBid { auction_id: AuctionId, amount: u64 },
}

impl ClientSignal {
    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> String {
        // Serializing these variants cannot fail: every field is a string or integer.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Events pushed by the server, after boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Snapshot(AuctionView),
    Delta(AuctionDelta),
    BidAccepted(BidAcceptance),
    BidRejected { reason: String },
    ProtocolError { message: String },
}

/// A frame that could not be turned into a [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    #[error("invalid `{event}` payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RejectionPayload {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Decode one incoming text frame.
///
/// `received_at` stamps new-bid deltas that do not carry their own `bidTime`.
pub fn decode_frame(text: &str, received_at: DateTime<Utc>) -> Result<ServerEvent, ProtocolAnomaly> {
    let frame: RawFrame =
        serde_json::from_str(text).map_err(|e| ProtocolAnomaly::Malformed(e.to_string()))?;

    match frame.event.as_str() {
        "auctionSnapshot" => {
            let view: AuctionView = payload(&frame.event, frame.data)?;
            if view.auction_id.is_empty() {
                return Err(invalid(&frame.event, "auctionId is empty"));
            }
            if view.bid_end_date < view.bid_start_date {
                return Err(invalid(&frame.event, "bidEndDate precedes bidStartDate"));
            }
            Ok(ServerEvent::Snapshot(view))
        }
        "auctionDelta" => {
            let raw: DeltaPayload = payload(&frame.event, frame.data)?;
            validate_delta(raw, received_at).map(ServerEvent::Delta)
        }
        "bidAccepted" => {
            let acceptance: BidAcceptance = payload(&frame.event, frame.data)?;
            Ok(ServerEvent::BidAccepted(acceptance))
        }
        "bidRejected" => {
            let raw: RejectionPayload = payload(&frame.event, frame.data)?;
            let reason = raw
                .reason
                .or(raw.message)
                .unwrap_or_else(|| "bid rejected".to_string());
            Ok(ServerEvent::BidRejected { reason })
        }
        "protocolError" | "error" => {
            let raw: ErrorPayload = payload(&frame.event, frame.data)?;
            Ok(ServerEvent::ProtocolError {
                message: raw.message,
            })
        }
        other => Err(ProtocolAnomaly::UnknownEvent(other.to_string())),
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolAnomaly> {
    serde_json::from_value(data).map_err(|e| invalid(event, &e.to_string()))
}

fn invalid(event: &str, reason: &str) -> ProtocolAnomaly {
    ProtocolAnomaly::InvalidPayload {
        event: event.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_delta(raw: DeltaPayload, received_at: DateTime<Utc>) -> Result<AuctionDelta, ProtocolAnomaly> {
    const EVENT: &str = "auctionDelta";

    if raw.auction_id.is_empty() {
        return Err(invalid(EVENT, "auctionId is empty"));
    }

    let bid = match (raw.current_highest_bid, raw.bidder_name) {
        (Some(amount), Some(name)) if !name.trim().is_empty() => Some(NewBid {
            current_highest_bid: amount,
            bidder_name: name,
            bid_time: raw.bid_time.unwrap_or(received_at),
            total_bids: raw.total_bids,
        }),
        (Some(_), _) => return Err(invalid(EVENT, "currentHighestBid without bidderName")),
        (None, Some(_)) => return Err(invalid(EVENT, "bidderName without currentHighestBid")),
        (None, None) => None,
    };

    if bid.is_none() && raw.status.is_none() {
        return Err(invalid(EVENT, "delta carries neither a bid nor a status"));
    }

    Ok(AuctionDelta {
        auction_id: raw.auction_id,
        bid,
        status: raw.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn client_signals_encode_as_event_frames() {
        let join = ClientSignal::JoinAuction {
            auction_id: "a-1".into(),
        };
        let v: Value = serde_json::from_str(&join.to_frame()).unwrap();
        assert_eq!(v["event"], "joinAuction");
        assert_eq!(v["data"]["auctionId"], "a-1");

        let bid = ClientSignal::PlaceBid {
            auction_id: "a-1".into(),
            amount: 95_000,
        };
        let v: Value = serde_json::from_str(&bid.to_frame()).unwrap();
        assert_eq!(v["event"], "placeBid");
        assert_eq!(v["data"]["amount"], 95_000);
    }

    #[test]
    fn snapshot_frame_decodes_into_view() {
        let text = r#"{
            "event": "auctionSnapshot",
            "data": {
                "auctionId": "a-1",
                "productName": "Basmati rice, 20 quintal",
                "description": "Grade A",
                "startingPrice": 50000,
                "currentHighestBid": 90000,
                "currentHighestBidderName": "Ravi",
                "totalBids": 7,
                "recentBids": [
                    {"bidderName": "Ravi", "bidAmount": 90000, "bidTime": "2026-03-01T11:59:00Z"}
                ],
                "bidStartDate": "2026-03-01T08:00:00Z",
                "bidEndDate": "2026-03-02T08:00:00Z",
                "isActive": true
            }
        }"#;

        match decode_frame(text, received()).unwrap() {
            ServerEvent::Snapshot(view) => {
                assert_eq!(view.auction_id.as_str(), "a-1");
                assert_eq!(view.current_highest_bid, 90_000);
                assert_eq!(view.recent_bids.len(), 1);
                assert!(view.is_active);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn bid_delta_without_time_is_stamped_on_arrival() {
        let text = r#"{"event":"auctionDelta","data":{"auctionId":"a-1","currentHighestBid":95000,"bidderName":"X"}}"#;
        match decode_frame(text, received()).unwrap() {
            ServerEvent::Delta(delta) => {
                let bid = delta.bid.unwrap();
                assert_eq!(bid.current_highest_bid, 95_000);
                assert_eq!(bid.bidder_name, "X");
                assert_eq!(bid.bid_time, received());
                assert!(delta.status.is_none());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn status_only_delta_is_valid() {
        let text = r#"{"event":"auctionDelta","data":{"auctionId":"a-1","status":"ended"}}"#;
        match decode_frame(text, received()).unwrap() {
            ServerEvent::Delta(delta) => {
                assert!(delta.bid.is_none());
                assert_eq!(delta.status, Some(AuctionStatus::Ended));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn bid_delta_without_bidder_is_an_anomaly() {
        let text = r#"{"event":"auctionDelta","data":{"auctionId":"a-1","currentHighestBid":95000}}"#;
        assert!(matches!(
            decode_frame(text, received()),
            Err(ProtocolAnomaly::InvalidPayload { .. })
        ));
    }

    #[test]
    fn empty_delta_is_an_anomaly() {
        let text = r#"{"event":"auctionDelta","data":{"auctionId":"a-1"}}"#;
        assert!(decode_frame(text, received()).is_err());
    }

    #[test]
    fn snapshot_with_inverted_dates_is_rejected() {
        let text = r#"{"event":"auctionSnapshot","data":{
            "auctionId":"a-1","productName":"Wheat","startingPrice":1,"currentHighestBid":1,
            "bidStartDate":"2026-03-02T00:00:00Z","bidEndDate":"2026-03-01T00:00:00Z","isActive":true}}"#;
        assert!(decode_frame(text, received()).is_err());
    }

    #[test]
    fn garbage_and_unknown_events_are_anomalies() {
        assert!(matches!(
            decode_frame("not json", received()),
            Err(ProtocolAnomaly::Malformed(_))
        ));
        assert_eq!(
            decode_frame(r#"{"event":"chatMessage","data":{}}"#, received()),
            Err(ProtocolAnomaly::UnknownEvent("chatMessage".into()))
        );
    }

    #[test]
    fn bid_rejected_falls_back_to_message_field() {
        let text = r#"{"event":"bidRejected","data":{"message":"Bid too low"}}"#;
        assert_eq!(
            decode_frame(text, received()).unwrap(),
            ServerEvent::BidRejected {
                reason: "Bid too low".into()
            }
        );
    }

    #[test]
    fn bid_accepted_decodes() {
        let text = r#"{"event":"bidAccepted","data":{"bid":{"auctionId":"a-1","amount":96000},"currentHighestBid":96000}}"#;
        match decode_frame(text, received()).unwrap() {
            ServerEvent::BidAccepted(acc) => {
                assert_eq!(acc.bid.amount, 96_000);
                assert_eq!(acc.current_highest_bid, 96_000);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }
}
