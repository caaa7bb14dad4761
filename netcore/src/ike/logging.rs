//! Structured events of the key exchange.
//!
//! State transitions of sessions and Child SAs are logged at `INFO`, messages at `DEBUG` and
//! dropped messages at `WARN`. SPIs are rendered in hex so they can be matched against packet
//! captures.
use tracing::{debug, info, warn};

use crate::wire::Ipv4Address;
use crate::wire::ike::Header;

use super::Error;

pub(crate) fn state_transition(spi_i: u64, spi_r: u64, from: &str, to: &str) {
    info!(
        ike_spi_i = %hex::encode(spi_i.to_be_bytes()),
        ike_spi_r = %hex::encode(spi_r.to_be_bytes()),
        state_from = from,
        state_to = to,
        "IKE SA state transition"
    );
}

pub(crate) fn child_established(remote: Ipv4Address, inbound: u32, outbound: u32) {
    info!(
        peer = %remote,
        spi_in = %hex::encode(inbound.to_be_bytes()),
        spi_out = %hex::encode(outbound.to_be_bytes()),
        "Child SA established"
    );
}

pub(crate) fn child_removed(remote: Ipv4Address, inbound: u32) {
    info!(
        peer = %remote,
        spi_in = %hex::encode(inbound.to_be_bytes()),
        "Child SA removed"
    );
}

pub(crate) fn session_removed(remote: Ipv4Address, spi_i: u64, reason: &str) {
    info!(
        peer = %remote,
        ike_spi_i = %hex::encode(spi_i.to_be_bytes()),
        reason = reason,
        "IKE SA removed"
    );
}

pub(crate) fn message(direction: &str, remote: Ipv4Address, header: &Header) {
    debug!(
        direction = direction,
        peer = %remote,
        exchange = ?header.exchange_type,
        message_id = header.message_id,
        response = header.flags.response(),
        "{}", header
    );
}

pub(crate) fn retransmit(remote: Ipv4Address, message_id: u32, attempt: u32) {
    debug!(
        peer = %remote,
        message_id = message_id,
        attempt = attempt,
        "retransmitting request"
    );
}

pub(crate) fn dropped(remote: Ipv4Address, err: &Error) {
    warn!(peer = %remote, error = %err, "dropped IKE message");
}

pub(crate) fn send_failed(remote: Ipv4Address, err: &Error) {
    warn!(peer = %remote, error = %err, "sending IKE message failed");
}

pub(crate) fn store_failed(remote: Ipv4Address, err: &Error) {
    warn!(peer = %remote, error = %err, "security association database update failed");
}
