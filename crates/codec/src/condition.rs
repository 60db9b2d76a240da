//! Hash-locked condition checks.
//!
//! A `Prepare` commits to a 32-byte SHA-256 image; the `Fulfill` that
//! unlocks it must carry the preimage.

use sha2::{Digest, Sha256};

/// The execution condition a fulfillment unlocks.
///
/// # Test
///
/// ```
/// use ilp_connector_codec::condition::*;
///
/// let fulfillment = [0u8; 32];
/// let condition = fulfillment_to_condition(&fulfillment);
///
/// assert!(condition_matches(&fulfillment, &condition));
/// assert!(!condition_matches(&[1u8; 32], &condition));
/// ```
pub fn fulfillment_to_condition(fulfillment: &[u8; 32]) -> [u8; 32] {
    Sha256::digest(fulfillment).into()
}

pub fn condition_matches(fulfillment: &[u8; 32], condition: &[u8; 32]) -> bool {
    fulfillment_to_condition(fulfillment) == *condition
}
