//! Identifier generation and small SIP helpers shared by dialogs and usages

use rand::Rng;
use uuid::Uuid;

use sipdum_message::headers::BRANCH_MAGIC_COOKIE;
use sipdum_message::{CSeq, Method, Request};

/// Random 32-bit tag rendered as hex
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

/// RFC 3261 compliant branch parameter
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple())
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), host)
}

pub fn generate_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Refresh interval for a duration of `secs`: at least 5 s or 10 % early,
/// minus up to `max_jitter` random seconds
pub fn a_bit_smaller_than(secs: u32, max_jitter: u32) -> u32 {
    let tenth_early = (u64::from(secs) * 9 / 10) as u32;
    let base = secs.saturating_sub(5).min(tenth_early);
    if max_jitter == 0 || base == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter.min(base / 2));
    base - jitter
}

/// CANCEL for a sent INVITE: same Request-URI, top Via, Call-ID, From, To,
/// Route and CSeq number (RFC 3261 §9.1)
pub fn make_cancel(invite: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
    let h = &invite.headers;
    cancel.headers.via = h.via.iter().take(1).cloned().collect();
    cancel.headers.from = h.from.clone();
    cancel.headers.to = h.to.clone();
    cancel.headers.call_id = h.call_id.clone();
    cancel.headers.route = h.route.clone();
    cancel.headers.max_forwards = h.max_forwards;
    cancel.headers.cseq = h.cseq.as_ref().map(|c| CSeq::new(c.seq, Method::Cancel));
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identifiers() {
        assert_eq!(generate_tag().len(), 8);
        assert!(generate_branch().starts_with("z9hG4bK"));
        assert!(generate_call_id("atlanta.example.com").ends_with("@atlanta.example.com"));
        assert_ne!(generate_etag(), generate_etag());
    }

    #[test]
    fn test_refresh_interval() {
        assert_eq!(a_bit_smaller_than(3600, 0), 3240);
        assert_eq!(a_bit_smaller_than(30, 0), 25);
        assert_eq!(a_bit_smaller_than(3, 0), 0);
        assert_eq!(a_bit_smaller_than(u32::MAX, 0), 3_865_470_565);
        assert!(a_bit_smaller_than(u32::MAX, 30) <= 3_865_470_565);
        for _ in 0..50 {
            let v = a_bit_smaller_than(600, 5);
            assert!((535..=540).contains(&v));
        }
    }
}
