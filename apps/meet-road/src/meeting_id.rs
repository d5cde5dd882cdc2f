use rand::Rng;

pub const MEETING_ID_LEN: usize = 8;
pub const MEETING_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a new meeting token. Tokens are not reserved; a collision simply
/// puts two groups in the same room.
pub fn generate_meeting_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MEETING_ID_LEN)
        .map(|_| MEETING_ID_ALPHABET[rng.gen_range(0..MEETING_ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test_timeout::timeout]
    fn test_meeting_id_shape() {
        for _ in 0..1_000 {
            let id = generate_meeting_id();
            assert_eq!(id.len(), MEETING_ID_LEN);
            assert!(id.bytes().all(|b| MEETING_ID_ALPHABET.contains(&b)), "{id}");
        }
    }

    #[test_timeout::timeout]
    fn test_consecutive_ids_differ() {
        assert_ne!(generate_meeting_id(), generate_meeting_id());
    }

    #[test_timeout::timeout]
    fn test_birthday_bound() {
        // 36^8 ≈ 2.8e12; 10k draws collide with probability ≈ 1.8e-5.
        let ids: HashSet<String> = (0..10_000).map(|_| generate_meeting_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
