use chrono::{DateTime, Utc};
use uuid::Uuid;

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SUFFIX_LEN: usize = 4;

/// Merchant-facing order code: `yyMMdd` followed by four random characters
/// from `[0-9A-Z]`, e.g. `241019K3ZQ`.
pub fn generate_order_code(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4();
    let suffix: String = random
        .as_bytes()
        .iter()
        .take(SUFFIX_LEN)
        .map(|b| ALPHABET[usize::from(*b) % ALPHABET.len()] as char)
        .collect();

    format!("{}{}", now.format("%y%m%d"), suffix)
}
