/// Hide the middle of a gateway charge id before it reaches the logs.
/// Ids shorter than 8 characters are hidden entirely.
pub fn mask_charge_id(charge_id: &str) -> String {
    let chars: Vec<char> = charge_id.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}
