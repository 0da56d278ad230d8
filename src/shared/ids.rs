use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

pub fn generate_session_id(now: i64) -> Result<String, String> {
    let timestamp = u64::try_from(now)
        .map_err(|_| "session id requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate session id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % SESSION_SUFFIX_SPACE;
    let ts = base36_encode_u64(timestamp);
    let suffix = base36_encode_fixed_u32(sample, 4);
    Ok(format!("sess-{ts}-{suffix}"))
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        let idx = (value % 36) as usize;
        chars.push(BASE36_ALPHABET[idx] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_ids_are_valid_identifiers() {
        let id = generate_session_id(1_700_000_000).expect("session id");
        assert!(id.starts_with("sess-"));
        validate_identifier_value("session id", &id).expect("identifier-safe");
        assert_eq!(id.rsplit('-').next().map(str::len), Some(4));
    }

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(generate_session_id(-1).is_err());
    }

    #[test]
    fn identifier_validation_rejects_path_segments() {
        assert!(validate_identifier_value("phase id", "../escape").is_err());
        assert!(validate_identifier_value("phase id", "").is_err());
        assert!(validate_identifier_value("phase id", "phase_2").is_ok());
    }
}
