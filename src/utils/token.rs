use rand::{distributions::Alphanumeric, thread_rng, Rng};

pub const API_KEY_PREFIX: &str = "cek_";
pub const SECRET_PREFIX: &str = "whsec_";

/// Random alphanumeric credential with a recognisable prefix.
pub fn generate_credential(prefix: &str, length: usize) -> String {
    let body: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_prefixed_and_unique() {
        let a = generate_credential(API_KEY_PREFIX, 32);
        let b = generate_credential(API_KEY_PREFIX, 32);
        assert!(a.starts_with("cek_"));
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}
