use rand::Rng;

const CODE_LEN: usize = 6;
// Ambiguous characters (0/O, 1/I) are excluded so codes survive being read aloud.
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Quiz codes are compared uppercase everywhere; normalize at every entry point.
pub fn normalize_quiz_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn generate_quiz_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}
