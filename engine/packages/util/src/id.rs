use rand::Rng;

const NONCE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Short lowercase nonce used to synthesize node identities
/// (`provisioning-x7k2q9`, `cloud-m3f8a1`).
pub fn short_nonce() -> String {
	let mut rng = rand::thread_rng();
	(0..6)
		.map(|_| NONCE_ALPHABET[rng.gen_range(0..NONCE_ALPHABET.len())] as char)
		.collect()
}
