use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub const DEFAULT_WORKER_PREFIX: &str = "worker-";

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a container name of the form `<prefix><unix millis>-<base36>`.
///
/// The millisecond prefix keeps names roughly creation-ordered; the random
/// suffix separates workers created within the same millisecond.
pub fn runtime_worker_name(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();

    format!("{prefix}{millis}-{suffix}")
}

/// Container names reported by the engine carry a leading `/`.
pub fn normalize_container_name(raw: &str) -> &str {
    raw.strip_prefix('/').unwrap_or(raw)
}
