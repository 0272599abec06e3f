//! One-time setup codes.
//!
//! A setup code authorizes exactly one auto-registration. Codes are short
//! (the user may have to read them over the phone), so only a salted hash
//! is kept in memory, and they expire after a few minutes. After being
//! used, a code stays recognizable for a short grace window so the script's
//! follow-up validation calls keep succeeding.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{LazyLock, Once, RwLock};
use std::time::Duration;

use anyhow::Error;

use pulse_api_types::NodeType;

/// Lifetime of a freshly minted code.
pub const SETUP_CODE_TTL: i64 = 5 * 60;

/// Extra window in which an unused but expired code still validates.
const VALIDATION_GRACE: i64 = 2 * 60;

/// Window in which a used code keeps validating.
const USED_GRACE: i64 = 5 * 60;

/// How often the sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Characters a code is built from; `I`, `O`, `0` and `1` are left out as
/// too easy to confuse.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// State tracked per minted code.
#[derive(Clone, Debug)]
pub struct SetupCodeEntry {
    pub expires_at: i64,
    pub used: bool,
    pub node_type: NodeType,
    pub host: String,
    pub org_id: String,
}

/// In-memory store of all live setup codes, keyed by salted hash.
pub struct SetupCodeStore {
    salt: [u8; 16],
    codes: RwLock<HashMap<String, SetupCodeEntry>>,
    recent: RwLock<HashMap<String, i64>>,
}

static STORE: LazyLock<SetupCodeStore> = LazyLock::new(|| SetupCodeStore::new());
static SWEEPER_STARTED: Once = Once::new();

impl SetupCodeStore {
    fn new() -> Self {
        let mut salt = [0u8; 16];
        // failing to gather randomness is not recoverable
        openssl::rand::rand_bytes(&mut salt).expect("unable to seed setup code salt");
        Self {
            salt,
            codes: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// The process wide store.
    pub fn get() -> &'static Self {
        &STORE
    }

    fn hash(&self, code: &str) -> String {
        let mut data = Vec::with_capacity(self.salt.len() + code.len());
        data.extend_from_slice(&self.salt);
        data.extend_from_slice(code.as_bytes());
        hex::encode(openssl::sha::sha256(&data))
    }

    /// Generate a fresh code and remember its hash.
    pub fn mint(&self, node_type: NodeType, host: String, org_id: String) -> Result<String, Error> {
        let code = generate_setup_code()?;
        let entry = SetupCodeEntry {
            expires_at: proxmox_time::epoch_i64() + SETUP_CODE_TTL,
            used: false,
            node_type,
            host,
            org_id,
        };
        self.codes.write().unwrap().insert(self.hash(&code), entry);
        Ok(code)
    }

    /// Try to consume `code` for an auto-registration of `node_type`.
    ///
    /// On success the code flips to used exactly once and enters the grace
    /// map. The host is deliberately not compared, the host the UI showed
    /// may differ from the one the script ran on.
    pub fn consume(&self, code: &str, node_type: NodeType) -> Option<SetupCodeEntry> {
        let hash = self.hash(code);
        let now = proxmox_time::epoch_i64();

        let mut codes = self.codes.write().unwrap();
        let entry = codes.get_mut(&hash)?;
        if entry.used || entry.node_type != node_type || now > entry.expires_at {
            return None;
        }
        entry.used = true;
        let entry = entry.clone();
        drop(codes);

        let grace = (now + USED_GRACE).max(entry.expires_at);
        self.recent.write().unwrap().insert(hash, grace);

        Some(entry)
    }

    /// Whether `code` would still be accepted by a validation call.
    ///
    /// True for unused codes within their expiry (plus a small grace), and
    /// for used codes still inside the post-use window.
    pub fn validate(&self, code: &str) -> bool {
        let hash = self.hash(code);
        let now = proxmox_time::epoch_i64();

        if let Some(entry) = self.codes.read().unwrap().get(&hash) {
            if !entry.used && now <= entry.expires_at + VALIDATION_GRACE {
                return true;
            }
        }

        match self.recent.read().unwrap().get(&hash) {
            Some(grace) => now <= *grace,
            None => false,
        }
    }

    /// Drop used and expired entries from both maps.
    pub fn sweep(&self) {
        let now = proxmox_time::epoch_i64();

        self.codes
            .write()
            .unwrap()
            .retain(|_, entry| !entry.used && now <= entry.expires_at + VALIDATION_GRACE);

        self.recent.write().unwrap().retain(|_, grace| now <= *grace);
    }

    #[cfg(test)]
    fn expire(&self, code: &str, expires_at: i64) {
        let hash = self.hash(code);
        if let Some(entry) = self.codes.write().unwrap().get_mut(&hash) {
            entry.expires_at = expires_at;
        }
    }
}

/// Generate a 6 character setup code from the unambiguous alphabet.
pub fn generate_setup_code() -> Result<String, Error> {
    let mut raw = [0u8; 6];
    openssl::rand::rand_bytes(&mut raw)?;

    // the 32 character alphabet divides 256 evenly, no modulo bias
    Ok(raw
        .iter()
        .map(|byte| CODE_ALPHABET[*byte as usize % CODE_ALPHABET.len()] as char)
        .collect())
}

/// Start the periodic sweeper, once.
pub fn start_sweeper() {
    SWEEPER_STARTED.call_once(|| {
        tokio::spawn(async move {
            let sweeper = pin!(async {
                loop {
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    SetupCodeStore::get().sweep();
                }
            });
            let abort_future = pin!(proxmox_daemon::shutdown_future());
            futures::future::select(sweeper, abort_future).await;
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_use_safe_alphabet() {
        for _ in 0..32 {
            let code = generate_setup_code().unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "{code}");
            assert!(!code.contains(['I', 'O', '0', '1']));
        }
    }

    #[test]
    fn codes_are_single_use_with_grace() {
        let store = SetupCodeStore::new();
        let code = store
            .mint(NodeType::Pve, "10.1.1.5".into(), "default".into())
            .unwrap();

        assert!(store.validate(&code));

        let entry = store.consume(&code, NodeType::Pve).expect("fresh code");
        assert_eq!(entry.host, "10.1.1.5");

        // a second consume is a replay
        assert!(store.consume(&code, NodeType::Pve).is_none());

        // but validation stays true within the grace window
        assert!(store.validate(&code));
    }

    #[test]
    fn consume_checks_node_type() {
        let store = SetupCodeStore::new();
        let code = store
            .mint(NodeType::Pbs, "10.1.1.10".into(), "default".into())
            .unwrap();

        assert!(store.consume(&code, NodeType::Pve).is_none());
        assert!(store.consume(&code, NodeType::Pbs).is_some());
    }

    #[test]
    fn expired_codes_fail_consume_but_keep_short_validation_grace() {
        let store = SetupCodeStore::new();
        let code = store
            .mint(NodeType::Pve, "10.1.1.5".into(), "default".into())
            .unwrap();

        let now = proxmox_time::epoch_i64();
        store.expire(&code, now - 60);
        assert!(store.consume(&code, NodeType::Pve).is_none());
        // expired one minute ago, still within the two minute grace
        assert!(store.validate(&code));

        store.expire(&code, now - 3 * 60);
        assert!(!store.validate(&code));
    }

    #[test]
    fn sweep_removes_used_and_expired() {
        let store = SetupCodeStore::new();
        let used = store
            .mint(NodeType::Pve, "10.1.1.5".into(), "default".into())
            .unwrap();
        let expired = store
            .mint(NodeType::Pve, "10.1.1.6".into(), "default".into())
            .unwrap();
        store.consume(&used, NodeType::Pve).unwrap();
        store.expire(&expired, proxmox_time::epoch_i64() - 10 * 60);

        store.sweep();

        assert_eq!(store.codes.read().unwrap().len(), 0);
        // the used code's grace entry survives until its window passes
        assert!(store.validate(&used));
        assert!(!store.validate(&expired));
    }

    #[test]
    fn unknown_codes_never_validate() {
        let store = SetupCodeStore::new();
        assert!(!store.validate("ABCDEF"));
        assert!(store.consume("ABCDEF", NodeType::Pve).is_none());
    }
}
