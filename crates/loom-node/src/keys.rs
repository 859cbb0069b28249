//! Persistent keys in the data directory.
//!
//! The peer key lives in `peer.key` as hex, the account seed in
//! `account.seed`. Both are generated on first start.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use loom_shared::constants::KDF_CONTEXT_DB_KEY;
use loom_shared::{Account, Identity};

const PEER_KEY_FILE: &str = "peer.key";
const ACCOUNT_SEED_FILE: &str = "account.seed";

pub fn load_or_create_identity(dir: &Path) -> anyhow::Result<Identity> {
    let path = dir.join(PEER_KEY_FILE);
    if path.exists() {
        let hex = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        return Identity::from_secret_hex(&hex).with_context(|| format!("parsing {}", path.display()));
    }

    let identity = Identity::generate();
    write_secret(&path, &hex::encode(identity.secret_bytes()))?;
    info!(peer = %identity.peer_id().short(), "generated peer key");
    Ok(identity)
}

pub fn load_or_create_account(dir: &Path) -> anyhow::Result<Account> {
    let path = dir.join(ACCOUNT_SEED_FILE);
    if path.exists() {
        let seed = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        return Account::from_seed(seed.trim()).with_context(|| format!("parsing {}", path.display()));
    }

    let account = Account::generate();
    write_secret(&path, &account.seed())?;
    info!(address = %account.address(), "generated account");
    Ok(account)
}

/// Database encryption key bound to the peer key.
pub fn database_key(identity: &Identity) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT_DB_KEY, identity.secret_bytes())
}

fn write_secret(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
