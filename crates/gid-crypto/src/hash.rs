use sha2::{Digest, Sha256};

/// Prefix carried by every agent identifier.
pub const AGENT_ID_PREFIX: &str = "AGENT-";

/// Number of digest hex characters kept in an agent identifier.
pub const AGENT_ID_HEX_LEN: usize = 12;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Agent identity derivation: `AGENT-` + upper(hex(sha256(pubkey_bytes)))[..12].
pub fn derive_agent_id(pubkey_bytes: &[u8]) -> String {
    let digest = hex::encode_upper(sha256(pubkey_bytes));
    format!("{}{}", AGENT_ID_PREFIX, &digest[..AGENT_ID_HEX_LEN])
}

/// Cheap shape check for identifiers received off the wire.
pub fn is_well_formed_agent_id(id: &str) -> bool {
    id.strip_prefix(AGENT_ID_PREFIX)
        .map(|rest| {
            rest.len() == AGENT_ID_HEX_LEN
                && rest.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
        .unwrap_or(false)
}
