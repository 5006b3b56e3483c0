use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::rpc::{Account, Authority};

/// Prefix mixed into the digest for direct upload signatures.
pub const SIGNING_CHALLENGE: &[u8] = b"ImageSigningChallenge";

/// Message types a login token may carry.
const TOKEN_TYPES: &[&str] = &["login", "posting", "offline", "code", "refresh"];

/// `sha256("ImageSigningChallenge" ‖ data)`.
pub fn challenge_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SIGNING_CHALLENGE);
    hasher.update(data);
    hasher.finalize().into()
}

/// Parse a chain-style hex signature: one recovery byte followed by the
/// 64-byte compact form.
fn parse_compact(sig_hex: &str) -> Result<RecoverableSignature> {
    let raw = hex::decode(sig_hex).map_err(|_| Error::InvalidSignature)?;
    if raw.len() != 65 {
        return Err(Error::InvalidSignature);
    }
    let recovery = (i32::from(raw[0]) - 27) & 3;
    let id = RecoveryId::from_i32(recovery).map_err(|_| Error::InvalidSignature)?;
    RecoverableSignature::from_compact(&raw[1..], id).map_err(|_| Error::InvalidSignature)
}

pub fn recover_public_key(digest: &[u8; 32], sig_hex: &str) -> Result<PublicKey> {
    let sig = parse_compact(sig_hex)?;
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*digest);
    secp.recover_ecdsa(&msg, &sig)
        .map_err(|_| Error::InvalidSignature)
}

/// Parse a prefixed public key (`STM…`/`TST…`): base58 of the 33-byte
/// compressed point plus a 4-byte ripemd160 checksum.
pub fn public_key_from_str(s: &str) -> Result<PublicKey> {
    if s.len() < 8 || !s.is_char_boundary(3) {
        return Err(Error::InvalidSignature);
    }
    let raw = bs58::decode(&s[3..])
        .into_vec()
        .map_err(|_| Error::InvalidSignature)?;
    if raw.len() != 37 {
        return Err(Error::InvalidSignature);
    }
    let (key, checksum) = raw.split_at(33);
    let digest = Ripemd160::digest(key);
    if digest[..4] != *checksum {
        return Err(Error::InvalidSignature);
    }
    PublicKey::from_slice(key).map_err(|_| Error::InvalidSignature)
}

/// Derive the public key from a WIF private key (base58check, version 0x80).
pub fn public_key_from_wif(wif: &str) -> Result<PublicKey> {
    let raw = bs58::decode(wif)
        .into_vec()
        .map_err(|_| Error::InvalidSignature)?;
    if raw.len() != 37 {
        return Err(Error::InvalidSignature);
    }
    let (payload, checksum) = raw.split_at(33);
    let digest = Sha256::digest(Sha256::digest(payload));
    if digest[..4] != *checksum || payload[0] != 0x80 {
        return Err(Error::InvalidSignature);
    }
    let secret = SecretKey::from_slice(&payload[1..33]).map_err(|_| Error::InvalidSignature)?;
    Ok(PublicKey::from_secret_key(&Secp256k1::new(), &secret))
}

fn authority_has_key(authority: &Authority, key: &PublicKey) -> bool {
    authority.key_auths.iter().any(|auth| {
        u32::from(auth.1) >= authority.weight_threshold
            && public_key_from_str(&auth.0)
                .map(|k| k == *key)
                .unwrap_or(false)
    })
}

/// Mode A: the signature is a direct posting/active-key signature over the
/// challenge digest of the uploaded bytes.
pub fn verify_direct(account: &Account, sig_hex: &str, data: &[u8]) -> Result<()> {
    let digest = challenge_digest(data);
    let recovered = recover_public_key(&digest, sig_hex)?;
    for authority in [&account.posting, &account.active] {
        if authority_has_key(authority, &recovered) {
            return Ok(());
        }
    }
    Err(Error::InvalidSignature)
}

/// Signed login token: a JSON payload carrying its own authority chain.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadToken {
    pub signed_message: Value,
    pub authors: Vec<String>,
    pub signatures: Vec<String>,
    #[serde(default)]
    pub timestamp: Value,
}

impl UploadToken {
    pub fn author(&self) -> Result<&str> {
        self.authors
            .first()
            .map(String::as_str)
            .ok_or(Error::InvalidSignature)
    }
}

/// Path-style tokens are wrapped as `hive…` with an optional `…signer`
/// suffix; the payload sits between the two.
pub fn strip_token_wrapper(raw: &str) -> &str {
    let s = raw.strip_prefix("hive").unwrap_or(raw);
    s.strip_suffix("signer").unwrap_or(s)
}

/// Decode the URL-safe token charset (`_ → /`, `- → +`, `. → =`) and parse
/// the JSON payload.
pub fn decode_token(raw: &str) -> Result<UploadToken> {
    let mapped: String = raw
        .chars()
        .map(|c| match c {
            '_' => '/',
            '-' => '+',
            '.' => '=',
            other => other,
        })
        .collect();
    let bytes = BASE64.decode(mapped).map_err(|_| Error::InvalidSignature)?;
    serde_json::from_slice(&bytes).map_err(|_| Error::InvalidSignature)
}

/// The digest a token signature covers: the canonical JSON of the three
/// signed fields, hashed with the payload's own key order.
fn token_digest(token: &UploadToken) -> Result<[u8; 32]> {
    let canonical = serde_json::json!({
        "signed_message": token.signed_message,
        "authors": token.authors,
        "timestamp": token.timestamp,
    });
    let serialized = serde_json::to_string(&canonical).map_err(|_| Error::InvalidSignature)?;
    Ok(Sha256::digest(serialized.as_bytes()).into())
}

pub struct TokenContext<'a> {
    /// Account granted posting delegation by token users.
    pub app_account: Option<&'a str>,
    /// Public key of the configured broadcaster WIF.
    pub broadcaster_key: Option<&'a PublicKey>,
}

/// Mode B: accept when the broadcaster key signed the token, the account
/// delegates to the app account, or one of the account's own keys signed.
pub fn verify_token(token: &UploadToken, account: &Account, ctx: &TokenContext) -> Result<()> {
    let message = token
        .signed_message
        .as_object()
        .ok_or(Error::InvalidSignature)?;
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidSignature)?;
    if !TOKEN_TYPES.contains(&msg_type) {
        return Err(Error::InvalidSignature);
    }
    if !message.contains_key("app") {
        return Err(Error::InvalidSignature);
    }

    if let Some(app) = ctx.app_account {
        for authority in [&account.posting, &account.active, &account.owner] {
            if authority.account_auths.iter().any(|(name, _)| name == app) {
                return Ok(());
            }
        }
    }

    let digest = token_digest(token)?;
    for sig in &token.signatures {
        let Ok(recovered) = recover_public_key(&digest, sig) else {
            continue;
        };
        if ctx.broadcaster_key.is_some_and(|key| *key == recovered) {
            return Ok(());
        }
        for authority in [&account.posting, &account.active, &account.owner] {
            if authority.key_auths.iter().any(|auth| {
                public_key_from_str(&auth.0)
                    .map(|k| k == recovered)
                    .unwrap_or(false)
            }) {
                return Ok(());
            }
        }
    }
    Err(Error::InvalidSignature)
}
