//! Nostr event model, canonical hashing, and admission validation.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Reject;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event received from clients and served back to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Kinds where at most one event per `(pubkey, kind)` survives.
pub fn is_replaceable(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Kinds keyed additionally by the first `d` tag value.
pub fn is_param_replaceable(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

/// Kinds that are never persisted.
pub fn is_ephemeral(kind: u16) -> bool {
    (20000..30000).contains(&kind)
}

impl Event {
    /// Recompute the canonical Nostr event hash from the event fields.
    pub fn canonical_hash(&self) -> Result<[u8; 32], Reject> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let data = serde_json::to_vec(&arr)
            .map_err(|e| Reject::invalid(format!("unserializable event: {e}")))?;
        Ok(Sha256::digest(&data).into())
    }

    /// Decode the hex id into raw bytes.
    pub fn id_bytes(&self) -> Result<[u8; 32], Reject> {
        decode32(&self.id).ok_or_else(|| Reject::invalid("event id is not 32 hex bytes"))
    }

    /// Decode the hex pubkey into raw bytes.
    pub fn pubkey_bytes(&self) -> Result<[u8; 32], Reject> {
        decode32(&self.pubkey).ok_or_else(|| Reject::invalid("pubkey is not 32 hex bytes"))
    }

    /// First value of the first `d` tag, or the empty string.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [t, val, ..] if t == "d" => Some(val.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    /// Iterate `(letter, value)` pairs for single-letter tags with a value.
    pub fn single_letter_tags(&self) -> impl Iterator<Item = (u8, &str)> {
        self.tags.iter().filter_map(|Tag(fields)| {
            let (name, value) = match fields.as_slice() {
                [name, value, ..] => (name, value),
                _ => return None,
            };
            let mut bytes = name.bytes();
            match (bytes.next(), bytes.next()) {
                (Some(c), None) if c.is_ascii_alphanumeric() => Some((c, value.as_str())),
                _ => None,
            }
        })
    }

    /// Validate field shapes and resource limits without touching crypto.
    pub fn validate_structure(&self, max_event_bytes: usize) -> Result<(), Reject> {
        if !is_lower_hex(&self.id, 64) {
            return Err(Reject::invalid(
                "event id must be 64 lowercase hex characters",
            ));
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(Reject::invalid("pubkey must be 64 lowercase hex characters"));
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err(Reject::invalid("sig must be 128 lowercase hex characters"));
        }
        for Tag(fields) in &self.tags {
            let name = fields.first().ok_or_else(|| Reject::invalid("empty tag"))?;
            match name.bytes().next() {
                Some(c) if c.is_ascii_alphanumeric() => {}
                _ => {
                    return Err(Reject::invalid(
                        "tag name must start with an ASCII letter or digit",
                    ))
                }
            }
        }
        // The serialized form bounds what the relay stores and re-sends.
        let serialized = serde_json::to_vec(self)
            .map_err(|e| Reject::invalid(format!("unserializable event: {e}")))?;
        if serialized.len() > max_event_bytes {
            return Err(Reject::invalid(format!(
                "event too large ({} bytes)",
                serialized.len()
            )));
        }
        Ok(())
    }

    /// Reject events too far in the past or future.
    pub fn validate_created_at(
        &self,
        now: i64,
        reject_older: i64,
        reject_newer: i64,
    ) -> Result<(), Reject> {
        if self.created_at < now - reject_older {
            return Err(Reject::invalid("created_at is too far in the past"));
        }
        if self.created_at > now + reject_newer {
            return Err(Reject::invalid("created_at is too far in the future"));
        }
        Ok(())
    }

    /// Verify the event id recomputation and its Schnorr signature.
    pub fn verify(&self) -> Result<(), Reject> {
        let hash = self.canonical_hash()?;
        if hex::encode(hash) != self.id {
            return Err(Reject::invalid("event id does not match the canonical hash"));
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Reject::invalid("sig is not hex"))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|_| Reject::invalid("sig is not a valid schnorr signature"))?;
        let pk_bytes = self.pubkey_bytes()?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|_| Reject::invalid("pubkey is not a valid x-only key"))?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|_| Reject::invalid("event hash is not a valid message"))?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| Reject::invalid("signature verification failed"))
    }
}

/// Decode a 64-character hex string into 32 bytes.
pub fn decode32(hex_str: &str) -> Option<[u8; 32]> {
    if hex_str.len() != 64 {
        return None;
    }
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}


#[cfg(test)]
mod tests {
    use super::testutil::signed_event;
    use super::*;

    #[test]
    fn kind_classes() {
        assert!(is_replaceable(0));
        assert!(is_replaceable(3));
        assert!(is_replaceable(10000));
        assert!(is_replaceable(19999));
        assert!(!is_replaceable(1));
        assert!(is_ephemeral(20000));
        assert!(is_ephemeral(29999));
        assert!(is_param_replaceable(30023));
        assert!(!is_param_replaceable(40000));
    }

    #[test]
    fn verify_accepts_good_event_and_rejects_tampering() {
        let ev = signed_event(1, 1000, vec![], "hello");
        ev.verify().unwrap();

        let mut bad_sig = ev.clone();
        bad_sig.sig.replace_range(0..2, "00");
        assert!(bad_sig.verify().is_err());

        let mut bad_content = ev.clone();
        bad_content.content = "tampered".into();
        assert!(bad_content.verify().is_err());

        let mut bad_id = ev;
        bad_id.id.replace_range(0..2, "ff");
        assert!(bad_id.verify().is_err());
    }

    #[test]
    fn canonical_hash_matches_reference() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let expected: [u8; 32] = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            Sha256::digest(serde_json::to_vec(&obj).unwrap()).into()
        };
        assert_eq!(ev.canonical_hash().unwrap(), expected);
    }

    #[test]
    fn d_tag_defaults_to_empty() {
        let ev = signed_event(30023, 1, vec![], "");
        assert_eq!(ev.d_tag(), "");
        let ev = signed_event(
            30023,
            1,
            vec![
                Tag(vec!["t".into(), "essay".into()]),
                Tag(vec!["d".into(), "slug".into()]),
                Tag(vec!["d".into(), "other".into()]),
            ],
            "",
        );
        assert_eq!(ev.d_tag(), "slug");
    }

    #[test]
    fn single_letter_tags_skip_long_names_and_valueless() {
        let ev = signed_event(
            1,
            1,
            vec![
                Tag(vec!["e".into(), "aa".repeat(32)]),
                Tag(vec!["expiration".into(), "123".into()]),
                Tag(vec!["p".into()]),
                Tag(vec!["t".into(), "news".into()]),
            ],
            "",
        );
        let pairs: Vec<_> = ev.single_letter_tags().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, b'e');
        assert_eq!(pairs[1], (b't', "news"));
    }

    #[test]
    fn structure_rejects_uppercase_hex_and_oversize() {
        let mut ev = signed_event(1, 1, vec![], "x");
        ev.id = ev.id.to_uppercase();
        assert!(ev.validate_structure(1 << 17).is_err());

        let ev = signed_event(1, 1, vec![], &"y".repeat(4096));
        assert!(ev.validate_structure(1024).is_err());
        assert!(ev.validate_structure(1 << 17).is_ok());
    }

    #[test]
    fn created_at_window() {
        let ev = signed_event(1, 1000, vec![], "");
        assert!(ev.validate_created_at(1000, 100, 100).is_ok());
        assert!(ev.validate_created_at(2000, 100, 100).is_err());
        assert!(ev.validate_created_at(500, 100, 100).is_err());
    }
}
