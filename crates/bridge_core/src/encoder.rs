//! Named serialization, integrity and compression algorithms, and the
//! per-connection [`Encoder`] built from whatever both peers agreed on.
//!
//! Every session advertises three ordered preference lists during the
//! handshake. [`negotiate`] picks, per concern, the first name of one list that
//! also appears in the other; the acceptor's list is the one iterated so both
//! ends reach the same answer.
//!
//! ```ignore
//! let registry = EncoderRegistry::global();
//! let negotiated = negotiate_all(&server_prefs, &client_prefs)?;
//! let encoder = registry.build(&negotiated)?;
//! let bytes = encoder.encode(&packet)?;
//! ```

use std::{
    collections::HashMap,
    fmt,
    io::{Read, Write},
    sync::{Arc, OnceLock},
};

use flate2::{
    Compression,
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use strum_macros::{AsRefStr, Display};

use crate::error::{EncodeError, HandshakeFailure};

/// Decompressed frames above this size are rejected.
const MAX_DECOMPRESSED: u64 = 64 * 1024 * 1024;

/// Context string used to turn a shared secret into a blake3 key.
const VERIFY_KEY_CONTEXT: &str = "botbridge frame verify v1";

// -----------------------------------------------------------------------------
// Algorithm traits
// -----------------------------------------------------------------------------

/// Serialization (`encode` concern): a value to bytes and back.
pub trait Codec: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, EncodeError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, EncodeError>;
}

/// Integrity (`verify` concern): a fixed-length digest appended to a frame.
pub trait Checksum: Send + Sync {
    /// Output length in bytes.
    fn output_len(&self) -> usize;
    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

/// Byte-stream compression (`compress` concern).
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum AlgorithmKind {
    Encode,
    Verify,
    Compress,
}

/// One concrete implementation, tagged with the concern it serves.
#[derive(Clone)]
pub enum Algorithm {
    Encode(Arc<dyn Codec>),
    Verify(Arc<dyn Checksum>),
    Compress(Arc<dyn Compressor>),
}

impl Algorithm {
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Algorithm::Encode(_) => AlgorithmKind::Encode,
            Algorithm::Verify(_) => AlgorithmKind::Verify,
            Algorithm::Compress(_) => AlgorithmKind::Compress,
        }
    }
}

/// Resolves a member of a parameterized hash family from its output length
/// in bytes. Returns `None` for lengths the family does not support.
pub type VerifyFamily = Arc<dyn Fn(usize) -> Option<Arc<dyn Checksum>> + Send + Sync>;

// -----------------------------------------------------------------------------
// Builtin algorithms
// -----------------------------------------------------------------------------

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(|e| EncodeError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, EncodeError> {
        serde_json::from_slice(bytes).map_err(|e| EncodeError::Deserialize(e.to_string()))
    }
}

pub struct CborCodec;

impl Codec for CborCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        ciborium::into_writer(value, &mut out).map_err(|e| EncodeError::Serialize(e.to_string()))?;
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, EncodeError> {
        ciborium::from_reader(bytes).map_err(|e| EncodeError::Deserialize(e.to_string()))
    }
}

pub struct Sha256Checksum;

impl Checksum for Sha256Checksum {
    fn output_len(&self) -> usize {
        32
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

pub struct Sha512Checksum;

impl Checksum for Sha512Checksum {
    fn output_len(&self) -> usize {
        64
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }
}

/// blake3 in extendable-output mode, optionally keyed.
pub struct Blake3Checksum {
    out_len: usize,
    key: Option<[u8; 32]>,
}

impl Blake3Checksum {
    pub fn new(out_len: usize, key: Option<[u8; 32]>) -> Self {
        Self { out_len, key }
    }
}

impl Checksum for Blake3Checksum {
    fn output_len(&self) -> usize {
        self.out_len
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = match &self.key {
            Some(key) => blake3::Hasher::new_keyed(key),
            None => blake3::Hasher::new(),
        };
        hasher.update(data);
        let mut out = vec![0u8; self.out_len];
        hasher.finalize_xof().fill(&mut out);
        out
    }
}

pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| EncodeError::Compress(format!("gzip write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| EncodeError::Compress(format!("gzip finish failed: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .take(MAX_DECOMPRESSED)
            .read_to_end(&mut out)
            .map_err(|e| EncodeError::Decompress(format!("gzip: {e}")))?;
        Ok(out)
    }
}

pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| EncodeError::Compress(format!("deflate write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| EncodeError::Compress(format!("deflate finish failed: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .take(MAX_DECOMPRESSED)
            .read_to_end(&mut out)
            .map_err(|e| EncodeError::Decompress(format!("deflate: {e}")))?;
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Preferences & negotiation
// -----------------------------------------------------------------------------

/// Ordered algorithm preferences, most preferred first. This is also the
/// `encoders` object of the handshake meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EncoderPrefs {
    pub encode: Vec<String>,
    #[serde(default)]
    pub verify: Vec<String>,
    #[serde(default)]
    pub compress: Vec<String>,
}

impl Default for EncoderPrefs {
    fn default() -> Self {
        Self {
            encode: vec!["json".into(), "cbor".into()],
            verify: vec!["blake3-128".into(), "sha256".into()],
            compress: vec![],
        }
    }
}

/// The algorithms one session settled on. `None` means the concern is a
/// pass-through for this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiated {
    pub encode: String,
    pub verify: Option<String>,
    pub compress: Option<String>,
}

/// First name of `local` that also appears anywhere in `remote`.
pub fn negotiate(local: &[String], remote: &[String]) -> Option<String> {
    local.iter().find(|name| remote.contains(*name)).cloned()
}

/// Negotiates all three concerns. The acceptor's lists drive the iteration
/// on both ends, so the connector must pass the peer's prefs first.
pub fn negotiate_all(
    acceptor: &EncoderPrefs,
    connector: &EncoderPrefs,
) -> Result<Negotiated, HandshakeFailure> {
    let encode = negotiate(&acceptor.encode, &connector.encode).ok_or_else(|| {
        HandshakeFailure::NoCommonEncoding {
            local: acceptor.encode.clone(),
            remote: connector.encode.clone(),
        }
    })?;
    Ok(Negotiated {
        encode,
        verify: negotiate(&acceptor.verify, &connector.verify),
        compress: negotiate(&acceptor.compress, &connector.compress),
    })
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------

/// Catalog of named algorithms. Built once, then shared read-only.
#[derive(Default)]
pub struct EncoderRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
    checksums: HashMap<String, Arc<dyn Checksum>>,
    families: HashMap<String, VerifyFamily>,
    compressors: HashMap<String, Arc<dyn Compressor>>,
}

impl EncoderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin algorithms. With a `secret`, the blake3 family is keyed so
    /// only peers sharing the secret can produce valid checksums.
    pub fn builtin(secret: Option<&str>) -> Self {
        let mut registry = Self::new();
        registry.register("json", Algorithm::Encode(Arc::new(JsonCodec)));
        registry.register("cbor", Algorithm::Encode(Arc::new(CborCodec)));
        registry.register("sha256", Algorithm::Verify(Arc::new(Sha256Checksum)));
        registry.register("sha512", Algorithm::Verify(Arc::new(Sha512Checksum)));
        registry.register("gzip", Algorithm::Compress(Arc::new(GzipCompressor)));
        registry.register("deflate", Algorithm::Compress(Arc::new(DeflateCompressor)));

        let key = secret.map(|s| blake3::derive_key(VERIFY_KEY_CONTEXT, s.as_bytes()));
        registry.register_verify_family(
            "blake3",
            Arc::new(move |len: usize| {
                (1..=64)
                    .contains(&len)
                    .then(|| Arc::new(Blake3Checksum::new(len, key)) as Arc<dyn Checksum>)
            }),
        );
        registry
    }

    /// The process-wide unkeyed builtin registry.
    pub fn global() -> Arc<EncoderRegistry> {
        static GLOBAL: OnceLock<Arc<EncoderRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(EncoderRegistry::builtin(None)))
            .clone()
    }

    /// Adds or replaces the algorithm registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, algorithm: Algorithm) {
        let name = name.into();
        match algorithm {
            Algorithm::Encode(codec) => {
                self.codecs.insert(name, codec);
            }
            Algorithm::Verify(checksum) => {
                self.checksums.insert(name, checksum);
            }
            Algorithm::Compress(compressor) => {
                self.compressors.insert(name, compressor);
            }
        }
    }

    /// Registers a parameterized hash family addressed as `<prefix>-<bits>`.
    pub fn register_verify_family(&mut self, prefix: impl Into<String>, family: VerifyFamily) {
        self.families.insert(prefix.into(), family);
    }

    pub fn codec(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    pub fn compressor(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.compressors.get(name).cloned()
    }

    /// Looks up a verify algorithm, falling back to a hash family for names
    /// of the form `<prefix>-<bits>` where `bits` is a multiple of 8.
    pub fn checksum(&self, name: &str) -> Option<Arc<dyn Checksum>> {
        if let Some(checksum) = self.checksums.get(name) {
            return Some(checksum.clone());
        }
        let (prefix, bits) = name.rsplit_once('-')?;
        let bits: usize = bits.parse().ok()?;
        if bits == 0 || bits % 8 != 0 {
            return None;
        }
        self.families.get(prefix).and_then(|family| family(bits / 8))
    }

    /// Whether `name` resolves for the given concern.
    pub fn supports(&self, kind: AlgorithmKind, name: &str) -> bool {
        match kind {
            AlgorithmKind::Encode => self.codecs.contains_key(name),
            AlgorithmKind::Verify => self.checksum(name).is_some(),
            AlgorithmKind::Compress => self.compressors.contains_key(name),
        }
    }

    /// Drops names this registry cannot resolve, keeping the order.
    pub fn filter_supported(&self, prefs: &EncoderPrefs) -> EncoderPrefs {
        let keep = |kind, names: &[String]| {
            names
                .iter()
                .filter(|name| self.supports(kind, name))
                .cloned()
                .collect::<Vec<_>>()
        };
        EncoderPrefs {
            encode: keep(AlgorithmKind::Encode, &prefs.encode),
            verify: keep(AlgorithmKind::Verify, &prefs.verify),
            compress: keep(AlgorithmKind::Compress, &prefs.compress),
        }
    }

    /// Combines the negotiated algorithms into one connection encoder.
    pub fn build(&self, negotiated: &Negotiated) -> Result<Encoder, EncodeError> {
        let codec = self
            .codec(&negotiated.encode)
            .ok_or_else(|| EncodeError::UnknownAlgorithm {
                kind: "encode",
                name: negotiated.encode.clone(),
            })?;
        let checksum = match &negotiated.verify {
            Some(name) => Some(self.checksum(name).ok_or_else(|| EncodeError::UnknownAlgorithm {
                kind: "verify",
                name: name.clone(),
            })?),
            None => None,
        };
        let compressor = match &negotiated.compress {
            Some(name) => Some(self.compressor(name).ok_or_else(|| {
                EncodeError::UnknownAlgorithm {
                    kind: "compress",
                    name: name.clone(),
                }
            })?),
            None => None,
        };
        Ok(Encoder {
            negotiated: negotiated.clone(),
            codec,
            checksum,
            compressor,
        })
    }
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderRegistry")
            .field("encode", &self.codecs.keys().collect::<Vec<_>>())
            .field("verify", &self.checksums.keys().collect::<Vec<_>>())
            .field("verify_families", &self.families.keys().collect::<Vec<_>>())
            .field("compress", &self.compressors.keys().collect::<Vec<_>>())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Per-connection encoder
// -----------------------------------------------------------------------------

/// serialize → compress → checksum on the way out, the reverse on the way in.
#[derive(Clone)]
pub struct Encoder {
    negotiated: Negotiated,
    codec: Arc<dyn Codec>,
    checksum: Option<Arc<dyn Checksum>>,
    compressor: Option<Arc<dyn Compressor>>,
}

impl Encoder {
    /// Plain JSON with no verify or compress; used for the handshake frame.
    pub fn plain_json() -> Self {
        Self {
            negotiated: Negotiated {
                encode: "json".into(),
                verify: None,
                compress: None,
            },
            codec: Arc::new(JsonCodec),
            checksum: None,
            compressor: None,
        }
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn encode_value(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = self.codec.serialize(value)?;
        if let Some(compressor) = &self.compressor {
            bytes = compressor.compress(&bytes)?;
        }
        if let Some(checksum) = &self.checksum {
            let digest = checksum.digest(&bytes);
            bytes.extend_from_slice(&digest);
        }
        Ok(bytes)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value, EncodeError> {
        let body = match &self.checksum {
            Some(checksum) => {
                let expected = checksum.output_len();
                if bytes.len() < expected {
                    return Err(EncodeError::Truncated {
                        len: bytes.len(),
                        expected,
                    });
                }
                let (body, digest) = bytes.split_at(bytes.len() - expected);
                if checksum.digest(body) != digest {
                    return Err(EncodeError::ChecksumMismatch {
                        algorithm: self.negotiated.verify.clone().unwrap_or_default(),
                    });
                }
                body
            }
            None => bytes,
        };
        match &self.compressor {
            Some(compressor) => self.codec.deserialize(&compressor.decompress(body)?),
            None => self.codec.deserialize(body),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        let value = serde_json::to_value(value).map_err(|e| EncodeError::Serialize(e.to_string()))?;
        self.encode_value(&value)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, EncodeError> {
        let value = self.decode_value(bytes)?;
        serde_json::from_value(value).map_err(|e| EncodeError::Deserialize(e.to_string()))
    }
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Encoder").field(&self.negotiated).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn negotiate_picks_earliest_local_name() {
        let local = names(&["cbor", "json", "msgpack"]);
        let remote = names(&["msgpack", "json", "cbor"]);
        assert_eq!(negotiate(&local, &remote).as_deref(), Some("cbor"));

        let remote = names(&["json", "msgpack"]);
        assert_eq!(negotiate(&local, &remote).as_deref(), Some("json"));

        assert_eq!(negotiate(&local, &names(&["xml"])), None);
        assert_eq!(negotiate(&[], &local), None);
    }

    #[test]
    fn both_ends_agree_when_preferences_differ() {
        let server = EncoderPrefs {
            encode: names(&["cbor", "json"]),
            verify: names(&["sha256"]),
            compress: names(&["gzip"]),
        };
        let client = EncoderPrefs {
            encode: names(&["json", "cbor"]),
            verify: names(&["sha512"]),
            compress: names(&["deflate", "gzip"]),
        };
        let negotiated = negotiate_all(&server, &client).unwrap();
        assert_eq!(negotiated.encode, "cbor");
        assert_eq!(negotiated.verify, None);
        assert_eq!(negotiated.compress.as_deref(), Some("gzip"));
    }

    #[test]
    fn missing_encoding_overlap_fails_handshake() {
        let server = EncoderPrefs { encode: names(&["cbor"]), ..Default::default() };
        let client = EncoderPrefs { encode: names(&["json"]), ..Default::default() };
        let err = negotiate_all(&server, &client).unwrap_err();
        assert!(matches!(err, HandshakeFailure::NoCommonEncoding { .. }));
    }

    #[test]
    fn round_trip_through_every_stage() {
        let registry = EncoderRegistry::builtin(None);
        let value = json!({
            "name": "send_msg",
            "args": {"text": "héllo", "ids": [1, 2, 3], "nested": {"ok": true, "none": null}},
            "echo": "42"
        });
        for encode in ["json", "cbor"] {
            for verify in [None, Some("sha256"), Some("blake3-96")] {
                for compress in [None, Some("gzip"), Some("deflate")] {
                    let encoder = registry
                        .build(&Negotiated {
                            encode: encode.into(),
                            verify: verify.map(Into::into),
                            compress: compress.map(Into::into),
                        })
                        .unwrap();
                    let bytes = encoder.encode_value(&value).unwrap();
                    assert_eq!(encoder.decode_value(&bytes).unwrap(), value);
                }
            }
        }
    }

    #[test]
    fn tampered_frame_is_rejected() {
        let registry = EncoderRegistry::builtin(None);
        let encoder = registry
            .build(&Negotiated { encode: "json".into(), verify: Some("sha256".into()), compress: None })
            .unwrap();
        let mut bytes = encoder.encode_value(&json!({"a": 1})).unwrap();
        bytes[2] ^= 0xff;
        assert!(matches!(
            encoder.decode_value(&bytes),
            Err(EncodeError::ChecksumMismatch { .. })
        ));
        assert!(matches!(encoder.decode_value(&[1, 2]), Err(EncodeError::Truncated { .. })));
    }

    #[test]
    fn hash_family_resolves_by_bit_length() {
        let registry = EncoderRegistry::builtin(None);
        assert_eq!(registry.checksum("blake3-256").unwrap().output_len(), 32);
        assert_eq!(registry.checksum("blake3-64").unwrap().output_len(), 8);
        assert!(registry.checksum("blake3-100").is_none());
        assert!(registry.checksum("blake3-1024").is_none());
        assert!(registry.checksum("md5-128").is_none());
        assert!(registry.supports(AlgorithmKind::Verify, "blake3-512"));
    }

    #[test]
    fn keyed_family_needs_the_same_secret() {
        let negotiated = Negotiated { encode: "json".into(), verify: Some("blake3-128".into()), compress: None };
        let alice = EncoderRegistry::builtin(Some("s3cret")).build(&negotiated).unwrap();
        let bob = EncoderRegistry::builtin(Some("s3cret")).build(&negotiated).unwrap();
        let eve = EncoderRegistry::builtin(Some("guess")).build(&negotiated).unwrap();

        let bytes = alice.encode_value(&json!("hi")).unwrap();
        assert_eq!(bob.decode_value(&bytes).unwrap(), json!("hi"));
        assert!(eve.decode_value(&bytes).is_err());
    }

    #[test]
    fn unsupported_names_are_filtered_from_prefs() {
        let registry = EncoderRegistry::builtin(None);
        let prefs = EncoderPrefs {
            encode: names(&["yaml", "cbor", "json"]),
            verify: names(&["crc32", "blake3-128"]),
            compress: names(&["zstd", "gzip"]),
        };
        let filtered = registry.filter_supported(&prefs);
        assert_eq!(filtered.encode, names(&["cbor", "json"]));
        assert_eq!(filtered.verify, names(&["blake3-128"]));
        assert_eq!(filtered.compress, names(&["gzip"]));
    }
}
