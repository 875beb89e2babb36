//! Wire format for persisted patch sets.
//!
//! A patch set is stored under a fixed metadata key of its image as a
//! versioned JSON blob: `{"version": "...", "patches": [{"a": address,
//! "s": size, "t": [[tag, value], ...]}]}` with token tag 0 for operands and
//! 1 for instructions (whose value is the stable opcode number). Anything
//! that fails to decode — wrong version, unknown tag, unknown opcode,
//! malformed JSON — makes the loader discard the whole blob; a patch set is
//! never partially applied.

use serde::{Deserialize, Serialize};

use crate::il::Op;
use crate::patch::{Patch, Token};
use crate::view::ImageId;

/// Metadata key the serialized patch set is stored under
pub const PATCH_METADATA_KEY: &str = "deobfu.patches";
/// Version stamp of the current wire format
pub const PATCH_METADATA_VERSION: &str = "1";

/// The host's per-image key-value metadata store. Whatever durability it
/// offers is what the patch set gets; nothing here assumes atomicity across
/// crashes.
pub trait MetadataStore: Send + Sync {
    fn query(&self, image: ImageId, key: &str) -> Option<String>;
    fn store(&self, image: ImageId, key: &str, value: &str);

    /// Display name of the image, for log messages
    fn image_name(&self, image: ImageId) -> String {
        format!("image {:#x}", image.0)
    }
}

#[derive(Serialize, Deserialize)]
struct BlobRepr {
    version: String,
    patches: Vec<PatchRepr>,
}

#[derive(Serialize, Deserialize)]
struct PatchRepr {
    #[serde(rename = "a")]
    address: u64,
    #[serde(rename = "s")]
    size: u64,
    #[serde(rename = "t")]
    tokens: Vec<(u8, u64)>,
}

const TAG_OPERAND: u8 = 0;
const TAG_INSTRUCTION: u8 = 1;

/// Why a stored patch set was rejected.
#[derive(thiserror::Error, Debug)]
pub enum PatchSetDecodeError {
    #[error("malformed patch data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("outdated patch data (version {found:?}, expected {expected:?})")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("bad token tag {tag} in patch at {address:#x}")]
    BadTokenTag { tag: u8, address: u64 },
    #[error("unknown operation code {raw:#x} in patch at {address:#x}")]
    UnknownOpcode { raw: u64, address: u64 },
}

/// Serialize an `address -> patch` mapping into the versioned blob.
pub fn encode_patch_set(entries: &[(u64, Patch)]) -> Result<String, serde_json::Error> {
    let mut entries: Vec<&(u64, Patch)> = entries.iter().collect();
    entries.sort_by_key(|entry| entry.0);

    let blob = BlobRepr {
        version: PATCH_METADATA_VERSION.to_owned(),
        patches: entries
            .into_iter()
            .map(|(address, patch)| PatchRepr {
                address: *address,
                size: patch.size,
                tokens: patch
                    .tokens
                    .iter()
                    .map(|token| match *token {
                        Token::Operand(v) => (TAG_OPERAND, v),
                        Token::Instruction(op) => (TAG_INSTRUCTION, op.as_raw()),
                    })
                    .collect(),
            })
            .collect(),
    };
    serde_json::to_string(&blob)
}

/// Decode a stored blob back into an `address -> patch` mapping.
pub fn decode_patch_set(blob: &str) -> Result<Vec<(u64, Patch)>, PatchSetDecodeError> {
    let blob: BlobRepr = serde_json::from_str(blob)?;
    if blob.version != PATCH_METADATA_VERSION {
        return Err(PatchSetDecodeError::VersionMismatch {
            found: blob.version,
            expected: PATCH_METADATA_VERSION,
        });
    }

    let mut entries = Vec::with_capacity(blob.patches.len());
    for repr in blob.patches {
        let mut tokens = Vec::with_capacity(repr.tokens.len());
        for (tag, value) in repr.tokens {
            let token = match tag {
                TAG_OPERAND => Token::Operand(value),
                TAG_INSTRUCTION => Token::Instruction(Op::from_raw(value).ok_or(
                    PatchSetDecodeError::UnknownOpcode {
                        raw: value,
                        address: repr.address,
                    },
                )?),
                tag => {
                    return Err(PatchSetDecodeError::BadTokenTag {
                        tag,
                        address: repr.address,
                    })
                }
            };
            tokens.push(token);
        }
        entries.push((
            repr.address,
            Patch {
                size: repr.size,
                tokens,
            },
        ));
    }
    Ok(entries)
}
