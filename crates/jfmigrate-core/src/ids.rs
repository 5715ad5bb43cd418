//! Item identifiers and their on-disk representations.
//!
//! The server keys every library item by a 128-bit GUID derived from the
//! item's type and path. The same value shows up in five encodings:
//!
//! | kind                | example                                  | layout                      |
//! |---------------------|------------------------------------------|-----------------------------|
//! | `bin`               | 16 raw bytes                             | .NET `Guid.ToByteArray()`   |
//! | `str`               | `9ead22d385865fd641104bc375b7cc7c`       | hex of the `bin` bytes      |
//! | `str-dash`          | `9ead22d3-8586-5fd6-4110-4bc375b7cc7c`   | `str`, hyphen-grouped       |
//! | `ancestor-str`      | `d322ad9e8685d65f41104bc375b7cc7c`       | .NET `Guid.ToString("N")`   |
//! | `ancestor-str-dash` | `d322ad9e-8685-d65f-4110-4bc375b7cc7c`   | .NET `Guid.ToString()`      |
//!
//! `ItemId` stores the GUID in its textual (.NET `ToString`) order, which is
//! exactly what [`Uuid`] models; `bin` is the mixed-endian layout produced by
//! [`Uuid::to_bytes_le`] (first three groups byte-reversed, last two as-is).

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::LazyLock;

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Length of the undecorated hex forms.
const HEX_LEN: usize = 32;

/// Length of the hyphen-grouped hex forms.
const DASH_LEN: usize = 36;

/// Hyphen offsets in the grouped forms (8-4-4-4-12).
const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

static HEX_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9A-Fa-f]+").unwrap());

static DASHED_GUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}")
        .unwrap()
});

/// A server item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

/// Representation kinds an identifier can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdKind {
    Bin,
    Str,
    StrDash,
    AncestorStr,
    AncestorStrDash,
}

impl IdKind {
    pub const ALL: [IdKind; 5] = [
        IdKind::Bin,
        IdKind::Str,
        IdKind::StrDash,
        IdKind::AncestorStr,
        IdKind::AncestorStrDash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IdKind::Bin => "bin",
            IdKind::Str => "str",
            IdKind::StrDash => "str-dash",
            IdKind::AncestorStr => "ancestor-str",
            IdKind::AncestorStrDash => "ancestor-str-dash",
        }
    }

    pub fn is_textual(self) -> bool {
        !matches!(self, IdKind::Bin)
    }

    fn is_dashed(self) -> bool {
        matches!(self, IdKind::StrDash | IdKind::AncestorStrDash)
    }

    fn is_dotnet_order(self) -> bool {
        matches!(self, IdKind::AncestorStr | IdKind::AncestorStrDash)
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encoded identifier as it sits in a file or column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawId {
    Binary(Vec<u8>),
    Text(String),
}

/// Why a raw value could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} bytes/characters, found {found}")]
    WrongLength { expected: usize, found: usize },
    #[error("not a hexadecimal identifier: {0:?}")]
    NotHex(String),
    #[error("{kind} identifiers are {expected}, found {found}")]
    WrongShape {
        kind: IdKind,
        expected: &'static str,
        found: &'static str,
    },
}

impl ItemId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Build from the 16 bytes of the `bin` representation.
    pub fn from_bin(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    /// The 16 bytes of the `bin` representation.
    pub fn to_bin(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    pub fn encode(&self, kind: IdKind) -> RawId {
        match kind {
            IdKind::Bin => RawId::Binary(self.to_bin().to_vec()),
            _ => RawId::Text(self.encode_text(kind)),
        }
    }

    /// Textual encoding; `bin` is rendered as its `str` form.
    pub fn encode_text(&self, kind: IdKind) -> String {
        let plain = if kind.is_dotnet_order() {
            hex::encode(self.0.as_bytes())
        } else {
            hex::encode(self.to_bin())
        };
        if kind.is_dashed() {
            dash_group(&plain)
        } else {
            plain
        }
    }

    pub fn decode(kind: IdKind, raw: &RawId) -> Result<Self, DecodeError> {
        match (kind, raw) {
            (IdKind::Bin, RawId::Binary(bytes)) => Self::decode_bin(bytes),
            (IdKind::Bin, RawId::Text(_)) => Err(DecodeError::WrongShape {
                kind,
                expected: "binary",
                found: "text",
            }),
            (_, RawId::Text(text)) => Self::decode_text(kind, text),
            (_, RawId::Binary(_)) => Err(DecodeError::WrongShape {
                kind,
                expected: "text",
                found: "binary",
            }),
        }
    }

    pub fn decode_bin(bytes: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| DecodeError::WrongLength {
            expected: 16,
            found: bytes.len(),
        })?;
        Ok(Self::from_bin(bytes))
    }

    pub fn decode_text(kind: IdKind, text: &str) -> Result<Self, DecodeError> {
        let plain = if kind.is_dashed() {
            undash(text)?
        } else if text.len() == HEX_LEN {
            text.to_string()
        } else {
            return Err(DecodeError::WrongLength {
                expected: HEX_LEN,
                found: text.len(),
            });
        };
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&plain, &mut bytes).map_err(|_| DecodeError::NotHex(text.to_string()))?;
        if kind.is_dotnet_order() {
            Ok(Self(Uuid::from_bytes(bytes)))
        } else {
            Ok(Self::from_bin(bytes))
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ItemId {
    type Err = DecodeError;

    /// Parses the .NET textual form, dashed or not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == DASH_LEN {
            Self::decode_text(IdKind::AncestorStrDash, s)
        } else {
            Self::decode_text(IdKind::AncestorStr, s)
        }
    }
}

fn dash_group(plain: &str) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        &plain[..8],
        &plain[8..12],
        &plain[12..16],
        &plain[16..20],
        &plain[20..]
    )
}

fn undash(text: &str) -> Result<String, DecodeError> {
    if text.len() != DASH_LEN {
        return Err(DecodeError::WrongLength {
            expected: DASH_LEN,
            found: text.len(),
        });
    }
    let bytes = text.as_bytes();
    if DASH_POSITIONS.iter().any(|&i| bytes[i] != b'-') {
        return Err(DecodeError::NotHex(text.to_string()));
    }
    Ok(text.chars().filter(|&c| c != '-').collect())
}

/// An identifier found inside a larger text value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedId {
    pub range: Range<usize>,
    pub id: ItemId,
    /// The match was written with upper-case hex digits.
    pub uppercase: bool,
}

/// Locate every identifier of a textual `kind` embedded in `text`.
///
/// Undashed kinds match maximal runs of exactly 32 hex digits; dashed kinds
/// match an 8-4-4-4-12 group not glued to further hex digits. Occurrences are
/// returned left to right and never overlap.
pub fn find_embedded(kind: IdKind, text: &str) -> Vec<EmbeddedId> {
    if !kind.is_textual() {
        return Vec::new();
    }
    let is_hex_at = |i: usize| text.as_bytes().get(i).is_some_and(u8::is_ascii_hexdigit);

    let candidates: Vec<Range<usize>> = if kind.is_dashed() {
        DASHED_GUID
            .find_iter(text)
            .filter(|m| !(m.start() > 0 && is_hex_at(m.start() - 1)) && !is_hex_at(m.end()))
            .map(|m| m.range())
            .collect()
    } else {
        HEX_RUN
            .find_iter(text)
            .filter(|m| m.len() == HEX_LEN)
            .map(|m| m.range())
            .collect()
    };

    candidates
        .into_iter()
        .filter_map(|range| {
            let slice = &text[range.clone()];
            let id = ItemId::decode_text(kind, slice).ok()?;
            let uppercase = slice.chars().any(|c| c.is_ascii_uppercase())
                && !slice.chars().any(|c| c.is_ascii_lowercase());
            Some(EmbeddedId {
                range,
                id,
                uppercase,
            })
        })
        .collect()
}

/// Inputs to identifier derivation that depend on the server installation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivationContext<'a> {
    /// The server's program-data directory as it appears in stored paths.
    pub program_data_path: Option<&'a str>,
    pub case_sensitive: bool,
}

/// Compute the identifier the server assigns to an item of `item_type`
/// (full .NET type name) located at `path`.
///
/// Paths below the program-data directory are made relative to it, with
/// backslash separators, before hashing; unless ids are case sensitive the key
/// is lower-cased. The key is `item_type + path`, hashed with MD5 over its
/// UTF-16LE encoding; the digest bytes are the `bin` representation.
pub fn derive_item_id(item_type: &str, path: &str, ctx: DerivationContext<'_>) -> ItemId {
    let mut key = path.to_string();
    if let Some(program_data) = ctx.program_data_path.filter(|p| !p.is_empty()) {
        if let Some(rest) = key.strip_prefix(program_data) {
            key = rest.trim_start_matches(['/', '\\']).replace('/', "\\");
        }
    }
    if !ctx.case_sensitive {
        key = key.to_lowercase();
    }

    let mut hasher = Md5::new();
    for unit in item_type.encode_utf16().chain(key.encode_utf16()) {
        hasher.update(unit.to_le_bytes());
    }
    let digest: [u8; 16] = hasher.finalize().into();
    ItemId::from_bin(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOVIE: &str = "MediaBrowser.Controller.Entities.Movies.Movie";

    fn sample_id() -> ItemId {
        ItemId::from_bin(hex_bytes("9ead22d385865fd641104bc375b7cc7c"))
    }

    fn hex_bytes(s: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).unwrap();
        out
    }

    #[test]
    fn test_encodings_of_known_id() {
        let id = sample_id();
        assert_eq!(id.encode_text(IdKind::Str), "9ead22d385865fd641104bc375b7cc7c");
        assert_eq!(id.encode_text(IdKind::StrDash), "9ead22d3-8586-5fd6-4110-4bc375b7cc7c");
        assert_eq!(id.encode_text(IdKind::AncestorStr), "d322ad9e8685d65f41104bc375b7cc7c");
        assert_eq!(
            id.encode_text(IdKind::AncestorStrDash),
            "d322ad9e-8685-d65f-4110-4bc375b7cc7c"
        );
        assert_eq!(id.to_string(), "d322ad9e-8685-d65f-4110-4bc375b7cc7c");
    }

    #[test]
    fn test_round_trip_every_kind() {
        let mut samples = vec![ItemId::from_bin([0; 16]), ItemId::from_bin([0xff; 16]), sample_id()];
        for _ in 0..64 {
            samples.push(ItemId::from_bin(rand::random::<[u8; 16]>()));
        }
        for id in samples {
            for kind in IdKind::ALL {
                let raw = id.encode(kind);
                assert_eq!(ItemId::decode(kind, &raw).unwrap(), id, "kind {kind}");
            }
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            ItemId::decode_bin(&[1, 2, 3]),
            Err(DecodeError::WrongLength { expected: 16, found: 3 })
        ));
        assert!(ItemId::decode_text(IdKind::Str, "zz").is_err());
        assert!(ItemId::decode_text(IdKind::Str, &"g".repeat(32)).is_err());
        assert!(ItemId::decode_text(IdKind::StrDash, "9ead22d3_8586-5fd6-4110-4bc375b7cc7c").is_err());
        assert!(matches!(
            ItemId::decode(IdKind::Bin, &RawId::Text("x".into())),
            Err(DecodeError::WrongShape { .. })
        ));
    }

    #[test]
    fn test_uppercase_hex_decodes() {
        let id = sample_id();
        let upper = id.encode_text(IdKind::AncestorStr).to_uppercase();
        assert_eq!(ItemId::decode_text(IdKind::AncestorStr, &upper).unwrap(), id);
    }

    #[test]
    fn test_find_embedded_plain() {
        let id = sample_id();
        let text = format!(
            "%MetadataPath%/library/d3/{}/poster.jpg",
            id.encode_text(IdKind::AncestorStr)
        );
        let found = find_embedded(IdKind::AncestorStr, &text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(&text[found[0].range.clone()], id.encode_text(IdKind::AncestorStr));

        // A 33-digit run is not an identifier.
        let glued = format!("{}a", id.encode_text(IdKind::AncestorStr));
        assert!(find_embedded(IdKind::AncestorStr, &glued).is_empty());
    }

    #[test]
    fn test_find_embedded_dashed_multiple() {
        let a = sample_id();
        let b = ItemId::from_bin([7; 16]);
        let text = format!(
            "{}|{}",
            a.encode_text(IdKind::AncestorStrDash),
            b.encode_text(IdKind::AncestorStrDash)
        );
        let found: Vec<ItemId> = find_embedded(IdKind::AncestorStrDash, &text)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn test_derive_matches_server_hash() {
        let id = derive_item_id(MOVIE, "/data/movies/Alien (1979)/Alien.mkv", DerivationContext::default());
        assert_eq!(id.encode_text(IdKind::Str), "9ead22d385865fd641104bc375b7cc7c");

        let id = derive_item_id(
            MOVIE,
            "F:\\Filme\\Alien (1979)\\Alien.mkv",
            DerivationContext::default(),
        );
        assert_eq!(id.encode_text(IdKind::AncestorStrDash), "40753b6d-e379-55aa-65ab-591319478672");
    }

    #[test]
    fn test_derive_relativizes_program_data() {
        let ctx = DerivationContext {
            program_data_path: Some("/config/data"),
            case_sensitive: false,
        };
        let id = derive_item_id("MediaBrowser.Controller.Entities.Folder", "/config/data/root/default", ctx);
        assert_eq!(id.encode_text(IdKind::Str), "dea02328da500f2e79af9d57bfbf515c");
    }

    #[test]
    fn test_derive_is_case_insensitive_by_default() {
        let lower = derive_item_id(MOVIE, "/data/a.mkv", DerivationContext::default());
        let upper = derive_item_id(MOVIE, "/DATA/A.mkv", DerivationContext::default());
        assert_eq!(lower, upper);

        let sensitive = DerivationContext {
            program_data_path: None,
            case_sensitive: true,
        };
        assert_ne!(
            derive_item_id(MOVIE, "/data/a.mkv", sensitive),
            derive_item_id(MOVIE, "/DATA/A.mkv", sensitive)
        );
    }
}
