use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

/// Declares a fixed-width binary value stored as a BLOB and exposed as lowercase hex.
macro_rules! hex_blob {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| StoreError::InvalidHex {
                    value: s.to_string(),
                    expected: $len,
                })?;
                Ok(Self(bytes))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Blob(&self.0)))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let blob = value.as_blob()?;
                let bytes: [u8; $len] = blob.try_into().map_err(|_| FromSqlError::InvalidBlobSize {
                    expected_size: $len,
                    blob_size: blob.len(),
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_blob!(
    /// Acoustic hash of one fingerprint. Not unique on its own.
    FingerprintHash,
    8
);

hex_blob!(
    /// SHA-1 digest of a song's source audio file.
    FileSha1,
    20
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub song_id: i64,
    pub name: String,
    pub fingerprinted: bool,
    pub file_sha1: FileSha1,
}

impl Song {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            song_id: row.get(0)?,
            name: row.get(1)?,
            fingerprinted: row.get(2)?,
            file_sha1: row.get(3)?,
        })
    }
}

/// One stored fingerprint lining up with a probed hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Correspondence {
    pub song_id: i64,
    /// Stored offset minus probe offset.
    pub offset_difference: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_is_lowercase_and_parses_any_case() {
        let hash: FingerprintHash = "00FFab12CD34ef56".parse().unwrap();
        assert_eq!(hash.to_string(), "00ffab12cd34ef56");
        assert_eq!(hash.as_bytes(), &[0x00, 0xff, 0xab, 0x12, 0xcd, 0x34, 0xef, 0x56]);
    }

    #[test]
    fn test_wrong_length_hex_is_rejected() {
        let err = "abcd".parse::<FingerprintHash>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidHex { expected: 8, .. }));

        let err = "zz".repeat(20).parse::<FileSha1>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidHex { expected: 20, .. }));
    }

    #[test]
    fn test_song_serializes_sha1_as_hex() {
        let song = Song {
            song_id: 3,
            name: "Intro".to_string(),
            fingerprinted: true,
            file_sha1: FileSha1::from_bytes([0xab; 20]),
        };
        let json = serde_json::to_value(&song).unwrap();
        assert_eq!(json["file_sha1"], "ab".repeat(20));

        let back: Song = serde_json::from_value(json).unwrap();
        assert_eq!(back, song);
    }

    #[test]
    fn test_blob_of_wrong_size_fails_to_load() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let res: rusqlite::Result<FingerprintHash> =
            conn.query_row("SELECT x'0102'", [], |row| row.get(0));
        assert!(res.is_err());

        let ok: FingerprintHash = conn
            .query_row("SELECT x'0102030405060708'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ok.to_hex(), "0102030405060708");
    }
}
