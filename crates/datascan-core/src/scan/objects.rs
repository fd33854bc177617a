//! Data objects as reported by a data-pool scanner

use chrono::{DateTime, Utc};
use nom::{
    bytes::complete::take_while_m_n,
    character::complete::char,
    combinator::{all_consuming, map_res},
    sequence::separated_pair,
    IResult,
};
use serde::{Deserialize, Serialize};

/// One object found in the data pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedObject {
    /// Object name, `"{ino:x}.{objno:08x}"`
    pub oid: String,
    /// Recovered file size
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Object size of the file's layout, when the scanner could tell
    #[serde(default)]
    pub chunk_size: Option<u32>,
    /// Raw encoded backtrace from the object's `parent` attribute
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Option::is_none")]
    pub parent: Option<Vec<u8>>,
}

/// Decomposed data object name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataObjectName {
    pub ino: u64,
    pub objno: u64,
}

impl DataObjectName {
    /// The first object of a file; the only one carrying a backtrace
    pub fn is_head(&self) -> bool {
        self.objno == 0
    }
}

fn hex_u64<'a>(min: usize) -> impl FnMut(&'a str) -> IResult<&'a str, u64> {
    move |input| {
        map_res(
            take_while_m_n(min, 16, |c: char| c.is_ascii_hexdigit()),
            |digits| u64::from_str_radix(digits, 16),
        )(input)
    }
}

fn object_name(input: &str) -> IResult<&str, (u64, u64)> {
    separated_pair(hex_u64(1), char('.'), hex_u64(8))(input)
}

/// Parse `"10000000000.00000000"`; anything else (inode objects, stray
/// names) yields `None`.
pub fn parse_object_name(oid: &str) -> Option<DataObjectName> {
    all_consuming(object_name)(oid)
        .ok()
        .map(|(_, (ino, objno))| DataObjectName { ino, objno })
}

/// Lowercase hex for the `parent` field of manifests
mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| hex::decode(text).map_err(de::Error::custom))
            .transpose()
    }
}
