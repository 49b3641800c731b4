//! Consistent hashing (§4.E): hash function menu, hash-tag key extraction,
//! and the three distribution policies (`ketama`, `modula`, `random`) built
//! on top of them.

pub mod functions;
pub mod ketama;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFn {
    Md5,
    Fnv1a64,
    Crc32,
    Jenkins,
    Murmur2,
    Hsieh,
}

impl HashFn {
    pub fn hash(self, data: &[u8]) -> u32 {
        match self {
            HashFn::Md5 => functions::md5_hash_32(data),
            HashFn::Fnv1a64 => functions::fnv1a_64(data) as u32,
            HashFn::Crc32 => functions::crc32(data),
            HashFn::Jenkins => functions::jenkins_one_at_a_time(data),
            HashFn::Murmur2 => functions::murmur2(data, 0),
            HashFn::Hsieh => functions::hsieh(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Ketama,
    Modula,
    Random,
}

/// Extracts the hash-tagged substring of `key` per the configured two-char
/// tag (e.g. `"{}"`): if both bytes appear with non-empty content between
/// them, only that content is hashed; otherwise the whole key is hashed.
pub fn hash_tag_extract<'a>(key: &'a [u8], tag: Option<(u8, u8)>) -> &'a [u8] {
    let Some((open, close)) = tag else {
        return key;
    };
    let Some(open_pos) = key.iter().position(|&b| b == open) else {
        return key;
    };
    let Some(close_rel) = key[open_pos + 1..].iter().position(|&b| b == close) else {
        return key;
    };
    let close_pos = open_pos + 1 + close_rel;
    if close_pos == open_pos + 1 {
        // empty between the tags: falls back to hashing the whole key
        return key;
    }
    &key[open_pos + 1..close_pos]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tag_extracts_between_braces() {
        let key = b"user:{42}:profile";
        assert_eq!(hash_tag_extract(key, Some((b'{', b'}'))), b"42");
    }

    #[test]
    fn hash_tag_falls_back_when_absent() {
        let key = b"user:42:profile";
        assert_eq!(hash_tag_extract(key, Some((b'{', b'}'))), key);
    }

    #[test]
    fn hash_tag_falls_back_when_empty() {
        let key = b"user:{}:profile";
        assert_eq!(hash_tag_extract(key, Some((b'{', b'}'))), key);
    }
}
