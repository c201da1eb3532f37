use std::fmt;

/// A key as supplied by a caller: a slash-separated path of tokens, not yet
/// validated or put into canonical (trailing-slash) form.
pub type RawKey<'a> = &'a str;

/// The canonical, trie/range-scan-safe encoding of a key: the original path
/// with exactly one trailing `/` appended. Only [`encode`] and
/// deserialization of already-canonical storage can produce one, so the
/// "always canonical" invariant lives in the type rather than in convention.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey(String);

impl EncodedKey {
    /// Strips the trailing `/` added by [`encode`], recovering the original
    /// key. Inverse of `encode` on valid input.
    pub fn decode(&self) -> &str {
        &self.0[..self.0.len() - 1]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff `self` is `other` or a descendant of `other`, i.e. `other`'s
    /// canonical form is a prefix of `self`'s. Because both sides carry the
    /// trailing slash, this never matches a sibling that merely shares a
    /// textual prefix (`a/b/` is not a prefix-match for `a/bc/`).
    pub fn is_under(&self, other: &EncodedKey) -> bool {
        self.0.starts_with(other.0.as_str())
    }

    /// The exclusive upper bound of the lexicographic range that contains
    /// exactly `self` and its descendants. Used to turn "prefix query" into a
    /// `BTreeMap::range` scan: `self.as_str()..upper_bound()`.
    ///
    /// Returns `None` if there is no finite upper bound (the prefix is, e.g.,
    /// all `\u{10FFFF}` characters), which cannot happen for keys restricted
    /// to the ASCII trie character set.
    pub fn range_upper_bound(&self) -> String {
        let mut bytes = self.0.clone().into_bytes();
        for i in (0..bytes.len()).rev() {
            if bytes[i] != 0xff {
                bytes[i] += 1;
                bytes.truncate(i + 1);
                return String::from_utf8(bytes).expect("incrementing an ASCII byte stays ASCII");
            }
        }
        // Only reachable if the key were made entirely of 0xff bytes, which
        // the character-set validation in `encode` rules out.
        unreachable!("encoded keys are restricted to the ASCII trie character set")
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key failed validation against the trie character set
/// `[A-Za-z0-9/_-]`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid key {0:?}: must match [A-Za-z0-9/_-]+")]
pub struct InvalidKey(pub String);

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-'
}

/// Validates `key` against the trie character set and returns its canonical,
/// trailing-slash-terminated encoding.
pub fn encode(key: RawKey<'_>) -> Result<EncodedKey, InvalidKey> {
    if key.is_empty() || !key.chars().all(is_valid_char) {
        return Err(InvalidKey(key.to_string()));
    }
    let mut owned = key.to_string();
    if !owned.ends_with('/') {
        owned.push('/');
    }
    Ok(EncodedKey(owned))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn valid_key_fragment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,8}(/[A-Za-z0-9_-]{1,8}){0,4}"
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(encode("a/b c").is_err());
        assert!(encode("a/b!").is_err());
        assert!(encode("").is_err());
    }

    #[test]
    fn appends_trailing_slash_iff_absent() {
        assert_eq!(encode("a/b").unwrap().as_str(), "a/b/");
        assert_eq!(encode("a/b/").unwrap().as_str(), "a/b/");
    }

    #[test]
    fn prefix_never_matches_textual_sibling() {
        let dir = encode("a/b").unwrap();
        let sibling = encode("a/bc").unwrap();
        assert!(!sibling.is_under(&dir));
        let child = encode("a/b/c").unwrap();
        assert!(child.is_under(&dir));
    }

    proptest! {
        #[test]
        fn decode_encode_roundtrips(k in valid_key_fragment()) {
            let encoded = encode(&k).unwrap();
            prop_assert_eq!(encoded.decode(), k.as_str());
        }

        #[test]
        fn range_upper_bound_excludes_self_and_includes_descendants(k in valid_key_fragment()) {
            let encoded = encode(&k).unwrap();
            let upper = encoded.range_upper_bound();
            prop_assert!(encoded.as_str().to_string() < upper);
            let child = encode(&format!("{k}/child")).unwrap();
            prop_assert!(child.as_str().to_string() < upper);
        }
    }
}
