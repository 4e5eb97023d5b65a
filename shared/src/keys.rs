use std::fmt;
use thiserror::Error;

/// Fixed path segment between the collection name and the shard directories.
pub const ORIGINALS_SEGMENT: &str = "originals";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Empty {0}")]
    Empty(&'static str),
    #[error("Filename {0:?} is shorter than the 4 characters needed for sharding")]
    TooShort(String),
    #[error("Filename {0:?} must be a leaf name without path separators")]
    NotALeaf(String),
}

/// Object key for an original asset, sharded by the first four characters of
/// its filename: `{collection}/originals/{f[0:2]}/{f[2:4]}/{f}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardedKey {
    collection: String,
    filename: String,
    split: (usize, usize),
}

impl ShardedKey {
    pub fn new(collection: &str, filename: &str) -> Result<Self, KeyError> {
        let collection = collection.trim().trim_matches('/');
        let filename = filename.trim();

        if collection.is_empty() {
            return Err(KeyError::Empty("collection"));
        }
        if filename.is_empty() {
            return Err(KeyError::Empty("filename"));
        }
        if filename.contains(['/', '\\']) {
            return Err(KeyError::NotALeaf(filename.to_string()));
        }

        // Byte offsets of the 2nd and 4th character boundaries
        let mut bounds = filename.char_indices().map(|(i, _)| i).skip(2).step_by(2);
        let first = bounds.next();
        let second = bounds
            .next()
            .or_else(|| (filename.chars().count() == 4).then_some(filename.len()));

        match (first, second) {
            (Some(first), Some(second)) => Ok(Self {
                collection: collection.to_string(),
                filename: filename.to_string(),
                split: (first, second),
            }),
            _ => Err(KeyError::TooShort(filename.to_string())),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The two shard directory names.
    pub fn shards(&self) -> (&str, &str) {
        let (a, b) = self.split;
        (&self.filename[..a], &self.filename[a..b])
    }

    /// Key relative to the connection's global prefix.
    pub fn relative_key(&self) -> String {
        let (first, second) = self.shards();
        format!(
            "{}/{}/{}/{}/{}",
            self.collection, ORIGINALS_SEGMENT, first, second, self.filename
        )
    }
}

impl fmt::Display for ShardedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_key())
    }
}

/// Normalize a path into an object key.
pub fn s3_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Join the global prefix and a relative key into the full object key.
pub fn object_key(prefix: &str, rel: &str) -> String {
    let joined = format!("{}/{}", prefix.trim_end_matches('/'), s3_key(rel));
    s3_key(&joined).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharded_key_layout() {
        let key = ShardedKey::new("botany", "ab12cd34ef.jpg").unwrap();
        assert_eq!(key.shards(), ("ab", "12"));
        assert_eq!(key.relative_key(), "botany/originals/ab/12/ab12cd34ef.jpg");
        assert_eq!(key.to_string(), key.relative_key());
    }

    #[test]
    fn test_sharding_is_deterministic() {
        for name in ["0a1b2c.tif", "ffff", "deadbeef.png", "12345678901234.jpg"] {
            let a = ShardedKey::new("herbarium", name).unwrap();
            let b = ShardedKey::new("herbarium", name).unwrap();
            assert_eq!(a.relative_key(), b.relative_key());

            let (first, second) = a.shards();
            assert_eq!(first, &name[0..2]);
            assert_eq!(second, &name[2..4]);
            assert!(a.relative_key().ends_with(&format!("/{}/{}/{}", first, second, name)));
        }
    }

    #[test]
    fn test_sharded_key_exactly_four_chars() {
        let key = ShardedKey::new("c", "abcd").unwrap();
        assert_eq!(key.relative_key(), "c/originals/ab/cd/abcd");
    }

    #[test]
    fn test_sharded_key_multibyte_characters() {
        let key = ShardedKey::new("c", "éaüb.jpg").unwrap();
        assert_eq!(key.shards(), ("éa", "üb"));
    }

    #[test]
    fn test_sharded_key_rejects_bad_input() {
        assert_eq!(
            ShardedKey::new("botany", "abc"),
            Err(KeyError::TooShort("abc".to_string()))
        );
        assert_eq!(
            ShardedKey::new("botany", "ab/cd.jpg"),
            Err(KeyError::NotALeaf("ab/cd.jpg".to_string()))
        );
        assert_eq!(
            ShardedKey::new("", "abcd.jpg"),
            Err(KeyError::Empty("collection"))
        );
        assert_eq!(ShardedKey::new("botany", "  "), Err(KeyError::Empty("filename")));
    }

    #[test]
    fn test_object_key_prefix_handling() {
        assert_eq!(object_key("", "botany/x.jpg"), "botany/x.jpg");
        assert_eq!(object_key("media", "botany/x.jpg"), "media/botany/x.jpg");
        assert_eq!(object_key("media/", "/botany/x.jpg"), "media/botany/x.jpg");
        assert_eq!(s3_key("///a/b"), "a/b");
    }
}
