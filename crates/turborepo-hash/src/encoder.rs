/// Canonical byte encoding for structure hashing.
///
/// Rules, in order of importance:
/// - strings and byte runs are length-prefixed (u32 little-endian), so
///   `["ab", "c"]` and `["a", "bc"]` encode differently;
/// - lists are count-prefixed and preserve element order;
/// - maps are emitted sorted by key, so insertion order never leaks into
///   the hash;
/// - optional values carry an explicit present/absent tag, keeping "unset"
///   distinct from the empty string.
#[derive(Default)]
pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_option_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.buf.push(1);
                self.write_str(value);
            }
            None => self.buf.push(0),
        }
    }

    pub fn write_str_list<S: AsRef<str>>(&mut self, values: &[S]) {
        self.buf
            .extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            self.write_str(value.as_ref());
        }
    }

    /// Emits `pairs` sorted by key. Callers hand over whatever order they
    /// have; the encoding is the same regardless.
    pub fn write_sorted_map<K: AsRef<str>, V: AsRef<str>>(&mut self, pairs: &mut Vec<(K, V)>) {
        pairs.sort_by(|(a, _), (b, _)| a.as_ref().cmp(b.as_ref()));
        self.buf
            .extend_from_slice(&(pairs.len() as u32).to_le_bytes());
        for (key, value) in pairs {
            self.write_str(key.as_ref());
            self.write_str(value.as_ref());
        }
    }
}
