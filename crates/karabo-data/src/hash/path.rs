//! Path grammar: `a.b[3].c`.
//!
//! A `.` separates segments; a trailing `[n]` on a segment selects element
//! `n` of the vector of Hash stored at that key. Keys never contain `.`, `[`
//! or `]`, so splitting on the separator is unambiguous.

/// Path separator.
pub const SEPARATOR: char = '.';

/// One parsed step of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub key: &'a str,
    pub index: Option<usize>,
}

impl<'a> Segment<'a> {
    /// Strict parse of a single segment; `None` if malformed.
    pub fn parse(text: &'a str) -> Option<Self> {
        match text.find('[') {
            None => {
                if text.is_empty() || text.contains(']') {
                    None
                } else {
                    Some(Self {
                        key: text,
                        index: None,
                    })
                }
            }
            Some(open) => {
                let key = &text[..open];
                let digits = text[open + 1..].strip_suffix(']')?;
                if key.is_empty()
                    || digits.is_empty()
                    || !digits.bytes().all(|b| b.is_ascii_digit())
                {
                    return None;
                }
                Some(Self {
                    key,
                    index: Some(digits.parse().ok()?),
                })
            }
        }
    }

    /// Lenient parse used on the write path: malformed text is a plain key.
    pub fn parse_lenient(text: &'a str) -> Self {
        Self::parse(text).unwrap_or(Self {
            key: text,
            index: None,
        })
    }
}

/// Strict parse of a whole path.
pub fn parse(path: &str) -> Option<Vec<Segment<'_>>> {
    if path.is_empty() {
        return None;
    }
    path.split(SEPARATOR).map(Segment::parse).collect()
}

/// Split a write path into lenient parent segments and the final segment.
pub fn split_for_write(path: &str) -> (Vec<Segment<'_>>, Segment<'_>) {
    match path.rsplit_once(SEPARATOR) {
        Some((parents, last)) => (
            parents.split(SEPARATOR).map(Segment::parse_lenient).collect(),
            Segment::parse_lenient(last),
        ),
        None => (Vec::new(), Segment::parse_lenient(path)),
    }
}

/// Join a prefix and a key with the separator.
#[must_use]
pub fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{SEPARATOR}{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indexed_path() {
        let segs = parse("a.b[3].c").unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[1], Segment { key: "b", index: Some(3) });
        assert_eq!(segs[2].index, None);
    }

    #[test]
    fn test_malformed_paths_rejected() {
        assert!(parse("").is_none());
        assert!(parse("a..b").is_none());
        assert!(parse("a[x]").is_none());
        assert!(parse("a[1").is_none());
        assert!(parse("[1]").is_none());
    }

    #[test]
    fn test_split_for_write() {
        let (parents, last) = split_for_write("x.y[2].z");
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[1].index, Some(2));
        assert_eq!(last, Segment { key: "z", index: None });
        assert_eq!(split_for_write("k").1.key, "k");
        assert_eq!(split_for_write("a.v[4]").1, Segment { key: "v", index: Some(4) });
    }
}
