// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-oriented input files for the load path.
//!
//! Format, one record per line:
//!
//! ```text
//! <tag> : [ v0, v1, …, v{d-1} ]
//! <tag> : [ ]        # empty list = delete the record with this tag
//! ```
//!
//! The file is mmapped and indexed once; items are lent out as string
//! views. Whitespace around separators is tolerated. The two reserved
//! sentinel tag values (`2^64-1`, `2^64-2`) are rejected here, at the
//! parse boundary, so no sentinel ever reaches a node.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use ivory_core::{Error, Result, DELETED_TAG, INVALID_TAG};

/// Vector body of one input line.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedVector {
    /// `[ ]` — delete the record carrying this line's tag.
    Empty,
    Values(Vec<f64>),
}

struct Item {
    tag_offset: usize,
    data_offset: usize,
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Owned(buf) => buf,
        }
    }
}

pub struct InputData {
    backing: Backing,
    items: Vec<Item>,
}

impl InputData {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Self::build(Backing::Mapped(map))
    }

    /// In-memory variant, mostly for tests and query references.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::build(Backing::Owned(bytes))
    }

    fn build(backing: Backing) -> Result<Self> {
        let data = backing.bytes();
        let mut items = Vec::new();

        let mut offset = 0;
        while offset < data.len() {
            let Some(colon) = find_byte(&data[offset..], b':') else {
                break;
            };
            items.push(Item {
                tag_offset: offset,
                data_offset: offset + colon + 1,
            });
            offset += colon + 1;
            match find_byte(&data[offset..], b'\n') {
                Some(nl) => offset += nl + 1,
                None => {
                    offset = data.len();
                }
            }
        }

        if offset != data.len() {
            return Err(Error::Parse(
                "trailing garbage after last input record".into(),
            ));
        }

        Ok(InputData { backing, items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// String views of one item: the text before the `:` and the vector
    /// body after it (up to the end of the line).
    pub fn item(&self, index: usize) -> Option<(&str, &str)> {
        let item = self.items.get(index)?;
        let data = self.backing.bytes();

        let tag_end = item.data_offset - 1;
        let body_end = match self.items.get(index + 1) {
            Some(next) => next.tag_offset,
            None => data.len(),
        };

        let tag = std::str::from_utf8(&data[item.tag_offset..tag_end]).ok()?;
        let body = std::str::from_utf8(&data[item.data_offset..body_end]).ok()?;
        Some((tag, body))
    }

    /// Parses and validates the tag of one item.
    pub fn tag(&self, index: usize) -> Result<u64> {
        let (tag_text, _) = self
            .item(index)
            .ok_or_else(|| Error::NotFound(format!("input item {index} out of range")))?;
        parse_tag(tag_text)
    }

    /// Parses the vector body of one item.
    pub fn vector(&self, index: usize) -> Result<ParsedVector> {
        let (_, body) = self
            .item(index)
            .ok_or_else(|| Error::NotFound(format!("input item {index} out of range")))?;
        parse_vector_body(body)
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

pub fn parse_tag(text: &str) -> Result<u64> {
    let tag: u64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("invalid tag '{}'", text.trim())))?;
    if tag == INVALID_TAG || tag == DELETED_TAG {
        return Err(Error::Validation(format!("tag {tag} is reserved")));
    }
    Ok(tag)
}

pub fn parse_vector_body(body: &str) -> Result<ParsedVector> {
    let open = body
        .find('[')
        .ok_or_else(|| Error::Parse("vector body has no opening bracket".into()))?;
    let rest = &body[open + 1..];
    let close = rest
        .find(']')
        .ok_or_else(|| Error::Parse("vector body has no closing bracket".into()))?;

    let inner = rest[..close].trim();
    if inner.is_empty() {
        return Ok(ParsedVector::Empty);
    }

    let mut values = Vec::new();
    for piece in inner.split(',') {
        let piece = piece.trim();
        let value: f64 = piece
            .parse()
            .map_err(|_| Error::Parse(format!("invalid vector element '{piece}'")))?;
        values.push(value);
    }
    Ok(ParsedVector::Values(values))
}

/// Writes a synthetic input file: tags `start .. start+count`, every
/// coordinate of record `n` equal to `n.1`.
pub struct InputGenerator;

impl InputGenerator {
    pub fn generate(path: &Path, dim: usize, count: usize, start: usize) -> Result<()> {
        if dim == 0 || count == 0 {
            return Err(Error::Validation(
                "generator needs a nonzero dimension and count".into(),
            ));
        }

        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = BufWriter::new(file);

        for i in 0..count {
            let n = start + i;
            write!(out, "{n} : [ ").map_err(|e| Error::io(path, e))?;
            for j in 0..dim {
                if j + 1 < dim {
                    write!(out, "{n}.1, ").map_err(|e| Error::io(path, e))?;
                } else {
                    write!(out, "{n}.1").map_err(|e| Error::io(path, e))?;
                }
            }
            writeln!(out, " ]").map_err(|e| Error::io(path, e))?;
        }

        out.flush().map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(text: &str) -> InputData {
        InputData::from_bytes(text.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn indexes_items_and_lends_views() {
        let data = input("1 : [ 1.5, 2.5 ]\n2 : [ ]\n");
        assert_eq!(data.len(), 2);
        assert_eq!(data.tag(0).unwrap(), 1);
        assert_eq!(data.tag(1).unwrap(), 2);
        assert_eq!(
            data.vector(0).unwrap(),
            ParsedVector::Values(vec![1.5, 2.5])
        );
        assert_eq!(data.vector(1).unwrap(), ParsedVector::Empty);
    }

    #[test]
    fn tolerates_tight_and_loose_whitespace() {
        let data = input("7:[1,2,3]\n8 :  [  4.0 ,5.0,  6.0  ]\n9: []\n");
        assert_eq!(data.vector(0).unwrap(), ParsedVector::Values(vec![1.0, 2.0, 3.0]));
        assert_eq!(data.vector(1).unwrap(), ParsedVector::Values(vec![4.0, 5.0, 6.0]));
        assert_eq!(data.vector(2).unwrap(), ParsedVector::Empty);
    }

    #[test]
    fn negative_values_parse() {
        let data = input("1 : [ -1.5, 2 ]\n");
        assert_eq!(
            data.vector(0).unwrap(),
            ParsedVector::Values(vec![-1.5, 2.0])
        );
    }

    #[test]
    fn reserved_tags_are_rejected() {
        assert!(matches!(
            parse_tag("18446744073709551615"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_tag("18446744073709551614"),
            Err(Error::Validation(_))
        ));
        assert_eq!(parse_tag(" 42 ").unwrap(), 42);
    }

    #[test]
    fn malformed_bodies_fail() {
        assert!(parse_vector_body("1, 2, 3").is_err());
        assert!(parse_vector_body("[ 1, 2").is_err());
        assert!(parse_vector_body("[ 1, x ]").is_err());
    }

    #[test]
    fn missing_trailing_newline_is_fine() {
        let data = input("1 : [ 1 ]\n2 : [ 2 ]");
        assert_eq!(data.len(), 2);
        assert_eq!(data.vector(1).unwrap(), ParsedVector::Values(vec![2.0]));
    }

    #[test]
    fn generator_round_trips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.data");
        InputGenerator::generate(&path, 3, 4, 10).unwrap();

        let data = InputData::open(&path).unwrap();
        assert_eq!(data.len(), 4);
        assert_eq!(data.tag(0).unwrap(), 10);
        assert_eq!(data.tag(3).unwrap(), 13);
        assert_eq!(
            data.vector(2).unwrap(),
            ParsedVector::Values(vec![12.1, 12.1, 12.1])
        );
    }

    #[test]
    fn generator_rejects_degenerate_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.data");
        assert!(InputGenerator::generate(&path, 0, 4, 0).is_err());
        assert!(InputGenerator::generate(&path, 4, 0, 0).is_err());
    }
}
