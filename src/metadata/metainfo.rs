use crate::{
    bencoding::Value,
    util::{pretty_info_hash, sha1_hash},
};
use anyhow::{bail, Context, Result};
use size::{Size, Style};
use std::{fmt, str};

use super::infodict::{self, MetainfoFile};

/// In-memory descriptor of a .torrent file.
#[derive(PartialEq, Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub url_list: Vec<String>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub piece_length: u64,     // number of bytes in each piece (integer)
    pub pieces: Vec<[u8; 20]>, // 20-byte SHA1 of each piece
    pub private: bool,
    pub info_hash: [u8; 20], // 20-byte SHA1 hash of the bencoded value of the info key
    pub file: MetainfoFile,
    total_length: u64,
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let files = self
            .get_files()
            .iter()
            .map(|f| format!("    - {} ({})", f.0, Size::from_bytes(f.1)))
            .collect::<Vec<String>>()
            .join("\n");
        write!(
            f,
            "announce: {}\nannounce-list: {:?}\nurl-list: {:?}\ncomment: {}\ncreated by: {}\npiece length: {}\nn. pieces: {}\ntotal length: {}\nprivate: {}\ninfo_hash: {}\nfiles:\n{}",
            self.announce,
            self.announce_list,
            self.url_list,
            self.comment.as_deref().unwrap_or("-"),
            self.created_by.as_deref().unwrap_or("-"),
            Size::from_bytes(self.piece_length).format().with_style(Style::Abbreviated),
            self.pieces.len(),
            Size::from_bytes(self.total_length()).format().with_style(Style::Abbreviated),
            self.private,
            pretty_info_hash(self.info_hash),
            files
        )
    }
}

fn utf8_string(v: &[u8], field: &str) -> Result<String> {
    match str::from_utf8(v) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => bail!("The .torrent file \"{field}\" is not an UTF-8 string"),
    }
}

fn optional_string(v: Option<&Value>, field: &str) -> Result<Option<String>> {
    match v {
        None => Ok(None),
        Some(Value::Str(s)) => utf8_string(s, field).map(Some),
        Some(_) => bail!("The .torrent file \"{field}\" is not a string"),
    }
}

impl Metainfo {
    pub fn from_bytes(contents: &[u8]) -> Result<Self> {
        let v = Value::new(contents).context("The .torrent file is not valid bencoding")?;
        Self::new(&v)
    }

    pub fn new(v: &Value) -> Result<Self> {
        let torrent_map = match v {
            Value::Dict(m) => m,
            _ => bail!("The .torrent file is invalid: it does not contain a dict"),
        };

        // announce-list
        let mut announce_list = Vec::new();
        match torrent_map.get(&b"announce-list"[..]) {
            None => {}
            Some(Value::List(tiers)) => {
                for tier in tiers {
                    let Value::List(announces_in_tier) = tier else {
                        bail!("The .torrent file \"announce-list\" does not contain a list of lists");
                    };
                    let mut tier_list = Vec::new();
                    for announce_url in announces_in_tier {
                        let Value::Str(announce_vec) = announce_url else {
                            bail!("The .torrent file \"announce-list\" has an element in a tier list that is not a string");
                        };
                        tier_list.push(utf8_string(announce_vec, "announce-list")?);
                    }
                    if tier_list.is_empty() {
                        bail!("The .torrent file \"announce-list\" has a tier list without elements");
                    }
                    announce_list.push(tier_list);
                }
            }
            Some(_) => bail!(
                "The .torrent file has a \"announce-list\" field but it does not contain a list"
            ),
        }

        // announce, falling back on the first tier of announce-list
        let announce = match torrent_map.get(&b"announce"[..]) {
            Some(Value::Str(announce_vec)) => utf8_string(announce_vec, "announce")?,
            Some(_) => bail!("The .torrent file \"announce\" is not a string"),
            None => match announce_list.first().and_then(|t| t.first()) {
                Some(a) => a.clone(),
                None => bail!("The .torrent file does not contain a valid \"announce\""),
            },
        };

        let mut url_list = Vec::new();
        match torrent_map.get(&b"url-list"[..]) {
            None => {}
            Some(Value::List(l)) => {
                for url_value in l {
                    let Value::Str(url_v) = url_value else {
                        bail!("The .torrent file \"url-list\" has an element that is not a string");
                    };
                    url_list.push(utf8_string(url_v, "url-list")?);
                }
            }
            Some(Value::Str(url_v)) => url_list.push(utf8_string(url_v, "url-list")?),
            Some(_) => bail!(
                "The .torrent file has a \"url-list\" field but it does not contain a list or string"
            ),
        }

        let creation_date = match torrent_map.get(&b"creation date"[..]) {
            None => None,
            Some(Value::Int(d)) => Some(*d),
            Some(_) => bail!("The .torrent file \"creation date\" is not an integer"),
        };

        // info dict
        let info_dict = match torrent_map.get(&b"info"[..]) {
            Some(Value::Dict(a)) => a,
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };
        let info_hash = sha1_hash(&Value::Dict(info_dict.clone()).encode());
        let info = infodict::get_infodict(info_dict)?;
        let total_length = match &info.file {
            MetainfoFile::SingleFile(m) => Some(m.length),
            MetainfoFile::MultiFile(m) => m
                .files
                .iter()
                .try_fold(0u64, |total, file| total.checked_add(file.length)),
        };
        let Some(total_length) = total_length else {
            bail!("The .torrent file is invalid: the total length of its files overflows 64 bits");
        };

        let metainfo = Metainfo {
            announce,
            announce_list,
            url_list,
            creation_date,
            comment: optional_string(torrent_map.get(&b"comment"[..]), "comment")?,
            created_by: optional_string(torrent_map.get(&b"created by"[..]), "created by")?,
            encoding: optional_string(torrent_map.get(&b"encoding"[..]), "encoding")?,
            piece_length: info.piece_length,
            pieces: info.pieces,
            private: info.private,
            info_hash,
            file: info.file,
            total_length,
        };

        let expected_pieces = metainfo.total_length().div_ceil(metainfo.piece_length);
        if expected_pieces != metainfo.pieces.len() as u64 {
            bail!(
                "The .torrent file has {} piece hashes but its total length requires {expected_pieces}",
                metainfo.pieces.len()
            );
        }
        if u32::try_from(metainfo.pieces.len()).is_err() {
            bail!("The .torrent file has too many pieces");
        }
        Ok(metainfo)
    }

    pub fn get_files(&self) -> Vec<(String, u64)> {
        match &self.file {
            MetainfoFile::SingleFile(m) => vec![(m.name.clone(), m.length)],
            MetainfoFile::MultiFile(m) => m
                .files
                .iter()
                .map(|file| (file.path.join("/"), file.length))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        match &self.file {
            MetainfoFile::SingleFile(m) => &m.name,
            MetainfoFile::MultiFile(m) => &m.name,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Size in bytes of piece `idx`, only the last piece can be shorter than `piece_length`.
    pub fn piece_size(&self, idx: u32) -> u64 {
        let begin = idx as u64 * self.piece_length;
        self.piece_length
            .min(self.total_length.saturating_sub(begin))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Builds a single file torrent descriptor for `content`, cut in pieces of `piece_length`.
    pub fn single_file_metainfo(name: &str, content: &[u8], piece_length: u64) -> Metainfo {
        let pieces: Vec<u8> = content
            .chunks(piece_length as usize)
            .flat_map(sha1_hash)
            .collect();
        let torrent = Value::dict([
            ("announce", Value::str("http://tracker.test/announce")),
            (
                "info",
                Value::dict([
                    ("name", Value::str(name)),
                    ("piece length", Value::Int(piece_length as i64)),
                    ("pieces", Value::Str(pieces)),
                    ("length", Value::Int(content.len() as i64)),
                ]),
            ),
        ]);
        Metainfo::new(&torrent).unwrap()
    }

    #[test]
    fn parse_single_file_torrent() {
        let content = vec![7u8; 40];
        let m = single_file_metainfo("file.bin", &content, 16);
        assert_eq!(m.announce, "http://tracker.test/announce");
        assert_eq!(m.piece_count(), 3);
        assert_eq!(m.piece_size(0), 16);
        assert_eq!(m.piece_size(2), 8);
        assert_eq!(m.total_length(), 40);
        assert_eq!(m.name(), "file.bin");
        assert_eq!(m.pieces[2], sha1_hash(&content[32..]));
    }

    #[test]
    fn info_hash_over_reencoded_info() {
        let info = Value::dict([
            ("name", Value::str("a")),
            ("piece length", Value::Int(4)),
            ("pieces", Value::Str(vec![1; 20])),
            ("length", Value::Int(3)),
        ]);
        let expected = sha1_hash(&info.encode());
        let source = Value::dict([
            ("announce", Value::str("http://t/a")),
            ("comment", Value::str("hello")),
            ("creation date", Value::Int(1700000000)),
            ("info", info),
        ])
        .encode();
        let m = Metainfo::from_bytes(&source).unwrap();
        assert_eq!(m.info_hash, expected);
        assert_eq!(m.comment.as_deref(), Some("hello"));
        assert_eq!(m.creation_date, Some(1700000000));
    }

    #[test]
    fn announce_list_fallback() {
        let torrent = Value::dict([
            (
                "announce-list",
                Value::List(vec![
                    Value::List(vec![Value::str("http://a/announce")]),
                    Value::List(vec![Value::str("http://b/announce")]),
                ]),
            ),
            (
                "info",
                Value::dict([
                    ("name", Value::str("a")),
                    ("piece length", Value::Int(4)),
                    ("pieces", Value::Str(vec![1; 20])),
                    ("length", Value::Int(3)),
                ]),
            ),
        ]);
        let m = Metainfo::new(&torrent).unwrap();
        assert_eq!(m.announce, "http://a/announce");
        assert_eq!(m.announce_list.len(), 2);
    }

    #[test]
    fn rejects_inconsistent_torrents() {
        assert!(Metainfo::new(&Value::Int(1)).is_err());
        assert!(Metainfo::from_bytes(b"d8:announce").is_err());
        let torrent = Value::dict([
            ("announce", Value::str("http://t/a")),
            (
                "info",
                Value::dict([
                    ("name", Value::str("a")),
                    ("piece length", Value::Int(4)),
                    ("pieces", Value::Str(vec![1; 20])),
                    ("length", Value::Int(30)), // needs 8 pieces
                ]),
            ),
        ]);
        assert!(Metainfo::new(&torrent).is_err());
    }

    #[test]
    fn rejects_total_length_overflow() {
        let file = |path: &str| {
            Value::dict([
                ("length", Value::Int(i64::MAX)),
                ("path", Value::List(vec![Value::str(path)])),
            ])
        };
        let torrent = Value::dict([
            ("announce", Value::str("http://t/a")),
            (
                "info",
                Value::dict([
                    ("name", Value::str("big")),
                    ("piece length", Value::Int(1 << 20)),
                    ("pieces", Value::Str(vec![1; 20])),
                    ("files", Value::List(vec![file("a"), file("b"), file("c")])),
                ]),
            ),
        ]);
        let err = Metainfo::new(&torrent).unwrap_err();
        assert!(err.to_string().contains("overflows"), "{err:#}");
    }
}
