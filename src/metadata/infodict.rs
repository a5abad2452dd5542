use std::collections::BTreeMap;

use crate::bencoding::Value;
use anyhow::{bail, Result};
use std::str;

#[derive(PartialEq, Debug, Clone)]
pub enum MetainfoFile {
    SingleFile(MetainfoSingleFile),
    MultiFile(MetainfoMultiFile),
}

#[derive(PartialEq, Debug, Clone)]
pub struct MetainfoSingleFile {
    pub name: String,           // the filename. This is purely advisory. (string)
    pub length: u64,            // length of the file in bytes. (integer)
    pub md5sum: Option<String>, // 32-character hexadecimal string of the MD5 sum of the file
}

#[derive(PartialEq, Debug, Clone)]
pub struct MetainfoMultiFile {
    pub name: String, // the name of the directory in which to store all the files. This is purely advisory. (string)
    pub files: Vec<MultifileFile>, // a list of dictionaries, one for each file.
}

#[derive(PartialEq, Debug, Clone)]
pub struct MultifileFile {
    pub length: u64, // length of the file in bytes. (integer)
    pub path: Vec<String>, // path elements, the last one being the file name: "dir1/dir2/file.ext" is l4:dir14:dir28:file.exte
    pub md5sum: Option<String>,
}

pub struct InfoDict {
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub private: bool,
    pub file: MetainfoFile,
}

fn get_utf8(dict: &BTreeMap<Vec<u8>, Value>, key: &str, field: &str) -> Result<Option<String>> {
    match dict.get(key.as_bytes()) {
        None => Ok(None),
        Some(Value::Str(s)) => match str::from_utf8(s) {
            Ok(s) => Ok(Some(s.to_string())),
            _ => bail!("The .torrent file \"{field}\" kv is not an UTF8 string"),
        },
        Some(_) => bail!("The .torrent file \"{field}\" kv is not a string"),
    }
}

fn get_length(dict: &BTreeMap<Vec<u8>, Value>, field: &str) -> Result<Option<u64>> {
    match dict.get(&b"length"[..]) {
        None => Ok(None),
        Some(Value::Int(a)) if *a >= 0 => Ok(Some(*a as u64)),
        Some(Value::Int(_)) => bail!("The .torrent file \"{field}\" kv cannot be < 0"),
        Some(_) => bail!("The .torrent file \"{field}\" kv is not an integer"),
    }
}

// a path element must name something inside the download directory
fn validate_path_element(p: &str, field: &str) -> Result<()> {
    if p.is_empty() || p == "." || p == ".." || p.contains('/') || p.contains('\\') {
        bail!("The .torrent file \"{field}\" contains an invalid path element \"{p}\"");
    }
    Ok(())
}

pub fn get_infodict(info_dict: &BTreeMap<Vec<u8>, Value>) -> Result<InfoDict> {
    // file / dir name
    let name_string = match get_utf8(info_dict, "name", "info.name")? {
        Some(n) => n,
        None => bail!("The .torrent file does not contain a valid \"info.name\""),
    };
    validate_path_element(&name_string, "info.name")?;

    // piece length
    let piece_length = match info_dict.get(&b"piece length"[..]) {
        Some(Value::Int(a)) if *a > 0 => *a as u64,
        Some(Value::Int(_)) => bail!("The .torrent file \"info.piece length\" kv must be > 0"),
        _ => bail!("The .torrent file does not contain a valid \"info.piece length\""),
    };

    // pieces
    let pieces = match info_dict.get(&b"pieces"[..]) {
        Some(Value::Str(pieces_byte_vec)) => {
            if pieces_byte_vec.len() % 20 != 0 {
                bail!(
                    "The .torrent file contains \"info.pieces\" that is not a string of length divisible by 20"
                );
            }
            pieces_byte_vec
                .chunks_exact(20)
                .map(|c| {
                    let mut piece = [0u8; 20];
                    piece.copy_from_slice(c);
                    piece
                })
                .collect::<Vec<_>>()
        }
        _ => bail!("The .torrent file does not contain a valid \"info.pieces\""),
    };

    let private = matches!(info_dict.get(&b"private"[..]), Some(Value::Int(1)));

    // file / files
    let file = match (info_dict.get(&b"length"[..]), info_dict.get(&b"files"[..])) {
        (Some(_), Some(_)) => bail!(
            "The .torrent file contains both \"info.length\" and \"info.files\""
        ),
        (Some(_), None) => MetainfoFile::SingleFile(MetainfoSingleFile {
            name: name_string,
            length: get_length(info_dict, "info.length")?.unwrap_or_default(),
            md5sum: get_utf8(info_dict, "md5sum", "info.md5sum")?,
        }),
        (None, Some(Value::List(files_list))) => {
            let mut files = Vec::new();
            for f in files_list {
                let entry = match f {
                    Value::Dict(a) => a,
                    _ => {
                        bail!("The .torrent file \"info.files\" kv has an entry that is not a dict")
                    }
                };

                let Some(length) = get_length(entry, "info.files.length")? else {
                    bail!("The .torrent file \"info.files\" kv has an entry that has no valid \"length\"");
                };

                let entry_path_value_list = match entry.get(&b"path"[..]) {
                    Some(Value::List(a)) if !a.is_empty() => a,
                    _ => bail!(
                        "The .torrent file \"info.files\" kv has an entry that has no valid \"path\""
                    ),
                };
                let mut path = Vec::new();
                for e in entry_path_value_list {
                    let p = match e {
                        Value::Str(a) => match str::from_utf8(a) {
                            Ok(a) => a.to_string(),
                            _ => bail!(
                                "The .torrent file \"info.files\" kv has an entry with \"path\" with an element that is not an UTF8 string"
                            ),
                        },
                        _ => bail!(
                            "The .torrent file \"info.files\" kv has an entry with \"path\" with an element that is not a string"
                        ),
                    };
                    validate_path_element(&p, "info.files.path")?;
                    path.push(p);
                }

                files.push(MultifileFile {
                    length,
                    path,
                    md5sum: get_utf8(entry, "md5sum", "info.files.md5sum")?,
                })
            }
            if files.is_empty() {
                bail!("The .torrent file \"info.files\" kv is empty");
            }
            MetainfoFile::MultiFile(MetainfoMultiFile {
                name: name_string,
                files,
            })
        }
        (None, Some(_)) => bail!("The .torrent file \"info.files\" kv is not a list"),
        (None, None) => bail!(
            "The .torrent file does not contain either a valid \"info.length\" or a \"info.files\""
        ),
    };

    Ok(InfoDict {
        piece_length,
        pieces,
        private,
        file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_info() -> BTreeMap<Vec<u8>, Value> {
        match Value::dict([
            ("name", Value::str("data")),
            ("piece length", Value::Int(16)),
            ("pieces", Value::Str(vec![0; 40])),
        ]) {
            Value::Dict(d) => d,
            _ => unreachable!(),
        }
    }

    #[test]
    fn single_file() {
        let mut info = base_info();
        info.insert(b"length".to_vec(), Value::Int(20));
        info.insert(b"md5sum".to_vec(), Value::str("abc"));
        let parsed = get_infodict(&info).unwrap();
        assert_eq!(parsed.pieces.len(), 2);
        assert_eq!(
            parsed.file,
            MetainfoFile::SingleFile(MetainfoSingleFile {
                name: "data".to_string(),
                length: 20,
                md5sum: Some("abc".to_string()),
            })
        );
    }

    #[test]
    fn multi_file() {
        let mut info = base_info();
        info.insert(b"private".to_vec(), Value::Int(1));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![
                Value::dict([
                    ("length", Value::Int(5)),
                    ("path", Value::List(vec![Value::str("a"), Value::str("b.txt")])),
                ]),
                Value::dict([
                    ("length", Value::Int(15)),
                    ("path", Value::List(vec![Value::str("c.txt")])),
                ]),
            ]),
        );
        let parsed = get_infodict(&info).unwrap();
        assert!(parsed.private);
        assert_matches!(parsed.file, MetainfoFile::MultiFile(m) if m.files.len() == 2 && m.files[0].path == vec!["a", "b.txt"]);
    }

    #[test]
    fn rejects_invalid() {
        let mut info = base_info();
        assert!(get_infodict(&info).is_err()); // neither length nor files

        info.insert(b"pieces".to_vec(), Value::Str(vec![0; 21]));
        info.insert(b"length".to_vec(), Value::Int(20));
        assert!(get_infodict(&info).is_err());

        let mut info = base_info();
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::dict([
                ("length", Value::Int(5)),
                ("path", Value::List(vec![Value::str(".."), Value::str("etc")])),
            ])]),
        );
        assert!(get_infodict(&info).is_err());

        let mut info = base_info();
        info.insert(b"length".to_vec(), Value::Int(-1));
        assert!(get_infodict(&info).is_err());
    }
}
