use crate::{bencoding::Value, util::pretty_info_hash};
use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use size::{Size, Style};
use std::{fmt, str};

use super::infodict::{self, MetainfoFile};

#[derive(PartialEq, Debug, Clone)]
pub struct Metainfo {
    pub announce_list: Vec<Vec<String>>, // tracker tiers, primary first
    pub url_list: Vec<String>,           // web seed base urls
    pub piece_length: u64,               // number of bytes in each piece
    pub pieces: Vec<[u8; 20]>,           // 20-byte SHA1 of each piece
    pub info_hash: [u8; 20], // 20-byte SHA1 of the info dict as it appeared in the source bytes
    pub file: MetainfoFile,
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
            "announces: {:?}\nurl-list: {:?}\npiece_length: {}\nn. pieces: {}\ninfo_hash: {}\nfiles:\n{}",
            self.announce_list,
            self.url_list,
            Size::from_bytes(self.piece_length).format().with_style(Style::Abbreviated),
            self.pieces.len(),
            pretty_info_hash(self.info_hash),
            files
        )
    }
}

impl Metainfo {
    /// Parses the decoded metainfo value. `source` must be the original byte
    /// buffer `v` was decoded from: the info hash is computed over the exact
    /// byte span of the info dict, never over a re-encode.
    pub fn new(v: &Value, source: &[u8]) -> Result<Self> {
        let torrent_map = match v {
            Value::Dict(m, _, _) => m,
            _ => bail!("The .torrent file is invalid: it does not contain a dict"),
        };

        // announce / announce-list
        let mut announces = Vec::new();

        match torrent_map.get(&b"announce-list".to_vec()) {
            None => {}
            Some(Value::List(announce_list)) => {
                for tier in announce_list {
                    if let Value::List(announces_in_tier) = tier {
                        let mut tier_list = Vec::new();
                        for announce_url in announces_in_tier {
                            if let Value::Str(announce_vec) = announce_url {
                                if let Ok(a) = str::from_utf8(announce_vec) {
                                    tier_list.push(a.to_string());
                                } else {
                                    bail!("The .torrent file \"announce-list\" has an element in a tier list that is not an UTF-8 string");
                                }
                            } else {
                                bail!("The .torrent file \"announce-list\" has an element in a tier list that is not a string");
                            }
                        }
                        if tier_list.is_empty() {
                            bail!("The .torrent file \"announce-list\" has a tier list without elements");
                        }
                        announces.push(tier_list);
                    } else {
                        bail!(
                            "The .torrent file \"announce-list\" does not contain a list of lists"
                        );
                    }
                }
            }
            Some(_) => bail!(
                "The .torrent file has a \"announce-list\" field but it does not contain a list"
            ),
        }

        if announces.is_empty() {
            if let Some(Value::Str(announce_vec)) = torrent_map.get(&b"announce".to_vec()) {
                match str::from_utf8(announce_vec) {
                    Ok(a) => announces.push(vec![a.to_string()]),
                    _ => bail!("The .torrent file \"announce\" is not an UTF8 string"),
                }
            }
        }

        // url-list (web seeds), either a single string or a list of strings
        let mut url_list = Vec::new();
        match torrent_map.get(&b"url-list".to_vec()) {
            None => {}
            Some(Value::List(l)) => {
                for url_value in l {
                    if let Value::Str(url_v) = url_value {
                        if let Ok(url) = str::from_utf8(url_v) {
                            url_list.push(url.to_string());
                        } else {
                            bail!("The .torrent file \"url-list\" has an element that is not an UTF-8 string");
                        }
                    } else {
                        bail!("The .torrent file \"url-list\" has an element that is not a string");
                    }
                }
            }
            Some(Value::Str(url_v)) => {
                if let Ok(url) = str::from_utf8(url_v) {
                    url_list.push(url.to_string());
                } else {
                    bail!("The .torrent file \"url-list\" has an element that is not an UTF-8 string");
                }
            }
            Some(_) => bail!(
                "The .torrent file has a \"url-list\" field but it does not contain a list or string"
            ),
        }

        // info dict
        let (info_dict, info_hash) = match torrent_map.get(&b"info".to_vec()) {
            Some(Value::Dict(a, s, e)) => {
                let digest: [u8; 20] = Sha1::digest(&source[*s..*e]).into();
                (a, digest)
            }
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };

        let (piece_length, pieces, file) = infodict::get_infodict(info_dict)?;

        Ok(Metainfo {
            announce_list: announces,
            url_list,
            piece_length,
            pieces,
            info_hash,
            file,
        })
    }

    /// The payload name: a file name for single-file torrents, the enclosing
    /// directory name for multi-file torrents.
    pub fn name(&self) -> &str {
        match &self.file {
            MetainfoFile::SingleFile(m) => &m.name,
            MetainfoFile::MultiFile(m) => &m.name,
        }
    }

    /// Flattens the file layout into (relative path, length) pairs. Multi-file
    /// payloads live under a directory named after the torrent.
    pub fn get_files(&self) -> Vec<(String, u64)> {
        match &self.file {
            MetainfoFile::SingleFile(m) => {
                vec![(m.name.clone(), m.length)]
            }
            MetainfoFile::MultiFile(m) => {
                let mut files = Vec::new();
                for file in &m.files {
                    files.push((format!("{}/{}", m.name, file.path.join("/")), file.length))
                }
                files
            }
        }
    }

    pub fn total_length(&self) -> u64 {
        self.get_files().iter().map(|(_, len)| len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencoding::Value;
    use crate::metadata::infodict::{MetainfoMultiFile, MetainfoSingleFile, MultifileFile};

    fn single_file_torrent_bytes() -> Vec<u8> {
        let mut source = Vec::new();
        source.extend_from_slice(b"d8:announce28:http://tracker.test/announce");
        source.extend_from_slice(b"8:url-listl23:http://seed.test/files/e");
        source.extend_from_slice(b"4:infod6:lengthi32768e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        source.extend_from_slice(&[0xaa; 20]);
        source.extend_from_slice(&[0xbb; 20]);
        source.extend_from_slice(b"ee");
        source
    }

    #[test]
    fn parse_single_file_torrent() {
        let source = single_file_torrent_bytes();
        let v = Value::new(&source);
        let m = Metainfo::new(&v, &source).unwrap();
        assert_eq!(
            m.announce_list,
            vec![vec!["http://tracker.test/announce".to_string()]]
        );
        assert_eq!(m.url_list, vec!["http://seed.test/files/".to_string()]);
        assert_eq!(m.piece_length, 16384);
        assert_eq!(m.pieces, vec![[0xaa; 20], [0xbb; 20]]);
        assert_eq!(
            m.file,
            MetainfoFile::SingleFile(MetainfoSingleFile {
                name: "test.bin".to_string(),
                length: 32768,
            })
        );
        assert_eq!(m.total_length(), 32768);
        assert_eq!(m.get_files(), vec![("test.bin".to_string(), 32768)]);
    }

    #[test]
    fn info_hash_is_over_the_source_byte_span() {
        let source = single_file_torrent_bytes();
        let v = Value::new(&source);
        let m = Metainfo::new(&v, &source).unwrap();

        // locate the info dict span by hand: it starts right after the
        // "4:info" key and runs to the second-to-last byte of the file
        let key_pos = source
            .windows(6)
            .position(|w| w == b"4:info")
            .expect("info key present");
        let info_span = &source[key_pos + 6..source.len() - 1];
        assert_eq!(info_span[0], b'd');
        assert_eq!(info_span[info_span.len() - 1], b'e');
        let expected: [u8; 20] = Sha1::digest(info_span).into();
        assert_eq!(m.info_hash, expected);
    }

    #[test]
    fn parse_multi_file_torrent() {
        let mut source = Vec::new();
        source.extend_from_slice(b"d8:announce28:http://tracker.test/announce");
        source.extend_from_slice(b"4:infod");
        source.extend_from_slice(b"5:filesl");
        source.extend_from_slice(b"d6:lengthi10000e4:pathl1:aee");
        source.extend_from_slice(b"d6:lengthi25000e4:pathl3:sub1:beee");
        source.extend_from_slice(b"e");
        source.extend_from_slice(b"4:name3:dir12:piece lengthi16384e6:pieces60:");
        source.extend_from_slice(&[0x01; 60]);
        source.extend_from_slice(b"ee");

        let v = Value::new(&source);
        let m = Metainfo::new(&v, &source).unwrap();
        assert_eq!(
            m.file,
            MetainfoFile::MultiFile(MetainfoMultiFile {
                name: "dir".to_string(),
                files: vec![
                    MultifileFile {
                        length: 10000,
                        path: vec!["a".to_string()],
                    },
                    MultifileFile {
                        length: 25000,
                        path: vec!["sub".to_string(), "b".to_string()],
                    },
                ],
            })
        );
        // multi-file payloads are laid out under the torrent name directory
        assert_eq!(
            m.get_files(),
            vec![
                ("dir/a".to_string(), 10000),
                ("dir/sub/b".to_string(), 25000),
            ]
        );
        assert_eq!(m.total_length(), 35000);
    }

    #[test]
    fn announce_list_takes_precedence_over_announce() {
        let mut source = Vec::new();
        source.extend_from_slice(b"d8:announce14:http://old.one13:announce-listll15:udp://tier.one/el15:http://back.up/ee");
        source.extend_from_slice(b"4:infod6:lengthi16384e4:name1:f12:piece lengthi16384e6:pieces20:");
        source.extend_from_slice(&[0x02; 20]);
        source.extend_from_slice(b"ee");
        let v = Value::new(&source);
        let m = Metainfo::new(&v, &source).unwrap();
        assert_eq!(
            m.announce_list,
            vec![
                vec!["udp://tier.one/".to_string()],
                vec!["http://back.up/".to_string()],
            ]
        );
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let mut source = Vec::new();
        source.extend_from_slice(b"d4:infod6:lengthi16384e4:name1:f12:piece lengthi16384e6:pieces21:");
        source.extend_from_slice(&[0x02; 21]);
        source.extend_from_slice(b"ee");
        let v = Value::new(&source);
        assert!(Metainfo::new(&v, &source).is_err());
    }

    #[test]
    fn rejects_empty_files_list() {
        let source = b"d4:infod5:filesle4:name1:f12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee".to_vec();
        let v = Value::new(&source);
        assert!(Metainfo::new(&v, &source).is_err());
    }

    #[test]
    fn rejects_missing_info() {
        let source = b"d8:announce14:http://old.onee".to_vec();
        let v = Value::new(&source);
        assert!(Metainfo::new(&v, &source).is_err());
    }
}
