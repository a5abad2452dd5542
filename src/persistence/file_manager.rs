use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use size::Size;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::bitfield::Bitfield;
use crate::metadata::infodict::MetainfoFile;
use crate::metadata::metainfo::Metainfo;
use crate::torrent_protocol::wire_protocol::BlockRequest;
use crate::util::{pretty_info_hash, sha1_hash};

/// Storage of one torrent.
///
/// Every verified piece is kept in its own file, `<torrent dir>/<piece index>.bin`, where
/// `<torrent dir>` is the hex info hash under the download directory. Blocks served to other
/// peers are read back from these files. Once the download completes the pieces are assembled
/// into the files the torrent describes.
pub struct FileManager {
    torrent_dir: PathBuf,
    file_list: Vec<(PathBuf, u64)>, // path relative to the torrent dir, size
    piece_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    total_length: u64,
}

impl FileManager {
    pub fn new(download_dir: &Path, metainfo: &Metainfo) -> Self {
        let root = match &metainfo.file {
            MetainfoFile::SingleFile(_) => PathBuf::new(),
            MetainfoFile::MultiFile(m) => PathBuf::from(&m.name),
        };
        let file_list = metainfo
            .get_files()
            .into_iter()
            .map(|(path, size)| (root.join(path), size))
            .collect();
        FileManager {
            torrent_dir: download_dir.join(pretty_info_hash(metainfo.info_hash)),
            file_list,
            piece_length: metainfo.piece_length,
            piece_hashes: metainfo.pieces.clone(),
            total_length: metainfo.total_length(),
        }
    }

    #[cfg(test)]
    pub fn torrent_dir(&self) -> &Path {
        &self.torrent_dir
    }

    fn piece_path(&self, piece_idx: u32) -> PathBuf {
        self.torrent_dir.join(format!("{piece_idx}.bin"))
    }

    fn piece_size(&self, piece_idx: u32) -> u64 {
        let begin = piece_idx as u64 * self.piece_length;
        self.piece_length
            .min(self.total_length.saturating_sub(begin))
    }

    /// Persists a verified piece. The file appears under its final name only once fully written.
    pub async fn flush(&self, piece_idx: u32, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.torrent_dir)
            .await
            .with_context(|| format!("could not create directory {:?}", self.torrent_dir))?;
        let path = self.piece_path(piece_idx);
        let tmp_path = path.with_extension("part");
        let mut f = File::create(&tmp_path)
            .await
            .with_context(|| format!("could not create piece file {tmp_path:?}"))?;
        f.write_all(data).await?;
        f.sync_all().await?;
        drop(f);
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("could not move piece file to {path:?}"))?;
        Ok(())
    }

    pub async fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>> {
        let end = request.block_begin as u64 + request.data_len as u64;
        if request.piece_idx as usize >= self.piece_hashes.len()
            || end > self.piece_size(request.piece_idx)
        {
            bail!("requested block is out of range: {request}");
        }
        let path = self.piece_path(request.piece_idx);
        let mut f = File::open(&path)
            .await
            .with_context(|| format!("could not open piece file {path:?}"))?;
        f.seek(SeekFrom::Start(request.block_begin as u64)).await?;
        let mut buf = vec![0; request.data_len as usize];
        f.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Hash-checks the pieces already on disk and sets them in `bitfield`. Returns the number of
    /// bytes already downloaded.
    pub async fn verify_existing(&self, bitfield: &Bitfield) -> u64 {
        log::info!("checking pieces already downloaded in {:?}...", self.torrent_dir);
        let mut verified_bytes = 0;
        for (idx, expected_hash) in self.piece_hashes.iter().enumerate() {
            let idx = idx as u32;
            let Ok(data) = fs::read(self.piece_path(idx)).await else {
                continue;
            };
            if data.len() as u64 == self.piece_size(idx) && sha1_hash(&data) == *expected_hash {
                bitfield.set(idx);
                verified_bytes += data.len() as u64;
            } else {
                log::debug!("piece {idx} on disk is corrupted, it will be downloaded again");
            }
        }
        log::info!(
            "checking pieces already downloaded completed: {} out of {} pieces ({}) already completed",
            bitfield.count_set(),
            self.piece_hashes.len(),
            Size::from_bytes(verified_bytes)
        );
        verified_bytes
    }

    /// Concatenates all pieces in index order and splits them across the torrent files. Returns
    /// the path of the single file or of the top directory of a multi-file torrent.
    pub async fn assemble(&self) -> Result<PathBuf> {
        let mut files = self.file_list.iter();
        let mut current: Option<(File, u64)> = None; // output file, bytes still to write
        let mut written = 0u64;

        for idx in 0..self.piece_hashes.len() as u32 {
            let data = fs::read(self.piece_path(idx))
                .await
                .with_context(|| format!("failed to open file for piece {idx}"))?;
            let mut offset = 0;
            while offset < data.len() {
                let (f, remaining) = match current.as_mut() {
                    Some((f, remaining)) if *remaining > 0 => (f, remaining),
                    _ => {
                        let Some((path, size)) = files.next() else {
                            bail!("pieces hold more data than the torrent files");
                        };
                        if let Some((mut f, _)) = current.take() {
                            f.flush().await?;
                        }
                        current = Some((self.create_output(path).await?, *size));
                        continue;
                    }
                };
                let n = (*remaining).min((data.len() - offset) as u64) as usize;
                f.write_all(&data[offset..offset + n]).await?;
                *remaining -= n as u64;
                offset += n;
                written += n as u64;
            }
        }
        if let Some((mut f, _)) = current.take() {
            f.flush().await?;
        }
        // trailing empty files
        for (path, _) in files {
            self.create_output(path).await?;
        }

        if written != self.total_length {
            bail!(
                "failed to reconstruct torrent from downloaded pieces {written} out of {} reconstructed",
                self.total_length
            );
        }
        let top = self
            .file_list
            .first()
            .and_then(|(p, _)| p.components().next())
            .map(|c| self.torrent_dir.join(c))
            .unwrap_or_else(|| self.torrent_dir.clone());
        log::info!("torrent assembled in {top:?}");
        Ok(top)
    }

    async fn create_output(&self, relative: &Path) -> Result<File> {
        let path = self.torrent_dir.join(relative);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create parent dir for path {path:?}"))?;
        }
        File::create(&path)
            .await
            .with_context(|| format!("failed to create torrent file {path:?} for merging pieces"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencoding::Value;
    use crate::metadata::metainfo::tests::single_file_metainfo;

    async fn flush_all(fm: &FileManager, content: &[u8], piece_length: usize) {
        for (idx, chunk) in content.chunks(piece_length).enumerate() {
            fm.flush(idx as u32, chunk).await.unwrap();
        }
    }

    #[tokio::test]
    async fn flush_read_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..100u8).collect();
        let m = single_file_metainfo("f.bin", &content, 32);
        let fm = FileManager::new(dir.path(), &m);

        fm.flush(1, &content[32..64]).await.unwrap();
        fm.flush(3, &[0; 4]).await.unwrap(); // corrupted

        let block = fm
            .read_block(&BlockRequest {
                piece_idx: 1,
                block_begin: 4,
                data_len: 8,
            })
            .await
            .unwrap();
        assert_eq!(block, content[36..44].to_vec());
        assert!(fm
            .read_block(&BlockRequest {
                piece_idx: 1,
                block_begin: 30,
                data_len: 8,
            })
            .await
            .is_err());

        let bitfield = Bitfield::new(m.piece_count());
        assert_eq!(fm.verify_existing(&bitfield).await, 32);
        assert_eq!(bitfield.existing_pieces(), vec![1]);
    }

    #[tokio::test]
    async fn assemble_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..100u8).collect();
        let m = single_file_metainfo("f.bin", &content, 32);
        let fm = FileManager::new(dir.path(), &m);
        flush_all(&fm, &content, 32).await;

        let path = fm.assemble().await.unwrap();
        assert_eq!(path, fm.torrent_dir().join("f.bin"));
        assert_eq!(std::fs::read(path).unwrap(), content);
    }

    #[tokio::test]
    async fn assemble_fails_on_missing_piece() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; 64];
        let m = single_file_metainfo("f.bin", &content, 32);
        let fm = FileManager::new(dir.path(), &m);
        fm.flush(0, &content[..32]).await.unwrap();
        assert!(fm.assemble().await.is_err());
    }

    #[tokio::test]
    async fn assemble_multi_file() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..50u8).collect();
        let pieces: Vec<u8> = content.chunks(16).flat_map(sha1_hash).collect();
        let torrent = Value::dict([
            ("announce", Value::str("http://t/a")),
            (
                "info",
                Value::dict([
                    ("name", Value::str("top")),
                    ("piece length", Value::Int(16)),
                    ("pieces", Value::Str(pieces)),
                    (
                        "files",
                        Value::List(vec![
                            Value::dict([
                                ("length", Value::Int(20)),
                                ("path", Value::List(vec![Value::str("a.txt")])),
                            ]),
                            Value::dict([
                                ("length", Value::Int(0)),
                                ("path", Value::List(vec![Value::str("empty")])),
                            ]),
                            Value::dict([
                                ("length", Value::Int(30)),
                                (
                                    "path",
                                    Value::List(vec![Value::str("sub"), Value::str("b.txt")]),
                                ),
                            ]),
                        ]),
                    ),
                ]),
            ),
        ]);
        let m = Metainfo::new(&torrent).unwrap();
        let fm = FileManager::new(dir.path(), &m);
        flush_all(&fm, &content, 16).await;

        let top = fm.assemble().await.unwrap();
        assert_eq!(top, fm.torrent_dir().join("top"));
        assert_eq!(std::fs::read(top.join("a.txt")).unwrap(), content[..20].to_vec());
        assert_eq!(std::fs::read(top.join("empty")).unwrap(), Vec::<u8>::new());
        assert_eq!(
            std::fs::read(top.join("sub").join("b.txt")).unwrap(),
            content[20..].to_vec()
        );
    }
}
