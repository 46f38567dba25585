use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use size::Size;

/// Maps piece space onto the declared file layout and performs all disk I/O.
///
/// The span table is computed once at construction; afterwards the only
/// mutable state is the per-piece completion status and the handle cache.
/// Verification is the scheduler's job: `write_piece` trusts its input.
pub struct FileManager {
    file_list: Vec<(PathBuf, u64)>, // path with base, declared size
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    // piece idx -> ordered spans (path, start offset in file, end offset in file)
    piece_to_files: Vec<Vec<(PathBuf, u64, u64)>>,
    pub piece_completion_status: Vec<bool>,
    file_handles: FileHandles,
}

struct FileHandles {
    handles: HashMap<PathBuf, File>,
}

impl FileHandles {
    fn new() -> Self {
        FileHandles {
            handles: HashMap::new(),
        }
    }

    fn get_file(&mut self, file_path: &PathBuf) -> Result<&mut File> {
        if !self.handles.contains_key(file_path) {
            if let Some(dir) = file_path.parent() {
                fs::create_dir_all(dir)?;
            }
            let f = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(file_path)?;
            self.handles.insert(file_path.clone(), f);
        }
        Ok(self
            .handles
            .get_mut(file_path)
            .expect("inserted right above"))
    }
}

impl FileManager {
    pub fn new(
        base_path: &Path,
        file_list: Vec<(String, u64)>,
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<FileManager> {
        if file_list.is_empty() {
            bail!("the torrent does not declare any file");
        }
        if piece_length == 0 || piece_hashes.is_empty() {
            bail!("the torrent does not declare any piece");
        }
        let total_length: u64 = file_list.iter().map(|(_, size)| *size).sum();
        let num_pieces = piece_hashes.len() as u64;
        if total_length > num_pieces * piece_length
            || total_length <= (num_pieces - 1) * piece_length
        {
            bail!(
                "the total size of all files ({total_length}) does not fit the declared {num_pieces} pieces of {piece_length} bytes"
            );
        }

        let mut fm_file_list = Vec::new();
        for (file_name, size) in file_list.iter() {
            let file_name_path = Path::new(file_name);
            if file_name_path.is_absolute()
                || file_name_path
                    .components()
                    .any(|c| c == std::path::Component::ParentDir)
            {
                bail!("the torrent declares a file with an absolute or parent-relative path: {file_name}");
            }
            fm_file_list.push((Path::new(base_path).join(file_name_path), *size));
        }

        // build the piece -> file spans table
        let mut piece_to_files = Vec::with_capacity(piece_hashes.len());
        let mut current_file_index = 0;
        let mut current_position_in_file = 0u64;
        for piece_index in 0..piece_hashes.len() {
            let mut remaining = piece_length_for(
                piece_index,
                piece_hashes.len(),
                piece_length,
                total_length,
            );
            let mut spans = Vec::new();
            while remaining > 0 {
                if current_file_index >= fm_file_list.len() {
                    bail!("piece space exceeds the declared files, the metainfo is inconsistent");
                }
                let (path, file_size) = &fm_file_list[current_file_index];
                let available = file_size - current_position_in_file;
                let take = std::cmp::min(available, remaining);
                spans.push((
                    path.clone(),
                    current_position_in_file,
                    current_position_in_file + take,
                ));
                remaining -= take;
                current_position_in_file += take;
                if current_position_in_file >= *file_size {
                    current_position_in_file = 0;
                    current_file_index += 1;
                }
            }
            piece_to_files.push(spans);
        }

        let piece_completion_status = vec![false; piece_hashes.len()];
        let mut manager = FileManager {
            file_list: fm_file_list,
            piece_hashes,
            piece_length,
            total_length,
            piece_to_files,
            piece_completion_status,
            file_handles: FileHandles::new(),
        };
        manager.preallocate_files()?;
        Ok(manager)
    }

    // create missing parent directories and grow each backing file to its
    // declared length (sparse where the filesystem allows)
    fn preallocate_files(&mut self) -> Result<()> {
        for (path, declared_size) in self.file_list.iter() {
            let f = self.file_handles.get_file(path)?;
            if f.metadata()?.len() < *declared_size {
                f.set_len(*declared_size)?;
            }
        }
        Ok(())
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_length(&self, piece_idx: usize) -> u64 {
        piece_length_for(
            piece_idx,
            self.piece_hashes.len(),
            self.piece_length,
            self.total_length,
        )
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn completed_pieces(&self) -> usize {
        self.piece_completion_status
            .iter()
            .filter(|status| **status)
            .count()
    }

    pub fn completed(&self) -> bool {
        self.completed_pieces() == self.num_pieces()
    }

    pub fn bytes_left(&self) -> u64 {
        (0..self.num_pieces())
            .filter(|idx| !self.piece_completion_status[*idx])
            .map(|idx| self.piece_length(idx))
            .sum()
    }

    /// Re-hashes whatever is already on disk and refreshes the completion
    /// status, so an interrupted download restarts where it stopped.
    pub fn refresh_completed_pieces(&mut self) {
        log::info!("checking pieces already downloaded...");
        for idx in 0..self.piece_to_files.len() {
            self.piece_completion_status[idx] = match self.read_piece_bytes(idx) {
                Ok(piece_data) => {
                    let piece_sha: [u8; 20] = Sha1::digest(&piece_data).into();
                    piece_sha == self.piece_hashes[idx]
                }
                Err(_) => false,
            };
        }
        let total_completed = self.completed_pieces();
        log::info!(
            "checking pieces already downloaded completed: {} out of {} pieces already verified ({} left)",
            total_completed,
            self.num_pieces(),
            Size::from_bytes(self.bytes_left())
        );
    }

    /// Writes a whole verified piece across its file spans. The caller is
    /// responsible for having checked the digest; a failed write leaves the
    /// piece not-completed so it can be fetched again.
    pub fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> Result<()> {
        if piece_idx >= self.piece_to_files.len() {
            bail!(
                "requested to write piece idx {} that is not in range (total pieces: {})",
                piece_idx,
                self.piece_to_files.len()
            );
        }
        if data.len() as u64 != self.piece_length(piece_idx) {
            bail!(
                "requested to write piece idx {} with {} bytes but the piece is {} bytes long",
                piece_idx,
                data.len(),
                self.piece_length(piece_idx)
            );
        }
        if self.piece_completion_status[piece_idx] {
            log::debug!("piece {piece_idx} is already on disk, skipping write");
            return Ok(());
        }
        let mut written = 0usize;
        for (file_path, start, end) in self.piece_to_files[piece_idx].iter() {
            let span_len = (end - start) as usize;
            let f = self.file_handles.get_file(file_path)?;
            f.seek(SeekFrom::Start(*start))?;
            f.write_all(&data[written..written + span_len])?;
            written += span_len;
        }
        self.piece_completion_status[piece_idx] = true;
        Ok(())
    }

    /// Reads a block out of a completed piece, for serving peer requests.
    pub fn read_block(&mut self, piece_idx: usize, begin: u64, length: u64) -> Result<Vec<u8>> {
        if piece_idx >= self.piece_to_files.len() {
            bail!(
                "requested to read piece idx {} that is not in range (total pieces: {})",
                piece_idx,
                self.piece_to_files.len()
            );
        }
        if !self.piece_completion_status[piece_idx] {
            bail!("requested to read piece idx {} that we don't have", piece_idx);
        }
        if begin + length > self.piece_length(piece_idx) {
            bail!(
                "requested to read piece idx {} range {}..{} out of the piece length {}",
                piece_idx,
                begin,
                begin + length,
                self.piece_length(piece_idx)
            );
        }
        let mut block = Vec::with_capacity(length as usize);
        let mut span_start_in_piece = 0u64;
        for (file_path, start, end) in self.piece_to_files[piece_idx].iter() {
            let span_len = end - start;
            let span_end_in_piece = span_start_in_piece + span_len;
            if span_end_in_piece > begin && span_start_in_piece < begin + length {
                let read_from = std::cmp::max(begin, span_start_in_piece);
                let read_to = std::cmp::min(begin + length, span_end_in_piece);
                let f = self.file_handles.get_file(file_path)?;
                f.seek(SeekFrom::Start(start + (read_from - span_start_in_piece)))?;
                let mut buf = vec![0u8; (read_to - read_from) as usize];
                f.read_exact(&mut buf)?;
                block.append(&mut buf);
            }
            span_start_in_piece = span_end_in_piece;
        }
        Ok(block)
    }

    fn read_piece_bytes(&mut self, piece_idx: usize) -> Result<Vec<u8>> {
        let mut piece_buf = Vec::new();
        for (file_path, start, end) in self.piece_to_files[piece_idx].clone() {
            let f = self.file_handles.get_file(&file_path)?;
            f.seek(SeekFrom::Start(start))?;
            let mut buf = vec![0u8; (end - start) as usize];
            f.read_exact(&mut buf)?;
            piece_buf.append(&mut buf);
        }
        Ok(piece_buf)
    }
}

fn piece_length_for(piece_idx: usize, num_pieces: usize, piece_length: u64, total: u64) -> u64 {
    if piece_idx + 1 == num_pieces {
        total - piece_length * (num_pieces as u64 - 1)
    } else {
        piece_length
    }
}

#[cfg(test)]
mod tests {
    use super::FileManager;
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_dir(name: &str) -> PathBuf {
        let seq = TEST_DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "undertow-fm-test-{}-{}-{}",
            name,
            std::process::id(),
            seq
        ))
    }

    fn hashes_for(pieces: &[&[u8]]) -> Vec<[u8; 20]> {
        pieces.iter().map(|p| Sha1::digest(p).into()).collect()
    }

    #[test]
    fn pieces_to_files_spans_across_file_boundaries() {
        let dir = test_dir("spans");
        let file_list = vec![
            ("f1".to_string(), 5),
            ("f2".to_string(), 20),
            ("f3".to_string(), 5),
        ];
        let res = FileManager::new(&dir, file_list, 10, vec![[0xaa; 20]; 3]).unwrap();
        assert_eq!(
            res.piece_to_files,
            vec![
                vec![(dir.join("f1"), 0, 5), (dir.join("f2"), 0, 5)],
                vec![(dir.join("f2"), 5, 15)],
                vec![(dir.join("f2"), 15, 20), (dir.join("f3"), 0, 5)],
            ]
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn pieces_to_files_short_last_piece() {
        // 40000 bytes in 16384-byte pieces: 16384, 16384, 7232
        let dir = test_dir("short-last");
        let file_list = vec![("f1".to_string(), 40000)];
        let res = FileManager::new(&dir, file_list, 16384, vec![[0xaa; 20]; 3]).unwrap();
        assert_eq!(
            res.piece_to_files,
            vec![
                vec![(dir.join("f1"), 0, 16384)],
                vec![(dir.join("f1"), 16384, 32768)],
                vec![(dir.join("f1"), 32768, 40000)],
            ]
        );
        assert_eq!(res.piece_length(0), 16384);
        assert_eq!(res.piece_length(2), 7232);
        assert_eq!(res.bytes_left(), 40000);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_absolute_and_parent_paths() {
        let dir = test_dir("bad-paths");
        assert!(FileManager::new(
            &dir,
            vec![("/absolute/f1".to_string(), 10)],
            10,
            vec![[0xaa; 20]; 1],
        )
        .is_err());
        assert!(FileManager::new(
            &dir,
            vec![("../escape".to_string(), 10)],
            10,
            vec![[0xaa; 20]; 1],
        )
        .is_err());
    }

    #[test]
    fn rejects_inconsistent_piece_space() {
        let dir = test_dir("inconsistent");
        // 15 bytes cannot be covered by 3 pieces of 10 bytes, nor by 1
        assert!(
            FileManager::new(&dir, vec![("f1".to_string(), 15)], 10, vec![[0xaa; 20]; 3]).is_err()
        );
        assert!(
            FileManager::new(&dir, vec![("f1".to_string(), 15)], 10, vec![[0xaa; 20]; 1]).is_err()
        );
    }

    #[test]
    fn preallocates_declared_lengths() {
        let dir = test_dir("prealloc");
        let file_list = vec![("a".to_string(), 10000), ("sub/b".to_string(), 25000)];
        let _res =
            FileManager::new(&dir, file_list, 16384, vec![[0xaa; 20]; 3]).unwrap();
        assert_eq!(std::fs::metadata(dir.join("a")).unwrap().len(), 10000);
        assert_eq!(std::fs::metadata(dir.join("sub/b")).unwrap().len(), 25000);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn write_then_read_block_round_trip() {
        let dir = test_dir("round-trip");
        let piece0: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let piece1: Vec<u8> = (0..16384u32).map(|i| (i % 241) as u8).collect();
        let hashes = hashes_for(&[&piece0[..], &piece1[..]]);
        let mut fm =
            FileManager::new(&dir, vec![("data.bin".to_string(), 32768)], 16384, hashes).unwrap();

        // reads are gated on completion
        assert!(fm.read_block(0, 0, 16).is_err());

        fm.write_piece(0, &piece0).unwrap();
        fm.write_piece(1, &piece1).unwrap();
        assert!(fm.completed());
        assert_eq!(fm.bytes_left(), 0);

        assert_eq!(fm.read_block(0, 0, 16384).unwrap(), piece0);
        assert_eq!(fm.read_block(1, 100, 50).unwrap(), piece1[100..150].to_vec());
        // out of range
        assert!(fm.read_block(0, 16380, 16).is_err());

        let on_disk = std::fs::read(dir.join("data.bin")).unwrap();
        assert_eq!(on_disk.len(), 32768);
        assert_eq!(&on_disk[..16384], piece0.as_slice());
        assert_eq!(&on_disk[16384..], piece1.as_slice());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn multi_file_write_lands_bytes_in_the_right_files() {
        // files A (10000 B) and B (25000 B), piece length 16384:
        // piece 0 = A + B[0..6384], piece 1 = B[6384..22768], piece 2 = B[22768..25000]
        let dir = test_dir("multi-file");
        let payload: Vec<u8> = (0..35000u32).map(|i| (i % 199) as u8).collect();
        let pieces: Vec<&[u8]> = vec![
            &payload[..16384],
            &payload[16384..32768],
            &payload[32768..],
        ];
        let hashes = hashes_for(&pieces);
        let file_list = vec![("a".to_string(), 10000), ("b".to_string(), 25000)];
        let mut fm = FileManager::new(&dir, file_list, 16384, hashes).unwrap();
        assert_eq!(
            fm.piece_to_files,
            vec![
                vec![(dir.join("a"), 0, 10000), (dir.join("b"), 0, 6384)],
                vec![(dir.join("b"), 6384, 22768)],
                vec![(dir.join("b"), 22768, 25000)],
            ]
        );

        fm.write_piece(0, pieces[0]).unwrap();
        let a = std::fs::read(dir.join("a")).unwrap();
        assert_eq!(a, payload[..10000].to_vec());
        let b = std::fs::read(dir.join("b")).unwrap();
        assert_eq!(&b[..6384], &payload[10000..16384]);

        fm.write_piece(1, pieces[1]).unwrap();
        fm.write_piece(2, pieces[2]).unwrap();
        let a = std::fs::read(dir.join("a")).unwrap();
        let b = std::fs::read(dir.join("b")).unwrap();
        assert_eq!(a.len(), 10000);
        assert_eq!(b.len(), 25000);
        let mut concatenated = a;
        concatenated.extend_from_slice(&b);
        assert_eq!(concatenated, payload);

        // a block read spanning the file boundary
        assert_eq!(
            fm.read_block(0, 9990, 20).unwrap(),
            payload[9990..10010].to_vec()
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn refresh_completed_pieces_resumes_from_disk() {
        let dir = test_dir("resume");
        let piece0: Vec<u8> = vec![7; 16384];
        let piece1: Vec<u8> = vec![9; 16384];
        let hashes = hashes_for(&[&piece0[..], &piece1[..]]);
        {
            let mut fm = FileManager::new(
                &dir,
                vec![("data.bin".to_string(), 32768)],
                16384,
                hashes.clone(),
            )
            .unwrap();
            fm.write_piece(0, &piece0).unwrap();
        }
        // a new manager over the same directory discovers the finished piece
        let mut fm =
            FileManager::new(&dir, vec![("data.bin".to_string(), 32768)], 16384, hashes).unwrap();
        fm.refresh_completed_pieces();
        assert_eq!(fm.piece_completion_status, vec![true, false]);
        assert_eq!(fm.bytes_left(), 16384);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
