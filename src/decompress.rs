use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::debug;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

use crate::error::{Result, UpdateError};
use crate::util::cancel_requested;

/// Archive framing: 5 bytes of coder properties followed by the plaintext
/// length as 8 little-endian bytes, then the compressed stream.
const HEADER_LEN: usize = 13;
/// All-ones length field means "length unknown".
const UNKNOWN_LENGTH: u64 = u64::MAX;

const CHUNK: usize = 64 * 1024;

/// Stream an archived file back to plaintext at `destination`.
///
/// The declared plaintext length is not trusted blindly: a stream that ends
/// before producing it fails, while trailing bytes after the compressed
/// stream are tolerated. Cancellation aborts the decode and deletes the
/// partial output.
pub async fn decompress_file(
    source: &Path,
    destination: &Path,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<()> {
    let source = source.to_owned();
    let destination = destination.to_owned();

    // The codec is pure CPU + blocking reads; keep it off the runtime.
    tokio::task::spawn_blocking(move || decompress_blocking(&source, &destination, &cancel))
        .await
        .map_err(|e| UpdateError::DecompressFailed(format!("decode task failed: {e}")))?
}

fn decompress_blocking(
    source: &Path,
    destination: &Path,
    cancel: &Option<Arc<AtomicBool>>,
) -> Result<()> {
    let mut file = std::fs::File::open(source).map_err(|e| {
        UpdateError::FilesystemFailed(format!("unable to open {}: {e}", source.display()))
    })?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| {
        UpdateError::DecompressFailed(format!("{}: truncated header: {e}", source.display()))
    })?;
    let declared_len = u64::from_le_bytes(header[5..HEADER_LEN].try_into().unwrap());
    debug!(
        "decompress: {} declares {} plaintext bytes",
        source.display(),
        declared_len
    );

    // The decoder consumes the header itself.
    file.seek(SeekFrom::Start(0)).map_err(|e| {
        UpdateError::FilesystemFailed(format!("seek error on {}: {e}", source.display()))
    })?;
    let stream = Stream::new_lzma_decoder(u64::MAX)
        .map_err(|e| UpdateError::DecompressFailed(format!("decoder init failed: {e}")))?;
    let mut decoder = XzDecoder::new_stream(file, stream);

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            UpdateError::FilesystemFailed(format!("unable to create output dir: {e}"))
        })?;
    }
    let mut output = std::fs::File::create(destination).map_err(|e| {
        UpdateError::FilesystemFailed(format!("unable to create {}: {e}", destination.display()))
    })?;

    let mut buffer = vec![0u8; CHUNK];
    let mut produced: u64 = 0;
    loop {
        if cancel_requested(cancel) {
            drop(output);
            let _ = std::fs::remove_file(destination);
            return Err(UpdateError::Cancelled);
        }
        let read = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                drop(output);
                let _ = std::fs::remove_file(destination);
                return Err(UpdateError::DecompressFailed(format!(
                    "{}: {err}",
                    source.display()
                )));
            }
        };
        if let Err(err) = output.write_all(&buffer[..read]) {
            drop(output);
            let _ = std::fs::remove_file(destination);
            return Err(UpdateError::FilesystemFailed(format!(
                "write error on {}: {e}",
                destination.display(),
                e = err
            )));
        }
        produced += read as u64;
    }

    if declared_len != UNKNOWN_LENGTH && produced < declared_len {
        drop(output);
        let _ = std::fs::remove_file(destination);
        return Err(UpdateError::DecompressFailed(format!(
            "{}: stream ended after {produced} of {declared_len} bytes",
            source.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use xz2::write::XzEncoder;

    /// Produce an archive in the wire framing (properties + length header
    /// emitted by the encoder itself in lzma-alone mode).
    fn compress(plaintext: &[u8]) -> Vec<u8> {
        let stream = Stream::new_lzma_encoder(&xz2::stream::LzmaOptions::new_preset(6).unwrap())
            .unwrap();
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(plaintext).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn round_trips_archived_content() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("game.dat.lzma");
        let plain = dir.path().join("game.dat");
        let payload = b"vanguard content payload".repeat(100);

        std::fs::write(&archive, compress(&payload)).unwrap();
        decompress_file(&archive, &plain, None).await.unwrap();
        assert_eq!(std::fs::read(&plain).unwrap(), payload);
    }

    #[tokio::test]
    async fn truncated_stream_fails_and_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("game.dat.lzma");
        let plain = dir.path().join("game.dat");
        let payload = b"vanguard content payload".repeat(200);

        let mut bytes = compress(&payload);
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&archive, bytes).unwrap();

        let result = decompress_file(&archive, &plain, None).await;
        assert!(matches!(result, Err(UpdateError::DecompressFailed(_))));
        assert!(!plain.exists());
    }

    #[tokio::test]
    async fn short_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tiny.lzma");
        std::fs::write(&archive, [0u8; 5]).unwrap();

        let result = decompress_file(&archive, &dir.path().join("out"), None).await;
        assert!(matches!(result, Err(UpdateError::DecompressFailed(_))));
    }

    #[tokio::test]
    async fn cancellation_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("game.dat.lzma");
        let plain = dir.path().join("game.dat");
        std::fs::write(&archive, compress(&[7u8; 4096])).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        flag.store(true, Ordering::SeqCst);
        let result = decompress_file(&archive, &plain, Some(flag)).await;
        assert!(matches!(result, Err(UpdateError::Cancelled)));
        assert!(!plain.exists());
    }
}
